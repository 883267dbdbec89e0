//! Per-host local administrator enumeration
//!
//! The structured member query runs first. A transport failure marks the
//! host dead straight away; any other failure falls back once to the legacy
//! provider, and a failure there marks the host dead too.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::common_types::{AdminGrant, Host, ObjectType, SidUse};
use crate::errors::{CollectorError, Result};
use crate::host_gate::HostGate;
use crate::identity::{IdentityResolver, MemberHint};
use crate::ldap_utils::{sid_prefix, sid_rid};
use crate::local_group::{LegacyGroupProvider, LocalGroupApi, LocalGroupMember, ADMINISTRATORS_GROUP};

/// RID of the built-in local Administrator account
pub const BUILTIN_ADMINISTRATOR_RID: u32 = 500;

/// Result of scanning one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Dead,
    Alive(Vec<AdminGrant>),
}

/// Prefix of the host's own machine SID: the RID-500 member outside `domain_sid`
pub fn machine_sid(members: &[LocalGroupMember], domain_sid: Option<&str>) -> Option<String> {
    members
        .iter()
        .filter_map(|member| member.sid.as_deref())
        .find(|sid| sid_rid(sid) == Some(BUILTIN_ADMINISTRATOR_RID) && sid_prefix(sid) != domain_sid)
        .and_then(sid_prefix)
        .map(str::to_string)
}

/// Members worth resolving, with the type their SID use implies.
///
/// Drops unqualified names, empty account labels, `NT Authority` entries,
/// machine-local accounts and SID uses other than user, group or computer.
pub fn filter_members<'a>(
    members: &'a [LocalGroupMember],
    domain_sid: Option<&str>,
) -> Vec<(&'a str, &'a LocalGroupMember, ObjectType)> {
    let machine = machine_sid(members, domain_sid);

    members
        .iter()
        .filter_map(|member| {
            let (_, account) = member.domain_and_name.split_once('\\')?;
            if account.is_empty() {
                return None;
            }
            if member
                .domain_and_name
                .to_lowercase()
                .starts_with("nt authority")
            {
                return None;
            }
            let sid = member.sid.as_deref()?;
            if machine.is_some() && sid_prefix(sid) == machine.as_deref() {
                return None;
            }
            let object_type = SidUse::from_code(member.sid_use)?.object_type()?;
            Some((sid, member, object_type))
        })
        .collect()
}

pub struct AdminResolver {
    gate: Arc<HostGate>,
    api: Arc<dyn LocalGroupApi>,
    legacy: Arc<dyn LegacyGroupProvider>,
    identities: Arc<IdentityResolver>,
    group: String,
}

impl AdminResolver {
    pub fn new(
        gate: Arc<HostGate>,
        api: Arc<dyn LocalGroupApi>,
        legacy: Arc<dyn LegacyGroupProvider>,
        identities: Arc<IdentityResolver>,
    ) -> Self {
        Self {
            gate,
            api,
            legacy,
            identities,
            group: ADMINISTRATORS_GROUP.to_string(),
        }
    }

    /// Probe, then enumerate. Every failure ends in `Dead`.
    pub async fn scan(&self, host: &Host) -> HostOutcome {
        let name = &host.dns_host_name;
        if !self.gate.is_alive(name).await {
            debug!("{} did not respond to probe", name);
            return HostOutcome::Dead;
        }

        match self
            .enumerate_admins(host, host.domain_sid(), &host.domain)
            .await
        {
            Ok(grants) => HostOutcome::Alive(grants),
            Err(e) if e.is_host_unreachable() => {
                debug!("{} unreachable: {}", name, e);
                HostOutcome::Dead
            }
            Err(e) => {
                error!("Unexpected failure enumerating {}: {}", name, e);
                HostOutcome::Dead
            }
        }
    }

    pub async fn enumerate_admins(
        &self,
        host: &Host,
        domain_sid: Option<&str>,
        scope: &str,
    ) -> Result<Vec<AdminGrant>> {
        let name = &host.dns_host_name;
        match self.api.get_members(name, &self.group).await {
            Ok(members) => Ok(self.grants_from_members(name, &members, domain_sid, scope).await),
            Err(e) if e.is_unsupported() => {
                warn!("Structured query failed on {} ({}), using legacy provider", name, e);
                self.legacy_grants(name, scope).await
            }
            Err(e) => Err(e),
        }
    }

    async fn grants_from_members(
        &self,
        server: &str,
        members: &[LocalGroupMember],
        domain_sid: Option<&str>,
        scope: &str,
    ) -> Vec<AdminGrant> {
        let mut grants = Vec::new();
        for (sid, member, expected) in filter_members(members, domain_sid) {
            let hint = MemberHint {
                domain_and_name: &member.domain_and_name,
                expected,
            };
            match self.identities.resolve(sid, scope, Some(hint)).await {
                Ok(record) => grants.extend(AdminGrant::new(server, &record)),
                Err(e) => debug!("Dropping {} on {}: {}", sid, server, e),
            }
        }
        grants
    }

    async fn legacy_grants(&self, server: &str, scope: &str) -> Result<Vec<AdminGrant>> {
        let sids = self
            .legacy
            .member_sids(server, &self.group)
            .await
            .map_err(|e| CollectorError::HostUnreachable(format!("{}: {}", server, e)))?;

        let mut grants = Vec::new();
        for sid in sids {
            match self.identities.resolve(&sid, scope, None).await {
                Ok(record) => grants.extend(AdminGrant::new(server, &record)),
                Err(e) => debug!("Dropping {} on {}: {}", sid, server, e),
            }
        }
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(sid: Option<&str>, name: &str, sid_use: i32) -> LocalGroupMember {
        LocalGroupMember {
            sid: sid.map(str::to_string),
            domain_and_name: name.to_string(),
            sid_use,
        }
    }

    const DOMAIN_SID: &str = "S-1-5-21-10-20-30";

    #[test]
    fn test_machine_sid_detection() {
        let members = vec![
            member(Some("S-1-5-21-10-20-30-500"), "CORP\\Administrator", 1),
            member(Some("S-1-5-21-77-88-99-500"), "WS01\\Administrator", 1),
        ];
        assert_eq!(
            machine_sid(&members, Some(DOMAIN_SID)).as_deref(),
            Some("S-1-5-21-77-88-99")
        );
        assert_eq!(machine_sid(&members[..1], Some(DOMAIN_SID)), None);
    }

    #[test]
    fn test_filter_excludes_machine_accounts() {
        let members = vec![
            member(Some("S-1-5-21-77-88-99-500"), "WS01\\Administrator", 1),
            member(Some("S-1-5-21-77-88-99-1001"), "WS01\\localadmin", 1),
            member(Some("S-1-5-21-10-20-30-512"), "CORP\\Domain Admins", 2),
            member(Some("S-1-5-21-10-20-30-1104"), "CORP\\alice", 1),
        ];
        let kept: Vec<&str> = filter_members(&members, Some(DOMAIN_SID))
            .into_iter()
            .map(|(sid, _, _)| sid)
            .collect();
        assert_eq!(kept, vec!["S-1-5-21-10-20-30-512", "S-1-5-21-10-20-30-1104"]);
    }

    #[test]
    fn test_filter_drops_unqualified_and_special_entries() {
        let members = vec![
            member(Some("S-1-5-21-10-20-30-1"), "noqualifier", 1),
            member(Some("S-1-5-21-10-20-30-2"), "CORP\\", 1),
            member(Some("S-1-5-20"), "NT AUTHORITY\\NETWORK SERVICE", 5),
            member(None, "CORP\\ghost", 1),
            member(Some("S-1-5-21-10-20-30-3"), "CORP\\alias", 4),
            member(Some("S-1-5-21-10-20-30-4"), "CORP\\WS05$", 9),
        ];
        let kept = filter_members(&members, Some(DOMAIN_SID));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "S-1-5-21-10-20-30-4");
        assert_eq!(kept[0].2, ObjectType::Computer);
    }
}
