//! Common Types Module
//!
//! Shared types used across the collection pipeline: principal types, the
//! SID-use classification reported by local group queries, hosts, resolved
//! identities and the admin grants that make up the output.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ldap_utils::sid_prefix;

/// Principal type of a resolved identity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    User,
    Group,
    Computer,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::User => "user",
            ObjectType::Group => "group",
            ObjectType::Computer => "computer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(ObjectType::User),
            "group" => Some(ObjectType::Group),
            "computer" => Some(ObjectType::Computer),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SID_NAME_USE classification returned with each local group member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidUse {
    User = 1,
    Group = 2,
    Domain = 3,
    Alias = 4,
    WellKnownGroup = 5,
    DeletedAccount = 6,
    Invalid = 7,
    Unknown = 8,
    Computer = 9,
}

impl SidUse {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(SidUse::User),
            2 => Some(SidUse::Group),
            3 => Some(SidUse::Domain),
            4 => Some(SidUse::Alias),
            5 => Some(SidUse::WellKnownGroup),
            6 => Some(SidUse::DeletedAccount),
            7 => Some(SidUse::Invalid),
            8 => Some(SidUse::Unknown),
            9 => Some(SidUse::Computer),
            _ => None,
        }
    }

    /// Only users, groups and computers produce admin grants
    pub fn object_type(&self) -> Option<ObjectType> {
        match self {
            SidUse::User => Some(ObjectType::User),
            SidUse::Group => Some(ObjectType::Group),
            SidUse::Computer => Some(ObjectType::Computer),
            _ => None,
        }
    }
}

/// sAMAccountType values (MS-ADTS 2.2.16)
pub mod sam_account_type {
    pub const GROUP_OBJECT: u32 = 268_435_456;
    pub const NON_SECURITY_GROUP_OBJECT: u32 = 268_435_457;
    pub const ALIAS_OBJECT: u32 = 536_870_912;
    pub const NON_SECURITY_ALIAS_OBJECT: u32 = 536_870_913;
    pub const USER_OBJECT: u32 = 805_306_368;
    pub const MACHINE_ACCOUNT: u32 = 805_306_369;
    pub const TRUST_ACCOUNT: u32 = 805_306_370;
}

/// Map an sAMAccountType value to the principal type it denotes
pub fn object_type_from_sam_account_type(value: u32) -> Option<ObjectType> {
    use sam_account_type::*;
    match value {
        GROUP_OBJECT | NON_SECURITY_GROUP_OBJECT | ALIAS_OBJECT | NON_SECURITY_ALIAS_OBJECT => {
            Some(ObjectType::Group)
        }
        USER_OBJECT | TRUST_ACCOUNT => Some(ObjectType::User),
        MACHINE_ACCOUNT => Some(ObjectType::Computer),
        _ => None,
    }
}

/// Liveness state of a host as seen by the host gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Unknown,
    Alive,
    Dead,
}

impl From<bool> for Liveness {
    fn from(alive: bool) -> Self {
        if alive {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }
}

/// A computer targeted by live enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// DNS-resolvable name used for probing and querying
    pub dns_host_name: String,
    /// Computer account SID, when known
    pub sid: Option<String>,
    /// Owning domain (DNS name)
    pub domain: String,
}

impl Host {
    pub fn new(dns_host_name: impl Into<String>, sid: Option<String>, domain: impl Into<String>) -> Self {
        Self {
            dns_host_name: dns_host_name.into(),
            sid,
            domain: domain.into(),
        }
    }

    /// Domain SID prefix derived from the computer account SID
    pub fn domain_sid(&self) -> Option<&str> {
        self.sid.as_deref().and_then(sid_prefix)
    }
}

/// A resolved display name and type for a SID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub display_name: String,
    pub object_type: ObjectType,
    pub sid: String,
}

/// A discovered local-administrator relationship; the unit of output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminGrant {
    pub server: String,
    pub principal_name: String,
    pub principal_type: ObjectType,
}

impl AdminGrant {
    /// Builds a grant, rejecting empty server or principal names.
    pub fn new(server: impl Into<String>, record: &IdentityRecord) -> Option<Self> {
        let server = server.into();
        if server.is_empty() || record.display_name.is_empty() {
            return None;
        }
        Some(Self {
            server,
            principal_name: record.display_name.clone(),
            principal_type: record.object_type,
        })
    }

    /// Parameter pair submitted to the transactional endpoint
    pub fn to_param(&self) -> GrantParam {
        GrantParam {
            account: self.server.clone(),
            principal: self.principal_name.clone(),
        }
    }
}

/// `{account, principal}` parameter object for batched statements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantParam {
    pub account: String,
    pub principal: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, object_type: ObjectType) -> IdentityRecord {
        IdentityRecord {
            display_name: name.to_string(),
            object_type,
            sid: "S-1-5-21-1-2-3-1104".to_string(),
        }
    }

    #[test]
    fn test_sid_use_classification() {
        assert_eq!(SidUse::from_code(1).and_then(|s| s.object_type()), Some(ObjectType::User));
        assert_eq!(SidUse::from_code(2).and_then(|s| s.object_type()), Some(ObjectType::Group));
        assert_eq!(SidUse::from_code(9).and_then(|s| s.object_type()), Some(ObjectType::Computer));
        assert_eq!(SidUse::from_code(4).and_then(|s| s.object_type()), None);
        assert_eq!(SidUse::from_code(5).and_then(|s| s.object_type()), None);
        assert_eq!(SidUse::from_code(42), None);
    }

    #[test]
    fn test_sam_account_type_mapping() {
        assert_eq!(object_type_from_sam_account_type(805_306_368), Some(ObjectType::User));
        assert_eq!(object_type_from_sam_account_type(805_306_369), Some(ObjectType::Computer));
        assert_eq!(object_type_from_sam_account_type(805_306_370), Some(ObjectType::User));
        assert_eq!(object_type_from_sam_account_type(268_435_456), Some(ObjectType::Group));
        assert_eq!(object_type_from_sam_account_type(536_870_913), Some(ObjectType::Group));
        assert_eq!(object_type_from_sam_account_type(0), None);
    }

    #[test]
    fn test_host_domain_sid() {
        let host = Host::new("ws01.corp.local", Some("S-1-5-21-10-20-30-1105".into()), "corp.local");
        assert_eq!(host.domain_sid(), Some("S-1-5-21-10-20-30"));

        let host = Host::new("ws02.corp.local", None, "corp.local");
        assert_eq!(host.domain_sid(), None);
    }

    #[test]
    fn test_grant_rejects_empty_names() {
        assert!(AdminGrant::new("", &record("ALICE@CORP.LOCAL", ObjectType::User)).is_none());
        assert!(AdminGrant::new("ws01", &record("", ObjectType::User)).is_none());
    }

    #[test]
    fn test_grant_param() {
        let grant = AdminGrant::new("ws01.corp.local", &record("IT ADMINS@CORP.LOCAL", ObjectType::Group))
            .unwrap();
        assert_eq!(grant.principal_type.as_str(), "group");

        let param = grant.to_param();
        assert_eq!(param.account, "ws01.corp.local");
        assert_eq!(param.principal, "IT ADMINS@CORP.LOCAL");
    }

    #[test]
    fn test_object_type_serde_lowercase() {
        let json = serde_json::to_string(&ObjectType::Computer).unwrap();
        assert_eq!(json, "\"computer\"");
        assert_eq!(ObjectType::parse("GROUP"), Some(ObjectType::Group));
    }
}
