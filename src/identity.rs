//! Identity resolution
//!
//! Turns SIDs into display names and principal types. Lookup order:
//!
//! 1. Well-known SID table (no cache or network round-trip)
//! 2. Run cache keyed by (SID, domain scope)
//! 3. Object store
//! 4. Live directory lookup, persisted to the store and cache
//! 5. Heuristic built from the member's `DOMAIN\account` name
//! 6. Generic SID translation: a directory object found in another domain is
//!    used as is, a bare `DOMAIN\account` goes through the same heuristic
//!
//! Every successful result is cached first-write-wins, so a key resolves to
//! the same record for the rest of the run.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{IdentityKey, ScanCaches};
use crate::common_types::{IdentityRecord, ObjectType};
use crate::directory::{DirectoryObject, DirectorySource, DomainPartition, NameTranslator, SidTranslation};
use crate::errors::{CollectorError, Result};
use crate::object_store::ObjectStore;

/// Reserved authority and built-in alias SIDs
pub const WELL_KNOWN_SIDS: &[(&str, &str)] = &[
    ("S-1-0", "Null Authority"),
    ("S-1-0-0", "Nobody"),
    ("S-1-1", "World Authority"),
    ("S-1-1-0", "Everyone"),
    ("S-1-2", "Local Authority"),
    ("S-1-2-0", "Local"),
    ("S-1-2-1", "Console Logon"),
    ("S-1-3", "Creator Authority"),
    ("S-1-3-0", "Creator Owner"),
    ("S-1-3-1", "Creator Group"),
    ("S-1-3-2", "Creator Owner Server"),
    ("S-1-3-3", "Creator Group Server"),
    ("S-1-3-4", "Owner Rights"),
    ("S-1-4", "Non-unique Authority"),
    ("S-1-5", "NT Authority"),
    ("S-1-5-1", "Dialup"),
    ("S-1-5-2", "Network"),
    ("S-1-5-3", "Batch"),
    ("S-1-5-4", "Interactive"),
    ("S-1-5-6", "Service"),
    ("S-1-5-7", "Anonymous"),
    ("S-1-5-8", "Proxy"),
    ("S-1-5-9", "Enterprise Domain Controllers"),
    ("S-1-5-10", "Principal Self"),
    ("S-1-5-11", "Authenticated Users"),
    ("S-1-5-12", "Restricted Code"),
    ("S-1-5-13", "Terminal Server Users"),
    ("S-1-5-14", "Remote Interactive Logon"),
    ("S-1-5-15", "This Organization"),
    ("S-1-5-17", "This Organization"),
    ("S-1-5-18", "Local System"),
    ("S-1-5-19", "NT Authority"),
    ("S-1-5-20", "NT Authority"),
    ("S-1-5-80-0", "All Services"),
    ("S-1-5-32-544", "BUILTIN\\Administrators"),
    ("S-1-5-32-545", "BUILTIN\\Users"),
    ("S-1-5-32-546", "BUILTIN\\Guests"),
    ("S-1-5-32-547", "BUILTIN\\Power Users"),
    ("S-1-5-32-548", "BUILTIN\\Account Operators"),
    ("S-1-5-32-549", "BUILTIN\\Server Operators"),
    ("S-1-5-32-550", "BUILTIN\\Print Operators"),
    ("S-1-5-32-551", "BUILTIN\\Backup Operators"),
    ("S-1-5-32-552", "BUILTIN\\Replicators"),
    ("S-1-5-32-554", "BUILTIN\\Pre-Windows 2000 Compatible Access"),
    ("S-1-5-32-555", "BUILTIN\\Remote Desktop Users"),
    ("S-1-5-32-556", "BUILTIN\\Network Configuration Operators"),
    ("S-1-5-32-557", "BUILTIN\\Incoming Forest Trust Builders"),
    ("S-1-5-32-558", "BUILTIN\\Performance Monitor Users"),
    ("S-1-5-32-559", "BUILTIN\\Performance Log Users"),
    ("S-1-5-32-560", "BUILTIN\\Windows Authorization Access Group"),
    ("S-1-5-32-561", "BUILTIN\\Terminal Server License Servers"),
    ("S-1-5-32-562", "BUILTIN\\Distributed COM Users"),
    ("S-1-5-32-569", "BUILTIN\\Cryptographic Operators"),
    ("S-1-5-32-573", "BUILTIN\\Event Log Readers"),
    ("S-1-5-32-574", "BUILTIN\\Certificate Service DCOM Access"),
    ("S-1-5-32-575", "BUILTIN\\RDS Remote Access Servers"),
    ("S-1-5-32-576", "BUILTIN\\RDS Endpoint Servers"),
    ("S-1-5-32-577", "BUILTIN\\RDS Management Servers"),
    ("S-1-5-32-578", "BUILTIN\\Hyper-V Administrators"),
    ("S-1-5-32-579", "BUILTIN\\Access Control Assistance Operators"),
    ("S-1-5-32-580", "BUILTIN\\Remote Management Users"),
];

pub fn well_known_name(sid: &str) -> Option<&'static str> {
    WELL_KNOWN_SIDS
        .iter()
        .find(|(known, _)| *known == sid)
        .map(|(_, name)| *name)
}

/// NetBIOS domain label -> DNS domain name
#[derive(Default)]
pub struct DomainAliases {
    map: DashMap<String, String>,
}

impl DomainAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, netbios_name: &str, dns_name: &str) {
        self.map
            .entry(netbios_name.to_uppercase())
            .or_insert_with(|| dns_name.to_string());
    }

    pub fn load(&self, partitions: &[DomainPartition]) {
        for partition in partitions {
            self.insert(&partition.netbios_name, &partition.dns_name);
        }
    }

    /// Mapped DNS name, or the label itself when no alias is known
    pub fn resolve(&self, label: &str) -> String {
        self.map
            .get(&label.to_uppercase())
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| label.to_string())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// What the host reported alongside a member SID
#[derive(Debug, Clone, Copy)]
pub struct MemberHint<'a> {
    pub domain_and_name: &'a str,
    pub expected: ObjectType,
}

pub struct IdentityResolver {
    store: Arc<dyn ObjectStore>,
    directory: Arc<dyn DirectorySource>,
    translator: Arc<dyn NameTranslator>,
    caches: Arc<ScanCaches>,
    aliases: Arc<DomainAliases>,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        directory: Arc<dyn DirectorySource>,
        translator: Arc<dyn NameTranslator>,
        caches: Arc<ScanCaches>,
        aliases: Arc<DomainAliases>,
    ) -> Self {
        Self {
            store,
            directory,
            translator,
            caches,
            aliases,
        }
    }

    pub async fn resolve(
        &self,
        sid: &str,
        scope: &str,
        hint: Option<MemberHint<'_>>,
    ) -> Result<IdentityRecord> {
        if let Some(name) = well_known_name(sid) {
            return Ok(IdentityRecord {
                display_name: name.to_string(),
                object_type: ObjectType::Group,
                sid: sid.to_string(),
            });
        }

        let key = IdentityKey::new(sid, scope);
        if let Some(record) = self.caches.identities.get(&key) {
            return Ok(record);
        }

        if let Some(object) = self.find_stored(sid, scope, hint.map(|h| h.expected)) {
            return Ok(self.remember(key, object.identity()));
        }

        match self.directory.find_by_sid(sid, scope).await {
            Ok(Some(object)) => {
                let stored = match self.store.insert(&object, scope) {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!("Failed to persist {}: {}", sid, e);
                        object
                    }
                };
                return Ok(self.remember(key, stored.identity()));
            }
            Ok(None) => debug!("{} not found in {}", sid, scope),
            Err(e) => debug!("Directory lookup of {} in {} failed: {}", sid, scope, e),
        }

        if let Some(hint) = hint {
            if let Some(record) = self.heuristic_record(sid, hint.domain_and_name, hint.expected) {
                return Ok(self.remember(key, record));
            }
        }

        match self.translate_sid(sid, scope).await {
            Some(SidTranslation::Object(object)) => {
                return Ok(self.remember(key, object.identity()));
            }
            Some(SidTranslation::Account(name)) => {
                let expected = if name.ends_with('$') {
                    ObjectType::Computer
                } else {
                    ObjectType::User
                };
                if let Some(record) = self.heuristic_record(sid, &name, expected) {
                    return Ok(self.remember(key, record));
                }
            }
            None => {}
        }

        Err(CollectorError::IdentityUnresolvable(sid.to_string()))
    }

    fn find_stored(
        &self,
        sid: &str,
        scope: &str,
        expected: Option<ObjectType>,
    ) -> Option<DirectoryObject> {
        let found = match expected {
            Some(ObjectType::User) => self.store.find_user_by_sid(sid, scope),
            Some(ObjectType::Group) => self.store.find_group_by_sid(sid, scope),
            Some(ObjectType::Computer) => self.store.find_computer_by_sid(sid, scope),
            None => self.store.find_by_sid(sid, scope),
        };
        found.unwrap_or_else(|e| {
            warn!("Object store lookup of {} failed: {}", sid, e);
            None
        })
    }

    fn remember(&self, key: IdentityKey, record: IdentityRecord) -> IdentityRecord {
        self.caches.identities.get_or_insert(key, record)
    }

    /// Build a record from `DOMAIN\account` when the directory has no answer.
    ///
    /// Users and groups become `ACCOUNT@DOMAIN` typed user; anything else is
    /// taken as a machine account and becomes `HOST.DOMAIN` typed computer.
    pub fn heuristic_record(
        &self,
        sid: &str,
        domain_and_name: &str,
        expected: ObjectType,
    ) -> Option<IdentityRecord> {
        let (label, account) = domain_and_name.split_once('\\')?;
        if label.is_empty() || account.is_empty() {
            return None;
        }
        let domain = self.aliases.resolve(label);

        let (display_name, object_type) = match expected {
            ObjectType::User | ObjectType::Group => {
                (format!("{}@{}", account, domain), ObjectType::User)
            }
            ObjectType::Computer => {
                let host = account.strip_suffix('$').unwrap_or(account);
                (format!("{}.{}", host, domain), ObjectType::Computer)
            }
        };

        Some(IdentityRecord {
            display_name: display_name.to_uppercase(),
            object_type,
            sid: sid.to_string(),
        })
    }

    /// Generic translation outside `searched`, cached per SID including failures
    pub async fn translate_sid(&self, sid: &str, searched: &str) -> Option<SidTranslation> {
        if let Some(cached) = self.caches.sid_names.get(&sid.to_string()) {
            return cached;
        }
        let name = match self.translator.sid_to_name(sid, searched).await {
            Ok(name) => name,
            Err(e) => {
                debug!("Translation of {} failed: {}", sid, e);
                None
            }
        };
        if name.is_none() {
            debug!("Invalid SID {}", sid);
        }
        self.caches.sid_names.get_or_insert(sid.to_string(), name)
    }

    /// Account name to SID within `domain`
    pub async fn translate_name(&self, domain: &str, name: &str) -> Option<String> {
        match self.translator.name_to_sid(domain, name).await {
            Ok(sid) => sid,
            Err(e) => {
                debug!("Translation of {}\\{} failed: {}", domain, name, e);
                None
            }
        }
    }
}
