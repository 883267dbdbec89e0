//! Directory access
//!
//! Paged, timeout-bounded searches against the directory service, conversion
//! of result entries into typed objects, and SID/name translation.
//!
//! Each domain gets one bound ldap3 connection, opened on first use and
//! shared by every search against that domain. A connection that fails at the
//! transport level is dropped and reopened by the next search.

use async_trait::async_trait;
use ldap3::controls::{ControlParser, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cache::SharedCache;
use crate::common_types::{object_type_from_sam_account_type, Host, IdentityRecord, ObjectType};
use crate::config::LdapSettings;
use crate::errors::{CollectorError, Result};
use crate::ldap_helpers::{attr_lists, attrs, filters, SearchEntryExt};
use crate::ldap_utils::{domain_from_dn, domain_to_base_dn};
use crate::secure_types::Credentials;

/// Simple Paged Results control (RFC 2696)
const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// A principal or computer read from the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    pub sid: String,
    pub display_name: String,
    pub object_type: ObjectType,
    /// DNS domain name derived from the DN
    pub domain: String,
    pub sam_account_name: String,
    pub dns_host_name: Option<String>,
    pub distinguished_name: String,
}

impl DirectoryObject {
    /// Convert a search entry; None when the SID, account type or DN domain is missing.
    ///
    /// Users and groups are named `SAM@DOMAIN`. Computers use their DNS host
    /// name, or `SAM-without-$.DOMAIN` when none is published.
    pub fn from_entry(entry: &SearchEntry) -> Option<Self> {
        let sid = entry.get_object_sid()?;
        let object_type = entry
            .get_optional_u32_attr(attrs::SAM_ACCOUNT_TYPE)
            .and_then(object_type_from_sam_account_type)?;
        let distinguished_name = entry.get_dn();
        let domain = domain_from_dn(&distinguished_name)?;
        let sam_account_name = entry.get_string_attr(attrs::SAM_ACCOUNT_NAME);
        let dns_host_name = entry
            .get_optional_attr(attrs::DNS_HOST_NAME)
            .filter(|name| !name.is_empty());

        let display_name = match object_type {
            ObjectType::Computer => match &dns_host_name {
                Some(dns) => dns.to_uppercase(),
                None => format!("{}.{}", sam_account_name.trim_end_matches('$'), domain).to_uppercase(),
            },
            ObjectType::User | ObjectType::Group => {
                format!("{}@{}", sam_account_name, domain).to_uppercase()
            }
        };

        Some(Self {
            sid,
            display_name,
            object_type,
            domain,
            sam_account_name,
            dns_host_name,
            distinguished_name,
        })
    }

    pub fn identity(&self) -> IdentityRecord {
        IdentityRecord {
            display_name: self.display_name.clone(),
            object_type: self.object_type,
            sid: self.sid.clone(),
        }
    }

    /// Computers become enumeration targets; hosts without a DNS name fall
    /// back to their display name.
    pub fn to_host(&self) -> Option<Host> {
        if self.object_type != ObjectType::Computer {
            return None;
        }
        let name = self
            .dns_host_name
            .clone()
            .unwrap_or_else(|| self.display_name.to_lowercase());
        Some(Host::new(name, Some(self.sid.clone()), self.domain.clone()))
    }
}

/// A domain partition from the forest configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPartition {
    pub netbios_name: String,
    pub dns_name: String,
}

/// Filtered directory search, the collector's view of the directory service
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Subtree search under `base` (the domain root when None)
    async fn find(
        &self,
        domain: &str,
        base: Option<&str>,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>>;

    /// Domain the directory connection lands in when no domain is requested
    async fn default_domain(&self) -> Result<String>;

    /// Every domain partition in the forest containing `domain`
    async fn forest_partitions(&self, domain: &str) -> Result<Vec<DomainPartition>>;

    async fn find_by_sid(&self, sid: &str, domain: &str) -> Result<Option<DirectoryObject>> {
        let entries = self
            .find(domain, None, &filters::object_by_sid(sid), attr_lists::PRINCIPAL)
            .await?;
        Ok(entries.iter().find_map(DirectoryObject::from_entry))
    }
}

/// What a generic SID translation found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidTranslation {
    /// The SID's directory object, found in another domain
    Object(DirectoryObject),
    /// Only a `DOMAIN\account` name is known
    Account(String),
}

/// Generic SID/name translation used when the scoped directory lookup has no answer
#[async_trait]
pub trait NameTranslator: Send + Sync {
    /// Translate a SID. `searched` is the domain the caller already looked
    /// in and need not be searched again.
    async fn sid_to_name(&self, sid: &str, searched: &str) -> Result<Option<SidTranslation>>;

    /// SID for an account name (optionally `DOMAIN\`-qualified) in `domain`
    async fn name_to_sid(&self, domain: &str, name: &str) -> Result<Option<String>>;
}

/// A connection opened on first use and shared until it is reset
pub struct HandleSlot<C> {
    conn: Mutex<Option<C>>,
    opened: AtomicU64,
}

impl<C> Default for HandleSlot<C> {
    fn default() -> Self {
        Self {
            conn: Mutex::new(None),
            opened: AtomicU64::new(0),
        }
    }
}

impl<C: Clone> HandleSlot<C> {
    /// The open connection, or a new one from `open`. Concurrent callers wait
    /// for a single open attempt.
    pub async fn get_or_open<F, Fut>(&self, open: F) -> Result<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = open().await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    pub async fn reset(&self) {
        self.conn.lock().await.take();
    }

    /// Connections opened over the slot's lifetime
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

/// Per-domain connection details and the domain's shared connection
pub struct DomainHandle {
    pub name: String,
    pub url: String,
    pub base_dn: String,
    pub connection: HandleSlot<Ldap>,
}

/// `ldap://host` or `ldaps://host`, replacing any scheme already on `server`
pub fn build_ldap_url(server: &str, use_ldaps: bool) -> String {
    let host = server
        .trim_start_matches("ldaps://")
        .trim_start_matches("ldap://");
    if use_ldaps || server.starts_with("ldaps://") || host.ends_with(":636") {
        format!("ldaps://{}", host)
    } else {
        format!("ldap://{}", host)
    }
}

/// Connects and binds within `connect_timeout`.
///
/// TLS certificate verification is disabled to support internal CAs.
/// An empty bind account skips the bind (anonymous).
pub async fn ldap_connect_with_timeout(
    url: &str,
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<Ldap> {
    let connect = async {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(connect_timeout)
            .set_no_tls_verify(true);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("LDAP connection error: {:?}", e);
            }
        });

        if !credentials.is_empty() {
            ldap.simple_bind(credentials.username(), credentials.password())
                .await?
                .success()?;
        }
        info!("LDAP connection to {} established", url);
        Ok::<Ldap, CollectorError>(ldap)
    };

    match timeout(connect_timeout, connect).await {
        Ok(inner) => inner,
        Err(_) => Err(CollectorError::Timeout(format!(
            "Connection timeout: server did not respond within {} seconds",
            connect_timeout.as_secs()
        ))),
    }
}

/// Runs a paged search to completion on a shared connection.
///
/// sizeLimitExceeded (rc=4) returns the partial result set.
pub async fn ldap_paged_search_with_timeout(
    ldap: &mut Ldap,
    base_dn: &str,
    scope: Scope,
    filter: &str,
    attrs: &[&str],
    page_size: i32,
    search_timeout: Duration,
) -> Result<Vec<SearchEntry>> {
    debug!(
        "ldap_paged_search: {} filter {} (page_size: {}, timeout: {}s)",
        base_dn, filter, page_size, search_timeout.as_secs()
    );

    let search = async {
        let mut all_entries: Vec<SearchEntry> = Vec::new();
        let mut cookie: Vec<u8> = Vec::new();

        loop {
            let paged_control = PagedResults {
                size: page_size,
                cookie: cookie.clone(),
            };

            let result = ldap
                .with_controls(vec![paged_control.into()])
                .search(base_dn, scope, filter, attrs.to_vec())
                .await?;

            let (entries, ldap_result) = (result.0, result.1);
            all_entries.extend(entries.into_iter().map(SearchEntry::construct));

            if ldap_result.rc == 4 {
                warn!(
                    "ldap_paged_search: size limit exceeded, returning {} partial entries",
                    all_entries.len()
                );
                break;
            }
            if ldap_result.rc != 0 {
                error!(
                    "ldap_paged_search: search failed with rc={}: {}",
                    ldap_result.rc, ldap_result.text
                );
                return Err(CollectorError::from(ldap3::LdapError::LdapResult {
                    result: ldap_result,
                }));
            }

            let mut has_more_pages = false;
            for ctrl in &ldap_result.ctrls {
                let raw_ctrl = &ctrl.1;
                if raw_ctrl.ctype == PAGED_RESULTS_OID {
                    if let Some(ref val) = raw_ctrl.val {
                        let pr: PagedResults = PagedResults::parse(val);
                        cookie = pr.cookie;
                        has_more_pages = !cookie.is_empty();
                    }
                    break;
                }
            }

            if !has_more_pages {
                break;
            }
        }
        Ok::<Vec<SearchEntry>, CollectorError>(all_entries)
    };

    match timeout(search_timeout, search).await {
        Ok(inner) => inner,
        Err(_) => {
            error!("ldap_paged_search: timed out after {}s", search_timeout.as_secs());
            Err(CollectorError::Timeout(format!(
                "Paged LDAP search did not complete within {} seconds",
                search_timeout.as_secs()
            )))
        }
    }
}

/// Directory source backed by ldap3
pub struct LdapDirectory {
    server: Option<String>,
    credentials: Credentials,
    use_ldaps: bool,
    page_size: i32,
    connect_timeout: Duration,
    search_timeout: Duration,
    handles: SharedCache<String, Arc<DomainHandle>>,
}

impl LdapDirectory {
    pub fn new(settings: &LdapSettings) -> Self {
        Self {
            server: settings.server.clone().filter(|s| !s.is_empty()),
            credentials: settings.credentials(),
            use_ldaps: settings.use_ldaps,
            page_size: settings.page_size,
            connect_timeout: settings.connect_timeout(),
            search_timeout: settings.search_timeout(),
            handles: SharedCache::new(),
        }
    }

    /// Memoized handle for a domain.
    ///
    /// Without a configured server the domain name itself is contacted, which
    /// DNS resolves to one of its domain controllers.
    pub fn domain_handle(&self, domain: &str) -> Arc<DomainHandle> {
        let key = domain.to_lowercase();
        if let Some(handle) = self.handles.get(&key) {
            return handle;
        }
        let host = self.server.clone().unwrap_or_else(|| domain.to_string());
        let handle = Arc::new(DomainHandle {
            name: key.clone(),
            url: build_ldap_url(&host, self.use_ldaps),
            base_dn: domain_to_base_dn(domain),
            connection: HandleSlot::default(),
        });
        self.handles.get_or_insert(key, handle)
    }

    /// The domain's bound connection, opening it if needed
    pub async fn connection(&self, domain: &str) -> Result<Ldap> {
        let handle = self.domain_handle(domain);
        self.open(&handle).await
    }

    async fn open(&self, handle: &DomainHandle) -> Result<Ldap> {
        handle
            .connection
            .get_or_open(|| ldap_connect_with_timeout(&handle.url, &self.credentials, self.connect_timeout))
            .await
    }

    async fn search(
        &self,
        handle: &DomainHandle,
        base_dn: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        let mut ldap = self.open(handle).await?;
        let result = ldap_paged_search_with_timeout(
            &mut ldap,
            base_dn,
            scope,
            filter,
            attrs,
            self.page_size,
            self.search_timeout,
        )
        .await;

        if let Err(e) = &result {
            if e.is_host_unreachable() || matches!(e, CollectorError::Timeout(_)) {
                warn!("Dropping connection to {}: {}", handle.name, e);
                handle.connection.reset().await;
            }
        }
        result
    }

    /// One RootDSE attribute, read over a connection of its own
    async fn root_dse_attr(&self, url: &str, attr: &str) -> Result<String> {
        let mut ldap = ldap_connect_with_timeout(url, &self.credentials, self.connect_timeout).await?;
        let entries = ldap_paged_search_with_timeout(
            &mut ldap,
            "",
            Scope::Base,
            "(objectClass=*)",
            &[attr],
            self.page_size,
            self.search_timeout,
        )
        .await;
        // Unbind failure is not critical; the connection is dropped either way
        let _ = ldap.unbind().await;

        entries?
            .first()
            .and_then(|entry| entry.get_optional_attr(attr))
            .ok_or_else(|| CollectorError::NotFound(format!("{} missing from RootDSE", attr)))
    }

    /// Domains with a handle, except the one already searched
    pub fn translation_domains(&self, searched: &str) -> Vec<String> {
        self.handles
            .values()
            .into_iter()
            .map(|handle| handle.name.clone())
            .filter(|name| !name.eq_ignore_ascii_case(searched))
            .collect()
    }
}

#[async_trait]
impl DirectorySource for LdapDirectory {
    async fn find(
        &self,
        domain: &str,
        base: Option<&str>,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        let handle = self.domain_handle(domain);
        let base_dn = base.unwrap_or(&handle.base_dn);
        self.search(&handle, base_dn, Scope::Subtree, filter, attrs)
            .await
    }

    async fn default_domain(&self) -> Result<String> {
        let server = self.server.as_deref().ok_or_else(|| {
            CollectorError::ConfigError("No domain or LDAP server configured".to_string())
        })?;
        let url = build_ldap_url(server, self.use_ldaps);
        let naming_context = self
            .root_dse_attr(&url, attrs::DEFAULT_NAMING_CONTEXT)
            .await?;
        domain_from_dn(&naming_context).ok_or_else(|| {
            CollectorError::ParseError(format!("Unusable naming context {}", naming_context))
        })
    }

    async fn forest_partitions(&self, domain: &str) -> Result<Vec<DomainPartition>> {
        let handle = self.domain_handle(domain);
        let config_dn = self
            .root_dse_attr(&handle.url, attrs::CONFIGURATION_NAMING_CONTEXT)
            .await?;
        let base = format!("CN=Partitions,{}", config_dn);
        let entries = self
            .search(
                &handle,
                &base,
                Scope::OneLevel,
                filters::DOMAIN_CROSS_REFS,
                attr_lists::CROSS_REF,
            )
            .await?;

        let partitions: Vec<DomainPartition> = entries
            .iter()
            .filter_map(|entry| {
                Some(DomainPartition {
                    netbios_name: entry.get_optional_attr(attrs::NETBIOS_NAME)?,
                    dns_name: entry.get_optional_attr(attrs::DNS_ROOT)?,
                })
            })
            .collect();
        info!("Found {} domain partitions in forest of {}", partitions.len(), domain);
        Ok(partitions)
    }
}

#[async_trait]
impl NameTranslator for LdapDirectory {
    /// Searches every other domain this directory has contacted so far.
    async fn sid_to_name(&self, sid: &str, searched: &str) -> Result<Option<SidTranslation>> {
        for domain in self.translation_domains(searched) {
            match self.find_by_sid(sid, &domain).await {
                Ok(Some(object)) => return Ok(Some(SidTranslation::Object(object))),
                Ok(None) => {}
                Err(e) => debug!("SID lookup for {} in {} failed: {}", sid, domain, e),
            }
        }
        Ok(None)
    }

    async fn name_to_sid(&self, domain: &str, name: &str) -> Result<Option<String>> {
        let account = name.rsplit('\\').next().unwrap_or(name);
        if account.is_empty() {
            return Ok(None);
        }
        let entries = self
            .find(domain, None, &filters::object_by_sam(account), attr_lists::PRINCIPAL)
            .await?;
        Ok(entries.iter().find_map(|entry| entry.get_object_sid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn create_test_entry(dn: &str, attrs: Vec<(&str, &str)>) -> SearchEntry {
        let mut attr_map = HashMap::new();
        for (key, value) in attrs {
            attr_map.insert(key.to_string(), vec![value.to_string()]);
        }
        SearchEntry {
            dn: dn.to_string(),
            attrs: attr_map,
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_user_conversion() {
        let entry = create_test_entry(
            "CN=Alice,OU=Staff,DC=corp,DC=local",
            vec![
                ("sAMAccountName", "alice"),
                ("sAMAccountType", "805306368"),
                ("objectSid", "S-1-5-21-1-2-3-1104"),
            ],
        );
        let object = DirectoryObject::from_entry(&entry).unwrap();
        assert_eq!(object.display_name, "ALICE@CORP.LOCAL");
        assert_eq!(object.object_type, ObjectType::User);
        assert_eq!(object.domain, "corp.local");
        assert!(object.to_host().is_none());
    }

    #[test]
    fn test_computer_conversion() {
        let entry = create_test_entry(
            "CN=WS01,OU=Workstations,DC=corp,DC=local",
            vec![
                ("sAMAccountName", "WS01$"),
                ("sAMAccountType", "805306369"),
                ("objectSid", "S-1-5-21-1-2-3-2001"),
                ("dNSHostName", "ws01.corp.local"),
            ],
        );
        let object = DirectoryObject::from_entry(&entry).unwrap();
        assert_eq!(object.display_name, "WS01.CORP.LOCAL");
        assert_eq!(object.object_type, ObjectType::Computer);

        let host = object.to_host().unwrap();
        assert_eq!(host.dns_host_name, "ws01.corp.local");
        assert_eq!(host.domain_sid(), Some("S-1-5-21-1-2-3"));
    }

    #[test]
    fn test_computer_without_dns_name() {
        let entry = create_test_entry(
            "CN=WS02,DC=corp,DC=local",
            vec![
                ("sAMAccountName", "WS02$"),
                ("sAMAccountType", "805306369"),
                ("objectSid", "S-1-5-21-1-2-3-2002"),
            ],
        );
        let object = DirectoryObject::from_entry(&entry).unwrap();
        assert_eq!(object.display_name, "WS02.CORP.LOCAL");
        assert_eq!(object.to_host().unwrap().dns_host_name, "ws02.corp.local");
    }

    #[test]
    fn test_conversion_requires_sid_and_type() {
        let no_sid = create_test_entry(
            "CN=X,DC=corp,DC=local",
            vec![("sAMAccountName", "x"), ("sAMAccountType", "805306368")],
        );
        assert!(DirectoryObject::from_entry(&no_sid).is_none());

        let unknown_type = create_test_entry(
            "CN=X,DC=corp,DC=local",
            vec![("objectSid", "S-1-5-21-1-2-3-9"), ("sAMAccountType", "1")],
        );
        assert!(DirectoryObject::from_entry(&unknown_type).is_none());
    }

    #[test]
    fn test_build_ldap_url() {
        assert_eq!(build_ldap_url("dc01.corp.local", false), "ldap://dc01.corp.local");
        assert_eq!(build_ldap_url("dc01.corp.local", true), "ldaps://dc01.corp.local");
        assert_eq!(build_ldap_url("ldaps://dc01:636", false), "ldaps://dc01:636");
        assert_eq!(build_ldap_url("dc01:636", false), "ldaps://dc01:636");
    }

    #[test]
    fn test_domain_handle_is_cached() {
        let directory = LdapDirectory::new(&LdapSettings::default());
        let first = directory.domain_handle("Corp.Local");
        assert_eq!(first.url, "ldap://Corp.Local");
        assert_eq!(first.base_dn, "DC=Corp,DC=Local");

        let second = directory.domain_handle("corp.local");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_handle_slot_opens_once() {
        let slot: Arc<HandleSlot<u32>> = Arc::new(HandleSlot::default());
        let attempts = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let attempts = attempts.clone();
                tokio::spawn(async move {
                    slot.get_or_open(|| async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    })
                    .await
                    .unwrap()
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap(), 7);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(slot.opened(), 1);

        slot.reset().await;
        assert_eq!(slot.get_or_open(|| async { Ok(8) }).await.unwrap(), 8);
        assert_eq!(slot.opened(), 2);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let slot: HandleSlot<u32> = HandleSlot::default();
        let failed = slot
            .get_or_open(|| async { Err(CollectorError::ConnectionError("refused".into())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(slot.opened(), 0);
        assert_eq!(slot.get_or_open(|| async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_domain_connection_is_reused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(stream);
            }
        });

        let settings = LdapSettings {
            server: Some(format!("127.0.0.1:{}", port)),
            ..LdapSettings::default()
        };
        let directory = LdapDirectory::new(&settings);
        for _ in 0..3 {
            directory.connection("corp.local").await.unwrap();
            directory.connection("CORP.LOCAL").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(directory.domain_handle("corp.local").connection.opened(), 1);
    }

    #[test]
    fn test_translation_skips_searched_domain() {
        let directory = LdapDirectory::new(&LdapSettings::default());
        directory.domain_handle("corp.local");
        directory.domain_handle("corp.example.com");

        assert_eq!(directory.translation_domains("CORP.LOCAL"), vec!["corp.example.com"]);
        let mut all = directory.translation_domains("other.local");
        all.sort();
        assert_eq!(all, vec!["corp.example.com", "corp.local"]);
    }
}
