//! Local admin enumeration driver
//!
//! `ScanContext` is built once at startup and owns every shared component;
//! `LocalAdminEnumeration` walks the target domains and runs either the
//! worker pool or group policy correlation for each.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::admin_resolver::AdminResolver;
use crate::cache::ScanCaches;
use crate::common_types::Host;
use crate::config::{CollectorConfig, HostSource};
use crate::directory::{DirectoryObject, DirectorySource, LdapDirectory, NameTranslator};
use crate::dispatcher::{join_writer, spawn_writer, RunSummary, WorkerPool};
use crate::errors::Result;
use crate::gpo_correlator::{FsTemplateReader, GpoCorrelator, TemplateReader};
use crate::host_gate::{HostGate, LivenessProbe, TcpProbe};
use crate::identity::{DomainAliases, IdentityResolver};
use crate::ldap_helpers::{attr_lists, filters};
use crate::local_group::{LegacyGroupProvider, LocalGroupApi};
use crate::object_store::{MemoryStore, ObjectStore, SqliteStore};
use crate::output::{open_sink, GrantSink};
use crate::progress::{ProgressReporter, ScanCounters};

/// External collaborators a scan talks to
pub struct Collaborators {
    pub directory: Arc<dyn DirectorySource>,
    pub translator: Arc<dyn NameTranslator>,
    pub store: Arc<dyn ObjectStore>,
    pub probe: Arc<dyn LivenessProbe>,
    pub group_api: Arc<dyn LocalGroupApi>,
    pub legacy: Arc<dyn LegacyGroupProvider>,
    pub templates: Arc<dyn TemplateReader>,
}

impl Collaborators {
    /// Production wiring: ldap3 directory, SQLite or in-memory store, TCP
    /// probe, platform group APIs and SYSVOL templates.
    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        let ldap = Arc::new(LdapDirectory::new(&config.ldap));
        let store: Arc<dyn ObjectStore> = match &config.store_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let (group_api, legacy) = platform_group_apis();

        Ok(Self {
            directory: ldap.clone(),
            translator: ldap,
            store,
            probe: Arc::new(TcpProbe::new(config.probe_port)),
            group_api,
            legacy,
            templates: Arc::new(FsTemplateReader::new(config.sysvol_root.clone())),
        })
    }
}

#[cfg(windows)]
fn platform_group_apis() -> (Arc<dyn LocalGroupApi>, Arc<dyn LegacyGroupProvider>) {
    use crate::local_group::{NetApiLegacyProvider, NetApiLocalGroups};
    let api: Arc<dyn LocalGroupApi> = Arc::new(NetApiLocalGroups);
    let legacy: Arc<dyn LegacyGroupProvider> = Arc::new(NetApiLegacyProvider);
    (api, legacy)
}

#[cfg(not(windows))]
fn platform_group_apis() -> (Arc<dyn LocalGroupApi>, Arc<dyn LegacyGroupProvider>) {
    use crate::local_group::UnsupportedPlatform;
    warn!("Remote local group queries are unavailable on this platform; live hosts will be counted dead");
    let api: Arc<dyn LocalGroupApi> = Arc::new(UnsupportedPlatform);
    let legacy: Arc<dyn LegacyGroupProvider> = Arc::new(UnsupportedPlatform);
    (api, legacy)
}

/// Everything one collection run shares between components
pub struct ScanContext {
    pub config: CollectorConfig,
    pub directory: Arc<dyn DirectorySource>,
    pub store: Arc<dyn ObjectStore>,
    pub caches: Arc<ScanCaches>,
    pub aliases: Arc<DomainAliases>,
    pub identities: Arc<IdentityResolver>,
    pub resolver: Arc<AdminResolver>,
    pub correlator: GpoCorrelator,
}

impl ScanContext {
    pub fn new(config: CollectorConfig, parts: Collaborators) -> Self {
        let caches = Arc::new(ScanCaches::new());
        let aliases = Arc::new(DomainAliases::new());
        let identities = Arc::new(IdentityResolver::new(
            parts.store.clone(),
            parts.directory.clone(),
            parts.translator,
            caches.clone(),
            aliases.clone(),
        ));
        let gate = Arc::new(HostGate::new(parts.probe, config.skip_ping, config.ping_timeout()));
        let resolver = Arc::new(AdminResolver::new(
            gate,
            parts.group_api,
            parts.legacy,
            identities.clone(),
        ));
        let correlator = GpoCorrelator::new(
            parts.directory.clone(),
            identities.clone(),
            parts.templates,
            config.gpo_parallelism,
        );

        Self {
            config,
            directory: parts.directory,
            store: parts.store,
            caches,
            aliases,
            identities,
            resolver,
            correlator,
        }
    }
}

pub struct LocalAdminEnumeration {
    context: Arc<ScanContext>,
}

impl LocalAdminEnumeration {
    pub fn new(context: Arc<ScanContext>) -> Self {
        Self { context }
    }

    /// Target domains, loading the NetBIOS alias table on the way.
    ///
    /// The forest partition list doubles as the domain list when the whole
    /// forest is requested.
    pub async fn domains(&self) -> Result<Vec<String>> {
        let config = &self.context.config;
        let root = match &config.domain {
            Some(domain) => domain.clone(),
            None => self.context.directory.default_domain().await?,
        };

        match self.context.directory.forest_partitions(&root).await {
            Ok(partitions) => {
                self.context.aliases.load(&partitions);
                info!("Loaded {} domain aliases", self.context.aliases.len());
                if config.search_forest && !partitions.is_empty() {
                    return Ok(partitions.into_iter().map(|p| p.dns_name).collect());
                }
            }
            Err(e) if config.search_forest => return Err(e),
            Err(e) => warn!("Could not read forest partitions from {}: {}", root, e),
        }
        Ok(vec![root])
    }

    /// Enumerate every target domain. A domain that fails is logged and
    /// skipped; only failing to work out the domain list ends the run.
    pub async fn run(&self) -> Result<RunSummary> {
        info!("Starting Local Admin Enumeration");
        let start = Instant::now();
        let mut overall = RunSummary::default();

        for domain in self.domains().await? {
            info!("Started local admin enumeration for {}", domain);
            let domain_start = Instant::now();
            match self.enumerate_domain(&domain).await {
                Ok(summary) => {
                    info!("Enumeration for {} done in {:?}", domain, domain_start.elapsed());
                    overall.merge(&summary);
                }
                Err(e) => error!("Enumeration for {} failed: {}", domain, e),
            }
        }

        overall.elapsed = start.elapsed();
        info!(
            "Local Admin Enumeration done in {:?}: {} alive, {} dead, {} grants",
            overall.elapsed, overall.processed, overall.dead, overall.grants_written
        );
        Ok(overall)
    }

    async fn enumerate_domain(&self, domain: &str) -> Result<RunSummary> {
        let sink = open_sink(&self.context.config).await?;
        if self.context.config.stealth {
            Ok(self.correlate_domain(domain, sink).await)
        } else {
            self.scan_domain(domain, sink).await
        }
    }

    async fn correlate_domain(&self, domain: &str, sink: Box<dyn GrantSink>) -> RunSummary {
        let start = Instant::now();
        let (output, writer) = spawn_writer(sink);
        let result = self.context.correlator.correlate(domain, &output).await;
        drop(output);
        let grants_written = join_writer(writer).await;

        if let Err(e) = result {
            warn!("GPO correlation for {} failed: {}", domain, e);
        }
        RunSummary {
            grants_written,
            elapsed: start.elapsed(),
            ..Default::default()
        }
    }

    async fn scan_domain(&self, domain: &str, sink: Box<dyn GrantSink>) -> Result<RunSummary> {
        let (hosts, total) = self.hosts(domain).await?;
        let counters = Arc::new(ScanCounters::new(total));
        let reporter = ProgressReporter::start(domain, counters.clone(), self.context.config.status_interval());

        let pool = WorkerPool::new(self.context.resolver.clone(), self.context.config.threads);
        let result = pool.run(hosts, counters, sink).await;
        reporter.stop().await;
        result
    }

    /// Hosts to scan and their count, None when the list is streamed from
    /// the directory
    pub async fn hosts(&self, domain: &str) -> Result<(Vec<Host>, Option<u64>)> {
        match self.context.config.host_source {
            HostSource::Directory => {
                let entries = self
                    .context
                    .directory
                    .find(domain, None, filters::ENABLED_COMPUTERS, attr_lists::COMPUTER)
                    .await?;
                let hosts = entries
                    .iter()
                    .filter_map(DirectoryObject::from_entry)
                    .filter_map(|object| object.to_host())
                    .collect();
                Ok((hosts, None))
            }
            HostSource::ObjectStore => {
                let hosts = self.context.store.computers_in_domain(domain)?;
                let total = hosts.len() as u64;
                Ok((hosts, Some(total)))
            }
        }
    }
}
