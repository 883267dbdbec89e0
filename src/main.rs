use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use admin_collector::config::{HostSource, OutputTarget};
use admin_collector::{Collaborators, CollectorConfig, LocalAdminEnumeration, ScanContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CollectionMethod {
    /// Query each computer's local Administrators group
    LocalGroup,
    /// Derive local admins from group policy without touching hosts
    Stealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HostSourceArg {
    Directory,
    ObjectStore,
}

#[derive(Debug, Parser)]
#[command(name = "admin-collector", version, about = "Collect local administrator relationships from an Active Directory environment")]
struct Cli {
    #[arg(short = 'c', long, value_enum, default_value_t = CollectionMethod::LocalGroup)]
    collection_method: CollectionMethod,

    /// JSON configuration file; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short = 't', long)]
    threads: Option<usize>,

    #[arg(short = 'd', long)]
    domain: Option<String>,

    #[arg(short = 's', long)]
    search_forest: bool,

    #[arg(long)]
    csv_folder: Option<PathBuf>,

    #[arg(long)]
    csv_prefix: Option<String>,

    /// Graph database base URI, e.g. http://localhost:7474
    #[arg(long)]
    uri: Option<String>,

    /// `user:password` for the graph database
    #[arg(long, requires = "uri")]
    user_pass: Option<String>,

    #[arg(long)]
    skip_ping: bool,

    /// Probe timeout in milliseconds
    #[arg(long)]
    ping_timeout: Option<u64>,

    /// Status interval in milliseconds
    #[arg(long)]
    interval: Option<u64>,

    #[arg(long)]
    host_source: Option<HostSourceArg>,

    #[arg(long)]
    ldap_server: Option<String>,

    #[arg(long)]
    ldap_user: Option<String>,

    #[arg(long, env = "ADMIN_COLLECTOR_LDAP_PASSWORD", hide_env_values = true)]
    ldap_password: Option<String>,

    #[arg(long)]
    ldaps: bool,

    /// SQLite object store
    #[arg(long)]
    db: Option<PathBuf>,

    /// Local mount point of the domain's SYSVOL share
    #[arg(long)]
    sysvol_root: Option<PathBuf>,

    /// Directory for admin-collector.log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<CollectorConfig> {
        let mut config = match &self.config {
            Some(path) => CollectorConfig::from_json_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => CollectorConfig::default(),
        };

        config.stealth = config.stealth || self.collection_method == CollectionMethod::Stealth;
        config.search_forest = config.search_forest || self.search_forest;
        config.skip_ping = config.skip_ping || self.skip_ping;
        config.ldap.use_ldaps = config.ldap.use_ldaps || self.ldaps;

        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if self.domain.is_some() {
            config.domain = self.domain;
        }
        if let Some(timeout) = self.ping_timeout {
            config.ping_timeout_ms = timeout;
        }
        if let Some(interval) = self.interval {
            config.status_interval_ms = interval;
        }
        if let Some(source) = self.host_source {
            config.host_source = match source {
                HostSourceArg::Directory => HostSource::Directory,
                HostSourceArg::ObjectStore => HostSource::ObjectStore,
            };
        }
        if self.ldap_server.is_some() {
            config.ldap.server = self.ldap_server;
        }
        if let Some(user) = self.ldap_user {
            config.ldap.username = user;
        }
        if let Some(password) = self.ldap_password {
            config.ldap.password = password;
        }
        if self.db.is_some() {
            config.store_path = self.db;
        }
        if self.sysvol_root.is_some() {
            config.sysvol_root = self.sysvol_root;
        }
        if self.log_dir.is_some() {
            config.log_file = self.log_dir;
        }

        if let Some(uri) = self.uri {
            config.output = OutputTarget::Neo4j {
                uri,
                user_pass: self.user_pass.unwrap_or_default(),
            };
        } else if self.csv_folder.is_some() || self.csv_prefix.is_some() {
            let (folder, prefix) = match config.output {
                OutputTarget::File { folder, prefix } => (folder, prefix),
                OutputTarget::Neo4j { .. } => (PathBuf::from("."), String::new()),
            };
            config.output = OutputTarget::File {
                folder: self.csv_folder.unwrap_or(folder),
                prefix: self.csv_prefix.unwrap_or(prefix),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

/// Console plus optional file logging; the returned guard flushes the file writer.
fn init_logging(
    verbose: bool,
    log_dir: Option<&PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let console_layer = fmt::layer().with_writer(std::io::stdout).with_ansi(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::NEVER, dir, "admin-collector.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

fn install_panic_trap() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!("Panic at {}: {}", location, info);
    }));
}

async fn run(config: CollectorConfig) -> anyhow::Result<()> {
    let parts = Collaborators::from_config(&config).context("Failed to set up collectors")?;
    let context = Arc::new(ScanContext::new(config, parts));
    let enumeration = LocalAdminEnumeration::new(context.clone());

    let summary = enumeration.run().await?;

    let stats = context.caches.identities.stats();
    tracing::debug!(
        "Identity cache: {} entries, {:.1}% hit rate",
        context.caches.identities.len(),
        stats.hit_rate() * 100.0
    );
    tracing::info!(
        "Collection finished: {} hosts alive, {} dead, {} relationships written",
        summary.processed,
        summary.dead,
        summary.grants_written
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            std::process::exit(2);
        }
    };

    let guard = init_logging(verbose, config.log_file.as_ref());
    install_panic_trap();

    let code = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => match runtime.block_on(run(config)) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("Collection failed: {:#}", e);
                1
            }
        },
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            1
        }
    };

    drop(guard);
    std::process::exit(code);
}
