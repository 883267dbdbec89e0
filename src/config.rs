//! Collector configuration
//!
//! All settings have defaults; a JSON file may override any subset and the
//! command line overrides the file. Times are carried as milliseconds so the
//! file format stays flat.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{CollectorError, Result};
use crate::secure_types::Credentials;

/// Name of the local administrator output file
pub const ADMIN_FILE_NAME: &str = "local_admins.csv";

/// Where hosts for live enumeration come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostSource {
    /// Streamed from a directory search; total is unknown
    #[default]
    Directory,
    /// Listed from the object store; total is counted up front
    ObjectStore,
}

/// Output destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputTarget {
    File { folder: PathBuf, prefix: String },
    Neo4j { uri: String, user_pass: String },
}

impl Default for OutputTarget {
    fn default() -> Self {
        OutputTarget::File {
            folder: PathBuf::from("."),
            prefix: String::new(),
        }
    }
}

/// Directory connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapSettings {
    /// Server to contact; None uses the target domain name itself
    pub server: Option<String>,
    pub username: String,
    pub password: String,
    pub use_ldaps: bool,
    pub page_size: i32,
    pub connect_timeout_ms: u64,
    pub search_timeout_ms: u64,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            server: None,
            username: String::new(),
            password: String::new(),
            use_ldaps: false,
            page_size: 500,
            connect_timeout_ms: 15_000,
            search_timeout_ms: 120_000,
        }
    }
}

impl LdapSettings {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

/// Top-level collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Worker count for live enumeration
    pub threads: usize,
    /// Progress report period
    pub status_interval_ms: u64,
    pub skip_ping: bool,
    pub ping_timeout_ms: u64,
    pub probe_port: u16,
    pub domain: Option<String>,
    pub search_forest: bool,
    pub stealth: bool,
    pub host_source: HostSource,
    pub output: OutputTarget,
    pub file_flush_every: usize,
    pub batch_threshold: usize,
    pub gpo_parallelism: usize,
    pub ldap: LdapSettings,
    /// SQLite object store; None keeps objects in memory for the run
    pub store_path: Option<PathBuf>,
    /// Local mount point standing in for `\\<domain>\SYSVOL`
    pub sysvol_root: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            threads: 20,
            status_interval_ms: 30_000,
            skip_ping: false,
            ping_timeout_ms: 750,
            probe_port: 445,
            domain: None,
            search_forest: false,
            stealth: false,
            host_source: HostSource::Directory,
            output: OutputTarget::default(),
            file_flush_every: 100,
            batch_threshold: 1000,
            gpo_parallelism: 8,
            ldap: LdapSettings::default(),
            store_path: None,
            sysvol_root: None,
            log_file: None,
        }
    }
}

impl CollectorConfig {
    /// Load a configuration file; missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CollectorError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| CollectorError::ConfigError(format!("Invalid config {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(CollectorError::ConfigError("threads must be at least 1".into()));
        }
        if self.batch_threshold == 0 {
            return Err(CollectorError::ConfigError("batch_threshold must be at least 1".into()));
        }
        if self.file_flush_every == 0 {
            return Err(CollectorError::ConfigError("file_flush_every must be at least 1".into()));
        }
        if self.gpo_parallelism == 0 {
            return Err(CollectorError::ConfigError("gpo_parallelism must be at least 1".into()));
        }
        if let OutputTarget::Neo4j { uri, .. } = &self.output {
            if uri.trim().is_empty() {
                return Err(CollectorError::ConfigError("Neo4j output requires a URI".into()));
            }
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// `<folder>/<prefix>_<name>`, or `<folder>/<name>` without a prefix.
    ///
    /// Returns None when output goes to the network sink.
    pub fn file_path(&self, name: &str) -> Option<PathBuf> {
        match &self.output {
            OutputTarget::File { folder, prefix } if prefix.is_empty() => Some(folder.join(name)),
            OutputTarget::File { folder, prefix } => Some(folder.join(format!("{}_{}", prefix, name))),
            OutputTarget::Neo4j { .. } => None,
        }
    }

    /// Pre-encoded `Authorization` value for the network sink
    pub fn encoded_credential(&self) -> Option<String> {
        match &self.output {
            OutputTarget::Neo4j { user_pass, .. } => {
                Some(Credentials::from_user_pass(user_pass).basic_auth_header())
            }
            OutputTarget::File { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CollectorConfig::default();
        assert_eq!(config.threads, 20);
        assert_eq!(config.ping_timeout(), Duration::from_millis(750));
        assert_eq!(config.status_interval(), Duration::from_secs(30));
        assert_eq!(config.batch_threshold, 1000);
        assert_eq!(config.file_flush_every, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_path_prefix() {
        let mut config = CollectorConfig::default();
        config.output = OutputTarget::File {
            folder: PathBuf::from("/tmp/out"),
            prefix: String::new(),
        };
        assert_eq!(config.file_path(ADMIN_FILE_NAME), Some(PathBuf::from("/tmp/out/local_admins.csv")));

        config.output = OutputTarget::File {
            folder: PathBuf::from("/tmp/out"),
            prefix: "corp".to_string(),
        };
        assert_eq!(
            config.file_path(ADMIN_FILE_NAME),
            Some(PathBuf::from("/tmp/out/corp_local_admins.csv"))
        );
    }

    #[test]
    fn test_encoded_credential() {
        let mut config = CollectorConfig::default();
        assert_eq!(config.encoded_credential(), None);
        config.output = OutputTarget::Neo4j {
            uri: "http://localhost:7474".to_string(),
            user_pass: "neo4j:BloodHound".to_string(),
        };
        assert_eq!(config.encoded_credential().as_deref(), Some("Basic bmVvNGo6Qmxvb2RIb3VuZA=="));
        assert_eq!(config.file_path(ADMIN_FILE_NAME), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CollectorConfig { threads: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(CollectorError::ConfigError(_))));

        let config = CollectorConfig {
            output: OutputTarget::Neo4j { uri: " ".into(), user_pass: "a:b".into() },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"threads": 4, "stealth": true, "ldap": {{"use_ldaps": true}},
               "output": {{"kind": "neo4j", "uri": "http://db:7474", "user_pass": "u:p"}}}}"#
        )
        .unwrap();

        let config = CollectorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.threads, 4);
        assert!(config.stealth);
        assert!(config.ldap.use_ldaps);
        assert_eq!(config.ldap.page_size, 500);
        assert_eq!(config.ping_timeout_ms, 750);
        assert!(matches!(config.output, OutputTarget::Neo4j { .. }));
    }
}
