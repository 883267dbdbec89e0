//! Output sinks
//!
//! A run writes through exactly one sink, owned by the single writer task.
//! File mode appends CSV rows; transaction mode batches grants by principal
//! type and commits them to a graph database's HTTP transaction endpoint.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

use crate::common_types::{AdminGrant, GrantParam, ObjectType};
use crate::config::{CollectorConfig, OutputTarget, ADMIN_FILE_NAME};
use crate::errors::{CollectorError, Result};

pub const CSV_HEADERS: &[&str] = &["ComputerName", "AccountName", "AccountType"];

pub const TRANSACTION_PATH: &str = "/db/data/transaction/commit";

const USER_STATEMENT: &str = "UNWIND $props AS prop \
    MERGE (user:User {name: prop.principal}) \
    MERGE (computer:Computer {name: prop.account}) \
    MERGE (user)-[:AdminTo]->(computer)";

const COMPUTER_STATEMENT: &str = "UNWIND $props AS prop \
    MERGE (admin:Computer {name: prop.principal}) \
    MERGE (computer:Computer {name: prop.account}) \
    MERGE (admin)-[:AdminTo]->(computer)";

const GROUP_STATEMENT: &str = "UNWIND $props AS prop \
    MERGE (group:Group {name: prop.principal}) \
    MERGE (computer:Computer {name: prop.account}) \
    MERGE (group)-[:AdminTo]->(computer)";

#[async_trait]
pub trait GrantSink: Send {
    async fn write(&mut self, grant: AdminGrant) -> Result<()>;

    /// Flush whatever is buffered; called once when the output queue closes
    async fn finish(&mut self) -> Result<()>;
}

/// Appends `Server,PrincipalName,PrincipalType` rows to a CSV file
pub struct CsvFileSink {
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
    flush_every: usize,
    rows: usize,
}

impl CsvFileSink {
    /// Opens for append, writing the header only when the file is new.
    pub async fn open(path: &Path, flush_every: usize) -> Result<Self> {
        let append = tokio::fs::try_exists(path).await.unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| CollectorError::SinkError(format!("Cannot open {}: {}", path.display(), e)))?;

        let mut writer = BufWriter::new(file);
        if !append {
            writer.write_all(&encode_row(CSV_HEADERS)?).await?;
        }
        info!("Writing local admins to {} (append: {})", path.display(), append);

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            flush_every: flush_every.max(1),
            rows: 0,
        })
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }
}

/// One CSV record, quoted where a field needs it, with its line terminator
pub fn encode_row<I, T>(fields: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(fields)?;
    wtr.into_inner()
        .map_err(|e| CollectorError::SinkError(format!("CSV encoding failed: {}", e)))
}

#[async_trait]
impl GrantSink for CsvFileSink {
    async fn write(&mut self, grant: AdminGrant) -> Result<()> {
        let row = encode_row([
            grant.server.as_str(),
            grant.principal_name.as_str(),
            grant.principal_type.as_str(),
        ])?;
        self.writer.write_all(&row).await?;
        self.rows += 1;
        if self.rows % self.flush_every == 0 {
            self.writer.flush().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        debug!("{}: {} rows written", self.path.display(), self.rows);
        Ok(())
    }
}

/// Per-type parameter buffers for one transaction
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    users: Vec<GrantParam>,
    groups: Vec<GrantParam>,
    computers: Vec<GrantParam>,
    threshold: usize,
}

impl BatchAccumulator {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            ..Default::default()
        }
    }

    /// Buffer a grant; true when the combined count has reached the threshold.
    pub fn push(&mut self, grant: &AdminGrant) -> bool {
        let param = grant.to_param();
        match grant.principal_type {
            ObjectType::User => self.users.push(param),
            ObjectType::Group => self.groups.push(param),
            ObjectType::Computer => self.computers.push(param),
        }
        self.queued() >= self.threshold
    }

    pub fn queued(&self) -> usize {
        self.users.len() + self.groups.len() + self.computers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued() == 0
    }

    /// `{"statements": [users, computers, groups]}`
    pub fn payload(&self) -> Value {
        json!({
            "statements": [
                { "statement": USER_STATEMENT, "parameters": { "props": self.users } },
                { "statement": COMPUTER_STATEMENT, "parameters": { "props": self.computers } },
                { "statement": GROUP_STATEMENT, "parameters": { "props": self.groups } },
            ]
        })
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.groups.clear();
        self.computers.clear();
    }
}

/// Batched commits to a transactional HTTP endpoint.
///
/// Delivery is at most once per batch: a failed submission is logged and its
/// buffers are discarded.
pub struct TransactionSink {
    client: Client,
    endpoint: String,
    authorization: String,
    batch: BatchAccumulator,
    submissions: usize,
    failures: usize,
}

impl TransactionSink {
    pub fn new(uri: &str, authorization: String, threshold: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| CollectorError::SinkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", uri.trim_end_matches('/'), TRANSACTION_PATH),
            authorization,
            batch: BatchAccumulator::new(threshold),
            submissions: 0,
            failures: 0,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    async fn submit(&mut self) {
        let payload = self.batch.payload();
        let queued = self.batch.queued();
        self.batch.clear();
        self.submissions += 1;

        match self.post(&payload).await {
            Ok(()) => debug!("Committed {} grants to {}", queued, self.endpoint),
            Err(e) => {
                self.failures += 1;
                error!("Submission of {} grants to {} failed: {}", queued, self.endpoint, e);
            }
        }
    }

    async fn post(&self, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json; charset=UTF-8")
            .header(header::AUTHORIZATION, &self.authorization)
            .body(serde_json::to_vec(payload)?)
            .send()
            .await?
            .error_for_status()?;

        // Statement errors come back with a 200 status
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                warn!("Transaction reported {} errors: {}", errors.len(), serde_json::Value::Array(errors.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GrantSink for TransactionSink {
    async fn write(&mut self, grant: AdminGrant) -> Result<()> {
        if self.batch.push(&grant) {
            self.submit().await;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.batch.is_empty() {
            self.submit().await;
        }
        info!(
            "{} submissions to {} ({} failed)",
            self.submissions, self.endpoint, self.failures
        );
        Ok(())
    }
}

/// Open the sink selected by the configuration
pub async fn open_sink(config: &CollectorConfig) -> Result<Box<dyn GrantSink>> {
    match &config.output {
        OutputTarget::File { .. } => {
            let path = config
                .file_path(ADMIN_FILE_NAME)
                .ok_or_else(|| CollectorError::ConfigError("No output file path".to_string()))?;
            Ok(Box::new(CsvFileSink::open(&path, config.file_flush_every).await?))
        }
        OutputTarget::Neo4j { uri, .. } => {
            let authorization = config.encoded_credential().unwrap_or_default();
            Ok(Box::new(TransactionSink::new(uri, authorization, config.batch_threshold)?))
        }
    }
}
