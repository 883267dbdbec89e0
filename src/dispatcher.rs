//! Bounded worker pool for per-host scans
//!
//! Hosts flow through an unbounded input queue to a fixed number of workers;
//! grants flow through an unbounded output queue to a single writer task that
//! owns the sink. Shutdown is close-then-drain on both queues: close input,
//! join workers, close output, join writer.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::admin_resolver::{AdminResolver, HostOutcome};
use crate::common_types::{AdminGrant, Host};
use crate::errors::{CollectorError, Result};
use crate::output::GrantSink;
use crate::progress::ScanCounters;

/// Per-host work performed by a pool worker
#[async_trait]
pub trait HostScanner: Send + Sync {
    async fn scan(&self, host: &Host) -> HostOutcome;
}

#[async_trait]
impl HostScanner for AdminResolver {
    async fn scan(&self, host: &Host) -> HostOutcome {
        AdminResolver::scan(self, host).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub dead: u64,
    pub grants_written: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn merge(&mut self, other: &RunSummary) {
        self.processed += other.processed;
        self.dead += other.dead;
        self.grants_written += other.grants_written;
        self.elapsed += other.elapsed;
    }
}

/// Spawn the single writer task.
///
/// The task drains the queue until every sender is dropped, then finishes the
/// sink and yields the number of grants written. Write and finish failures are
/// logged and do not stop the drain.
pub fn spawn_writer(mut sink: Box<dyn GrantSink>) -> (UnboundedSender<AdminGrant>, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AdminGrant>();
    let handle = tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(grant) = rx.recv().await {
            match sink.write(grant).await {
                Ok(()) => written += 1,
                Err(e) => error!("Failed to write grant: {}", e),
            }
        }
        if let Err(e) = sink.finish().await {
            error!("Failed to finish output after {} grants: {}", written, e);
        }
        written
    });
    (tx, handle)
}

/// Wait for the writer; a writer that died is logged and counted as writing nothing.
pub async fn join_writer(writer: JoinHandle<u64>) -> u64 {
    match writer.await {
        Ok(written) => written,
        Err(e) => {
            error!("Writer task failed: {}", e);
            0
        }
    }
}

pub struct WorkerPool {
    scanner: Arc<dyn HostScanner>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(scanner: Arc<dyn HostScanner>, workers: usize) -> Self {
        Self {
            scanner,
            workers: workers.max(1),
        }
    }

    /// Scan every host, streaming grants to `sink`.
    ///
    /// Counters are updated as each host finishes; a panic while scanning a
    /// host is caught and the host counted dead.
    pub async fn run(
        &self,
        hosts: Vec<Host>,
        counters: Arc<ScanCounters>,
        sink: Box<dyn GrantSink>,
    ) -> Result<RunSummary> {
        let start = Instant::now();

        let (output_tx, writer) = spawn_writer(sink);
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Host>();
        let input_rx = Arc::new(Mutex::new(input_rx));

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    self.scanner.clone(),
                    input_rx.clone(),
                    output_tx.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        for host in hosts {
            input_tx
                .send(host)
                .map_err(|_| CollectorError::InternalError("Input queue closed".to_string()))?;
        }
        drop(input_tx);
        debug!("Waiting for {} enumeration workers to finish", self.workers);

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        drop(output_tx);
        debug!("Waiting for writer to finish");

        let grants_written = join_writer(writer).await;
        let snapshot = counters.snapshot();

        let summary = RunSummary {
            processed: snapshot.processed,
            dead: snapshot.dead,
            grants_written,
            elapsed: start.elapsed(),
        };
        info!(
            "Worker pool done: {} alive, {} dead, {} grants in {:?}",
            summary.processed, summary.dead, summary.grants_written, summary.elapsed
        );
        Ok(summary)
    }
}

async fn worker_loop(
    id: usize,
    scanner: Arc<dyn HostScanner>,
    input: Arc<Mutex<UnboundedReceiver<Host>>>,
    output: UnboundedSender<AdminGrant>,
    counters: Arc<ScanCounters>,
) {
    loop {
        // Lock is released before the scan starts
        let next = input.lock().await.recv().await;
        let Some(host) = next else {
            break;
        };

        let outcome = AssertUnwindSafe(scanner.scan(&host)).catch_unwind().await;
        match outcome {
            Ok(HostOutcome::Alive(grants)) => {
                counters.mark_alive();
                for grant in grants {
                    if output.send(grant).is_err() {
                        error!("Worker {}: output queue closed early", id);
                        return;
                    }
                }
            }
            Ok(HostOutcome::Dead) => counters.mark_dead(),
            Err(_) => {
                error!("Worker {}: scan of {} panicked", id, host.dns_host_name);
                counters.mark_dead();
            }
        }
    }
    debug!("Worker {} exiting", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_types::{IdentityRecord, ObjectType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeScanner;

    #[async_trait]
    impl HostScanner for FakeScanner {
        async fn scan(&self, host: &Host) -> HostOutcome {
            if host.dns_host_name.starts_with("dead") {
                return HostOutcome::Dead;
            }
            if host.dns_host_name.starts_with("boom") {
                panic!("scanner bug");
            }
            let record = IdentityRecord {
                display_name: "DOMAIN ADMINS@CORP.LOCAL".to_string(),
                object_type: ObjectType::Group,
                sid: "S-1-5-21-1-2-3-512".to_string(),
            };
            HostOutcome::Alive(AdminGrant::new(host.dns_host_name.clone(), &record).into_iter().collect())
        }
    }

    struct CollectingSink {
        grants: Arc<std::sync::Mutex<Vec<AdminGrant>>>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GrantSink for CollectingSink {
        async fn write(&mut self, grant: AdminGrant) -> Result<()> {
            self.grants.lock().unwrap().push(grant);
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn host(name: &str) -> Host {
        Host::new(name, None, "CORP.LOCAL")
    }

    #[tokio::test]
    async fn test_pool_counts_and_drains() {
        let grants = Arc::new(std::sync::Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(CollectingSink {
            grants: grants.clone(),
            finished: finished.clone(),
        });

        let hosts: Vec<Host> = (0..50)
            .map(|i| host(&format!("{}{:02}.corp.local", if i % 5 == 0 { "dead" } else { "ws" }, i)))
            .chain(std::iter::once(host("boom.corp.local")))
            .collect();
        let total = hosts.len() as u64;
        let counters = Arc::new(ScanCounters::new(Some(total)));

        let pool = WorkerPool::new(Arc::new(FakeScanner), 4);
        let summary = pool.run(hosts, counters.clone(), sink).await.unwrap();

        assert_eq!(summary.processed, 40);
        assert_eq!(summary.dead, 11);
        assert_eq!(summary.processed + summary.dead, total);
        assert_eq!(summary.grants_written, 40);
        assert_eq!(grants.lock().unwrap().len(), 40);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(grants.lock().unwrap().iter().all(|g| g.server.starts_with("ws")));
    }

    struct FailingFinishSink {
        written: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GrantSink for FailingFinishSink {
        async fn write(&mut self, _grant: AdminGrant) -> Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            Err(CollectorError::SinkError("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_finish_failure_keeps_summary() {
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(FailingFinishSink { written: written.clone() });
        let hosts = vec![host("ws01.corp.local"), host("dead01.corp.local"), host("ws02.corp.local")];

        let pool = WorkerPool::new(Arc::new(FakeScanner), 2);
        let summary = pool
            .run(hosts, Arc::new(ScanCounters::new(Some(3))), sink)
            .await
            .unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.dead, 1);
        assert_eq!(summary.grants_written, 2);
        assert_eq!(written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_with_no_hosts() {
        let finished = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(CollectingSink {
            grants: Arc::new(std::sync::Mutex::new(Vec::new())),
            finished: finished.clone(),
        });
        let pool = WorkerPool::new(Arc::new(FakeScanner), 3);
        let summary = pool
            .run(Vec::new(), Arc::new(ScanCounters::new(Some(0))), sink)
            .await
            .unwrap();
        assert_eq!(summary.grants_written, 0);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
