//! Scan progress counters and the periodic status reporter

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Sentinel total for streamed host lists
pub const TOTAL_UNKNOWN: i64 = -1;

/// Shared per-domain counters. Workers increment, the reporter only reads.
#[derive(Debug)]
pub struct ScanCounters {
    processed: AtomicU64,
    dead: AtomicU64,
    total: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub dead: u64,
    /// None when hosts are streamed
    pub total: Option<u64>,
}

impl CounterSnapshot {
    pub fn completed(&self) -> u64 {
        self.processed + self.dead
    }

    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.completed() as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}

impl ScanCounters {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            processed: AtomicU64::new(0),
            dead: AtomicU64::new(0),
            total: AtomicI64::new(total.map_or(TOTAL_UNKNOWN, |t| t as i64)),
        }
    }

    pub fn mark_alive(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_dead(&self) {
        self.dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            total: (total >= 0).then_some(total as u64),
        }
    }
}

pub fn format_status(domain: &str, snapshot: &CounterSnapshot) -> String {
    match (snapshot.total, snapshot.percentage()) {
        (Some(total), Some(pct)) => format!(
            "Local Admin Enumeration for {} - {}/{} ({:.2}%) completed. ({} hosts alive)",
            domain,
            snapshot.completed(),
            total,
            pct,
            snapshot.processed
        ),
        _ => format!(
            "Local Admin Enumeration for {} - {} hosts completed.",
            domain,
            snapshot.completed()
        ),
    }
}

/// Logs a status line every `interval` until stopped
pub struct ProgressReporter {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    counters: Arc<ScanCounters>,
    domain: String,
}

impl ProgressReporter {
    pub fn start(domain: &str, counters: Arc<ScanCounters>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_counters = counters.clone();
        let task_domain = domain.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("{}", format_status(&task_domain, &task_counters.snapshot()));
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Self {
            stop_tx,
            handle,
            counters,
            domain: domain.to_string(),
        }
    }

    /// Stop ticking and log the final status
    pub async fn stop(self) -> CounterSnapshot {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
        let snapshot = self.counters.snapshot();
        info!("{}", format_status(&self.domain, &snapshot));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_with_known_total() {
        let counters = ScanCounters::new(Some(8));
        counters.mark_alive();
        counters.mark_alive();
        counters.mark_dead();
        counters.mark_dead();
        assert_eq!(
            format_status("CORP.LOCAL", &counters.snapshot()),
            "Local Admin Enumeration for CORP.LOCAL - 4/8 (50.00%) completed. (2 hosts alive)"
        );
    }

    #[test]
    fn test_status_with_streamed_hosts() {
        let counters = ScanCounters::new(None);
        counters.mark_alive();
        counters.mark_dead();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total, None);
        assert_eq!(
            format_status("CORP.LOCAL", &snapshot),
            "Local Admin Enumeration for CORP.LOCAL - 2 hosts completed."
        );
    }

    #[tokio::test]
    async fn test_reporter_stops() {
        let counters = Arc::new(ScanCounters::new(Some(1)));
        let reporter = ProgressReporter::start("CORP.LOCAL", counters.clone(), Duration::from_millis(20));
        counters.mark_alive();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = reporter.stop().await;
        assert_eq!(snapshot.completed(), 1);
        assert_eq!(snapshot.percentage(), Some(100.0));
    }
}
