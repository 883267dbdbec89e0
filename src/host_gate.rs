//! Host liveness gate
//!
//! Probes each host once per run and memoizes the answer. A dead host never
//! reaches the resolver.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::cache::SharedCache;
use crate::common_types::Liveness;

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// True when the host answered within `probe_timeout`
    async fn probe(&self, host: &str, probe_timeout: Duration) -> bool;
}

/// TCP handshake against the host's SMB port
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self, host: &str, probe_timeout: Duration) -> bool {
        match timeout(probe_timeout, TcpStream::connect((host, self.port))).await {
            Ok(Ok(_)) => true,
            // A refusal is an answer from a live host
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => true,
            Ok(Err(e)) => {
                debug!("Probe of {}:{} failed: {}", host, self.port, e);
                false
            }
            Err(_elapsed) => false,
        }
    }
}

pub struct HostGate {
    probe: Arc<dyn LivenessProbe>,
    cache: SharedCache<String, bool>,
    skip_probe: bool,
    probe_timeout: Duration,
}

impl HostGate {
    pub fn new(probe: Arc<dyn LivenessProbe>, skip_probe: bool, probe_timeout: Duration) -> Self {
        Self {
            probe,
            cache: SharedCache::new(),
            skip_probe,
            probe_timeout,
        }
    }

    pub async fn is_alive(&self, host: &str) -> bool {
        if self.skip_probe {
            return true;
        }
        let key = host.to_lowercase();
        if let Some(alive) = self.cache.get(&key) {
            return alive;
        }
        let alive = self.probe.probe(host, self.probe_timeout).await;
        self.cache.get_or_insert(key, alive)
    }

    /// Cached state without probing
    pub fn state(&self, host: &str) -> Liveness {
        if self.skip_probe {
            return Liveness::Alive;
        }
        self.cache
            .get(&host.to_lowercase())
            .map(Liveness::from)
            .unwrap_or(Liveness::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        alive: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LivenessProbe for CountingProbe {
        async fn probe(&self, _host: &str, _probe_timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive
        }
    }

    fn gate(alive: bool, skip: bool) -> (HostGate, Arc<CountingProbe>) {
        let probe = Arc::new(CountingProbe { alive, calls: AtomicUsize::new(0) });
        (HostGate::new(probe.clone(), skip, Duration::from_millis(50)), probe)
    }

    #[tokio::test]
    async fn test_probe_result_is_memoized() {
        let (gate, probe) = gate(false, false);
        assert_eq!(gate.state("ws01"), Liveness::Unknown);
        assert!(!gate.is_alive("ws01").await);
        assert!(!gate.is_alive("WS01").await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state("ws01"), Liveness::Dead);
    }

    #[tokio::test]
    async fn test_skip_bypasses_probe() {
        let (gate, probe) = gate(false, true);
        assert!(gate.is_alive("ws01").await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gate.state("ws01"), Liveness::Alive);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(port);
        assert!(probe.probe("127.0.0.1", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused_counts_alive() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe::new(port);
        assert!(probe.probe("127.0.0.1", Duration::from_secs(2)).await);
    }
}
