/// Backend shard health probing
///
/// A background monitor probes every shard's endpoints on the configured
/// interval. When a shard transitions to unhealthy its pool's idle
/// connections are invalidated, so the next acquire silently replaces
/// them instead of handing out a wire to a dead server.
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::pool::PoolRegistry;
use crate::core::Shard;

/// Health status of a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, shard: &Shard) -> HealthStatus;

    fn check_timeout(&self) -> Duration;
}

/// TCP connect probe: a shard is healthy when any endpoint accepts.
pub struct TcpHealthChecker {
    probe_timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

#[async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn check(&self, shard: &Shard) -> HealthStatus {
        let mut last_reason = String::new();
        for host in &shard.hosts {
            match timeout(self.probe_timeout, TcpStream::connect(host)).await {
                Ok(Ok(_stream)) => return HealthStatus::Healthy,
                Ok(Err(e)) => last_reason = format!("{}: {}", host, e),
                Err(_) => return HealthStatus::Timeout,
            }
        }
        HealthStatus::Unhealthy {
            reason: last_reason,
        }
    }

    fn check_timeout(&self) -> Duration {
        self.probe_timeout
    }
}

/// Periodic monitor over all registered shards.
pub struct HealthMonitor {
    checker: Box<dyn HealthChecker>,
    pools: Arc<PoolRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(checker: Box<dyn HealthChecker>, pools: Arc<PoolRegistry>, interval: Duration) -> Self {
        Self {
            checker,
            pools,
            interval,
        }
    }

    /// One probe pass. Returns the shards that turned unhealthy.
    pub async fn probe_once(&self, last: &mut HashMap<String, bool>) -> Vec<String> {
        let mut went_down = Vec::new();
        for name in self.pools.shard_names().await {
            let Some(shard) = self.pools.shard_descriptor(&name).await else {
                continue;
            };
            let status = self.checker.check(&shard).await;
            let healthy = status.is_healthy();
            let was_healthy = last.insert(name.clone(), healthy).unwrap_or(true);

            if was_healthy && !healthy {
                warn!(shard = %name, "shard went unhealthy: {}", status);
                if let Ok(pool) = self.pools.pool_for(&name).await {
                    pool.invalidate_all().await;
                }
                went_down.push(name);
            } else if !was_healthy && healthy {
                debug!(shard = %name, "shard recovered");
            }
        }
        went_down
    }

    /// Background probing loop, run as a detached task.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        let mut last: HashMap<String, bool> = HashMap::new();
        loop {
            interval.tick().await;
            self.probe_once(&mut last).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::test_support::{test_shard, MockDialer};
    use crate::core::pool::BackendDialer;

    struct ScriptedChecker {
        healthy: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn check(&self, _shard: &Shard) -> HealthStatus {
            if self.healthy.load(std::sync::atomic::Ordering::Relaxed) {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "scripted failure".to_string(),
                }
            }
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_millis(100)
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy {
                reason: "refused".to_string()
            }
            .to_string(),
            "Unhealthy: refused"
        );
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_tcp_checker_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut shard = test_shard("sh1", 4);
        shard.hosts = vec![addr.to_string()];

        let checker = TcpHealthChecker::new(Duration::from_millis(500));
        assert!(checker.check(&shard).await.is_healthy());
    }

    #[tokio::test]
    async fn test_tcp_checker_refused() {
        // Bind then drop to find a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut shard = test_shard("sh1", 4);
        shard.hosts = vec![addr.to_string()];

        let checker = TcpHealthChecker::new(Duration::from_millis(500));
        assert!(!checker.check(&shard).await.is_healthy());
    }

    #[tokio::test]
    async fn test_unhealthy_transition_invalidates_idle() {
        let dialer = Arc::new(MockDialer::new());
        let pools = Arc::new(PoolRegistry::new(
            vec![test_shard("sh1", 4)],
            dialer as Arc<dyn BackendDialer>,
            Duration::from_millis(100),
        ));

        // Park one idle conn in the pool.
        let pool = pools.pool_for("sh1").await.unwrap();
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;
        assert_eq!(pool.stats().await.idle, 1);

        let healthy_flag = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let checker = Box::new(ScriptedChecker {
            healthy: Arc::clone(&healthy_flag),
        });
        let monitor = HealthMonitor::new(checker, Arc::clone(&pools), Duration::from_secs(10));

        let mut last = HashMap::new();
        assert!(monitor.probe_once(&mut last).await.is_empty());
        assert_eq!(pool.stats().await.idle, 1);

        // Flip to unhealthy: the transition clears the idle FIFO.
        healthy_flag.store(false, std::sync::atomic::Ordering::Relaxed);
        let down = monitor.probe_once(&mut last).await;
        assert_eq!(down, vec!["sh1".to_string()]);
        assert_eq!(pool.stats().await.idle, 0);

        // Staying down is not a new transition.
        assert!(monitor.probe_once(&mut last).await.is_empty());
    }
}
