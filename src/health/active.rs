//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered backend with a TCP connect
//! - Feed results into the backend's consecutive success/failure counters
//!
//! Backends taken out of rotation by a failed connect come back either
//! through these checks or after their passive cooldown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::load_balancer::{BackendRegistry, BackendState};
use crate::observability::metrics;
use crate::resilience::connect_with_timeout;

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthCheckConfig) -> Self {
        Self { registry, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            timeout_secs = self.config.timeout_secs,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// Probe every registered backend once, concurrently.
    pub async fn check_all(&self) {
        let backends = self.registry.all();
        join_all(backends.iter().map(|backend| self.check(backend))).await;
    }

    async fn check(&self, backend: &Arc<BackendState>) {
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        match connect_with_timeout(backend.endpoint(), timeout).await {
            Ok(_) => backend.mark_success(self.config.healthy_threshold as usize),
            Err(e) => {
                tracing::debug!(endpoint = %backend.endpoint(), error = %e, "Health check failed");
                backend.mark_failure(self.config.unhealthy_threshold as usize);
            }
        }
        metrics::record_backend_health(backend.endpoint(), backend.is_live());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{Endpoint, HealthState};

    fn config(healthy: u32, unhealthy: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 1,
            timeout_secs: 1,
            healthy_threshold: healthy,
            unhealthy_threshold: unhealthy,
            ..HealthCheckConfig::default()
        }
    }

    #[tokio::test]
    async fn unreachable_backend_goes_unhealthy_after_threshold() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(30)));
        let backend = registry.get_or_insert(&Endpoint::new("127.0.0.1", port));
        let monitor = HealthMonitor::new(registry, config(1, 2));

        monitor.check_all().await;
        assert_ne!(backend.health(), HealthState::Unhealthy);
        monitor.check_all().await;
        assert_eq!(backend.health(), HealthState::Unhealthy);
        assert!(!backend.is_live());
    }

    #[tokio::test]
    async fn reachable_backend_is_revived() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(30)));
        let backend = registry.get_or_insert(&Endpoint::new("127.0.0.1", port));
        backend.mark_failed();
        assert!(!backend.is_live());

        let monitor = HealthMonitor::new(registry, config(2, 3));
        monitor.check_all().await;
        assert!(!backend.is_live());
        monitor.check_all().await;
        assert_eq!(backend.health(), HealthState::Healthy);
        assert!(backend.is_live());
    }

    #[tokio::test]
    async fn disabled_monitor_returns_immediately() {
        let registry = Arc::new(BackendRegistry::new(Duration::from_secs(1)));
        let (_tx, rx) = broadcast::channel(1);
        let mut cfg = config(1, 1);
        cfg.enabled = false;
        HealthMonitor::new(registry, cfg).run(rx).await;
    }
}
