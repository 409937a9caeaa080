//! Shared per-backend state.
//!
//! # Responsibilities
//! - Track pending/completed/failed requests and bytes in each direction
//! - Track health state (Unknown/Healthy/Unhealthy) with thresholds
//! - Own the backend's throttle gate
//!
//! One `BackendState` exists per distinct [`Endpoint`]; every pool, route and
//! session referencing that endpoint shares it through an `Arc`.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::throttle::{ListenerId, ThrottleGate, ThrottleListener};

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Point-in-time copy of a backend's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendStats {
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub throttle_count: usize,
}

fn now_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Mutable state shared by everything addressing one backend.
#[derive(Debug)]
pub struct BackendState {
    endpoint: Endpoint,

    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    /// While Unhealthy, selection may retry the backend after this instant
    /// (milliseconds since process start).
    retry_after_ms: AtomicU64,
    cooldown_ms: AtomicU64,

    gate: ThrottleGate,
}

impl BackendState {
    /// Create state for a backend. `cooldown` is how long a passively failed
    /// backend stays out of rotation.
    pub fn new(endpoint: Endpoint, cooldown: Duration) -> Self {
        Self {
            endpoint,
            pending: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            retry_after_ms: AtomicU64::new(0),
            cooldown_ms: AtomicU64::new(cooldown.as_millis() as u64),
            gate: ThrottleGate::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.load(Ordering::Relaxed))
    }

    /// Change the passive cooldown. Applies from the next `mark_failed`.
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.cooldown_ms
            .store(cooldown.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Traffic ---

    /// Number of requests currently in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Count a request as in flight until the guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::Relaxed);
        PendingGuard {
            backend: self.clone(),
            succeeded: false,
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            pending: self.pending(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            throttle_count: self.gate.count(),
        }
    }

    // --- Throttle ---

    /// Register a throttle listener on this backend's gate.
    pub fn register_listener(&self, listener: Arc<dyn ThrottleListener>) -> ListenerId {
        self.gate.register(listener)
    }

    pub fn deregister_listener(&self, id: ListenerId) {
        self.gate.deregister(id);
    }

    /// One more session to this backend became unwritable.
    pub fn increment_throttle(&self) -> usize {
        let count = self.gate.increment();
        if count == 1 {
            tracing::debug!(endpoint = %self.endpoint, "Backend throttled");
            crate::observability::metrics::record_throttle_edge(&self.endpoint, true);
        }
        count
    }

    /// A previously unwritable session to this backend drained.
    pub fn decrement_throttle(&self) -> usize {
        let count = self.gate.decrement();
        if count == 0 {
            tracing::debug!(endpoint = %self.endpoint, "Backend throttle released");
            crate::observability::metrics::record_throttle_edge(&self.endpoint, false);
        }
        count
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// True if the backend may be selected: not Unhealthy, or Unhealthy but
    /// past its passive cooldown.
    pub fn is_live(&self) -> bool {
        if self.health() != HealthState::Unhealthy {
            return true;
        }
        let retry_after = self.retry_after_ms.load(Ordering::Relaxed);
        retry_after != 0 && now_millis() + 1 >= retry_after
    }

    /// Take the backend out of rotation immediately (passive failure).
    pub fn mark_failed(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
        // stored off by one so zero can mean "no cooldown"
        let retry_after = now_millis() + self.cooldown_ms.load(Ordering::Relaxed) + 1;
        self.retry_after_ms.store(retry_after, Ordering::Relaxed);
    }

    /// Put the backend back into rotation immediately.
    pub fn mark_live(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.retry_after_ms.store(0, Ordering::Relaxed);
        self.state.store(HealthState::Healthy as u8, Ordering::Relaxed);
    }

    /// Report a successful active check.
    pub fn mark_success(&self, healthy_threshold: usize) {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Healthy {
            return;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.mark_live();
            tracing::info!(endpoint = %self.endpoint, "Backend healthy");
        }
    }

    /// Report a failed active check.
    pub fn mark_failure(&self, unhealthy_threshold: usize) {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Unhealthy {
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            // actively failed backends come back through checks, not cooldown
            self.retry_after_ms.store(0, Ordering::Relaxed);
            tracing::warn!(endpoint = %self.endpoint, failures, "Backend unhealthy");
        }
    }
}

/// RAII guard counting one in-flight request against a backend.
#[derive(Debug)]
pub struct PendingGuard {
    backend: Arc<BackendState>,
    succeeded: bool,
}

impl PendingGuard {
    /// Count the request as completed rather than failed when dropped.
    pub fn succeed(&mut self) {
        self.succeeded = true;
    }
}

impl Deref for PendingGuard {
    type Target = BackendState;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.backend.pending.fetch_sub(1, Ordering::Relaxed);
        if self.succeeded {
            self.backend.completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
