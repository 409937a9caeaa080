//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → TCP connect to each registered backend
//!     → BackendState::mark_success / mark_failure
//!
//! Passive health (session::upstream):
//!     Backend connect fails
//!     → RoutingPolicy::mark_failed
//!     → out of rotation until cooldown or a passing check
//! ```
//!
//! # Design Decisions
//! - Active transitions require consecutive successes/failures
//! - Health state is per-backend, not per-pool

pub mod active;

pub use active::HealthMonitor;
