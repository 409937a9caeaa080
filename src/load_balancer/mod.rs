//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → Pool identified
//!     → context.rs (RequestContext snapshot of the request head)
//!     → policy.rs (RoutingPolicy::next over the pool's members):
//!         - round_robin.rs (rotate in registration order)
//!         - weighted.rs (round robin over a weight-expanded ring)
//!         - ip_hash.rs (hash of URI or client address)
//!         - least_pending.rs (fewest in-flight requests)
//!     → backend.rs (shared BackendState for the chosen endpoint)
//!     → Return backend or PolicyError
//!
//! Backpressure:
//!     downstream session unwritable → BackendState::increment_throttle
//!     → throttle.rs gate 0→1 edge → every registered upstream throttled
//!     last unwritable session drains → 1→0 edge → every upstream resumes
//! ```
//!
//! # Design Decisions
//! - Endpoint identity is immutable; mutable state lives in BackendState
//! - registry.rs guarantees one BackendState per endpoint across pools
//! - Policies are a closed enum; selection is `&self` and lock-free
//! - Failed backends are skipped by every policy until revived

pub mod backend;
pub mod context;
pub mod endpoint;
pub mod ip_hash;
pub mod least_pending;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod round_robin;
pub mod throttle;
pub mod weighted;

pub use backend::{BackendState, BackendStats, HealthState, PendingGuard};
pub use context::RequestContext;
pub use endpoint::{Endpoint, EndpointError};
pub use policy::{PolicyError, RoutingPolicy, ServerMeta};
pub use pool::{Pool, PoolError};
pub use registry::BackendRegistry;
pub use throttle::{ListenerId, ThrottleGate, ThrottleListener};
