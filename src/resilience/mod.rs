//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream session connect:
//!     → timeouts.rs (bounded TCP connect)
//!     → On failure: ConnectFailed back to the upstream session
//!         → retries.rs (attempt left? pick an endpoint not yet tried)
//!         → replay unsent messages, or answer 502
//! ```
//!
//! # Design Decisions
//! - Every backend connect has a deadline
//! - Failover only before the first byte reaches a backend
//! - Failed endpoints drop out of rotation through passive health marking

pub mod retries;
pub mod timeouts;

pub use retries::FailoverState;
pub use timeouts::connect_with_timeout;
