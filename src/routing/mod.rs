//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request head (bind address, host, path)
//!     → router.rs (route lookup in the current generation)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route (with its pool) or None
//!
//! Route compilation (startup and every reload):
//!     ProxyConfig
//!     → Pool::build per pool, validate_route per route
//!     → rejected definitions fall back to the previous generation
//!     → sort by priority, freeze as RouteTable
//! ```
//!
//! # Design Decisions
//! - Tables are immutable; reload builds a new one and swaps it in
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

pub use matcher::{request_host, AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
pub use router::{BuildError, Route, RouteTable};
