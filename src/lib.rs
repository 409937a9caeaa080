//! tandem-proxy: a reverse proxy with symmetric backpressure.
//!
//! Every proxied request is a pair of sessions. The upstream half owns the
//! client side, the downstream half owns the backend connection, and the two
//! exchange frames and flow-control commands over channels. A backend that
//! cannot keep up raises a throttle shared by every client using it.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod session;

// Traffic management
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::{ProxyServer, ServerError};
pub use lifecycle::Shutdown;
