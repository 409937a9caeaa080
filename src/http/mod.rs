//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept, negotiate, dispatch)
//!     → routing + load balancer pick a backend
//!     → session pair relays the exchange
//!         request.rs  (hop-by-hop removal, URI form for the backend)
//!         response.rs (hop-by-hop removal, gateway error bodies)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use server::{ProxyServer, ServerError};
