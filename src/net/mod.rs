//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, ALPN)
//!     → negotiator.rs (HTTP/1.1 or HTTP/2 pipeline)
//!     → connection.rs (lifecycle tracking for shutdown)
//!     → Hand off to the HTTP dispatcher
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod negotiator;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use negotiator::{classify_preface, serve, sniff_cleartext, Protocol, Sniff, H2_PREFACE};
pub use tls::{load_tls_acceptor, TlsError};
