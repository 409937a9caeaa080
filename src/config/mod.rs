//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, or JSON by extension)
//!     → loader.rs (parse & deserialize, reject global errors)
//!     → ProxyConfig
//!     → routing::RouteTable::build (validation.rs per pool/route)
//!     → published via ArcSwap to every connection
//!
//! On change:
//!     watcher.rs detects change (deduplicated by fingerprint)
//!     → loader.rs loads new config
//!     → ProxyServer::on_config_changed
//!     → offending pools/routes keep their previous generation
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation errors are scoped so one bad pool cannot take down the rest

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    HashKey, HealthCheckConfig, ListenerConfig, ObservabilityConfig, PolicyConfig, PoolConfig,
    ProxyConfig, RouteConfig, ServerConfig, SessionConfig, TlsConfig,
};
