//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener settings shared by every bound address.
    pub listener: ListenerConfig,

    /// Flow-control and timeout settings for proxied sessions.
    pub session: SessionConfig,

    /// Backend pools, each with its own routing policy.
    pub pools: Vec<PoolConfig>,

    /// Route definitions mapping a bind address and request to a pool.
    pub routes: Vec<RouteConfig>,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent connections per bound address (backpressure).
    pub max_connections: usize,

    /// Detect HTTP/2 prior-knowledge prefaces on cleartext connections.
    pub h2c_prior_knowledge: bool,

    /// Optional TLS configuration. When present every listener terminates TLS.
    pub tls: Option<TlsConfig>,

    /// Seconds to wait for in-flight connections on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            h2c_prior_knowledge: true,
            tls: None,
            shutdown_grace_secs: 30,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Session flow-control configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound bytes buffered before a session reports itself unwritable.
    pub high_watermark: usize,

    /// Outbound bytes below which an unwritable session becomes writable again.
    pub low_watermark: usize,

    /// Messages written per flush before yielding back to the session loop.
    pub flush_batch: usize,

    /// Idle read timeout in seconds. Zero disables the watchdog.
    pub read_timeout_secs: u64,

    /// Backend connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Extra backends tried when a backend connect fails.
    pub failover_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
            flush_batch: 16,
            read_timeout_secs: 60,
            connect_timeout_secs: 5,
            failover_attempts: 1,
        }
    }
}

/// A named group of backend servers behind one routing policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool identifier referenced by routes.
    pub name: String,

    /// Selection strategy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Member servers, in registration order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Routing policy selection.
///
/// Serialized as `{ type = "round_robin" }`. The camel-case aliases keep
/// older JSON configs (`{"type": "RoundRobin"}`) loadable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    #[serde(alias = "RoundRobin")]
    RoundRobin,
    #[serde(alias = "WeightedRoundRobin")]
    WeightedRoundRobin,
    #[serde(alias = "IpHash")]
    IpHash {
        #[serde(default)]
        key: HashKey,
    },
    #[serde(alias = "LeastPending", alias = "EvenLoad")]
    LeastPending,
}

/// Request attribute hashed by the IP hash policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKey {
    #[default]
    Uri,
    ClientAddress,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Backend location, e.g. "http://127.0.0.1:3000" or "127.0.0.1:3000".
    pub server: String,

    /// Weight for weighted round robin (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Route configuration binding a listener address to a pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Listener address this route is served on (e.g., "0.0.0.0:8080").
    pub bind: String,

    /// Host to match (case-insensitive, port ignored).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Pool name to forward to.
    pub pool: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,

    /// Seconds a backend stays out of rotation after a failed connect.
    pub passive_cooldown_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 2,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            passive_cooldown_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
