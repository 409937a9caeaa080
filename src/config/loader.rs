//! Configuration loading from disk.
//!
//! TOML is the native format. Files ending in `.json` are parsed as JSON so
//! configs written for older deployments keep working.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{join_errors, validate_settings, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// On-disk configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Pick the format from the file extension, defaulting to TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

/// Load a configuration file.
///
/// Fails on unreadable or unparsable files and on global setting errors.
/// Pool- and route-scoped problems are left for the route table build so a
/// reload can reject only the offenders.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, Format::from_path(path))
}

/// Parse configuration text in the given format.
pub fn parse_config(content: &str, format: Format) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = match format {
        Format::Toml => toml::from_str(content)?,
        Format::Json => serde_json::from_str(content)?,
    };

    let fatal = validate_settings(&config);
    if !fatal.is_empty() {
        return Err(ConfigError::Validation(fatal));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{HashKey, PolicyConfig};

    const SAMPLE: &str = r#"
[listener]
max_connections = 512

[session]
high_watermark = 8192
low_watermark = 4096

[[pools]]
name = "web"
policy = { type = "weighted_round_robin" }
servers = [
  { server = "http://127.0.0.1:3000", weight = 3 },
  { server = "http://127.0.0.1:3001" },
]

[[pools]]
name = "sticky"
policy = { type = "ip_hash", key = "client_address" }
servers = [{ server = "127.0.0.1:4000" }]

[[routes]]
name = "site"
bind = "127.0.0.1:8080"
host = "example.com"
pool = "web"
"#;

    #[test]
    fn parses_toml() {
        let config = parse_config(SAMPLE, Format::Toml).unwrap();
        assert_eq!(config.listener.max_connections, 512);
        assert_eq!(config.session.high_watermark, 8192);
        // untouched sections keep their defaults
        assert_eq!(config.session.flush_batch, 16);

        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].policy, PolicyConfig::WeightedRoundRobin);
        assert_eq!(config.pools[0].servers[0].weight, 3);
        assert_eq!(config.pools[0].servers[1].weight, 1);
        assert_eq!(
            config.pools[1].policy,
            PolicyConfig::IpHash { key: HashKey::ClientAddress }
        );
        assert_eq!(config.routes[0].host.as_deref(), Some("example.com"));
    }

    #[test]
    fn parses_legacy_json() {
        let json = r#"{
            "pools": [
                { "name": "api", "policy": { "type": "RoundRobin" },
                  "servers": [ { "server": "http://10.0.0.1:80" } ] },
                { "name": "even", "policy": { "type": "EvenLoad" },
                  "servers": [ { "server": "http://10.0.0.2:80" } ] }
            ],
            "routes": [ { "name": "r", "bind": "0.0.0.0:8080", "pool": "api" } ]
        }"#;
        let config = parse_config(json, Format::Json).unwrap();
        assert_eq!(config.pools[0].policy, PolicyConfig::RoundRobin);
        assert_eq!(config.pools[1].policy, PolicyConfig::LeastPending);
    }

    #[test]
    fn rejects_global_errors_only() {
        let bad = "[session]\nhigh_watermark = 10\nlow_watermark = 20\n";
        assert!(matches!(
            parse_config(bad, Format::Toml),
            Err(ConfigError::Validation(_))
        ));

        // unknown pool reference is route-scoped and does not fail the load
        let scoped = "[[routes]]\nname = \"r\"\nbind = \"127.0.0.1:1\"\npool = \"nope\"\n";
        assert!(parse_config(scoped, Format::Toml).is_ok());
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(Format::from_path(Path::new("proxy.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("proxy.toml")), Format::Toml);
        assert_eq!(Format::from_path(Path::new("proxy")), Format::Toml);
    }
}
