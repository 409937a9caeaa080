//! Backend identity.
//!
//! An [`Endpoint`] is the immutable (host, port) pair a backend is known by.
//! Its identity key is computed once at construction so the registry map and
//! the hashing policies never rehash the host string on the request path.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Error returned when a server string cannot be turned into an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid server address `{input}`: {reason}")]
    Invalid { input: String, reason: String },
    #[error("unsupported scheme `{scheme}` in `{input}`")]
    Scheme { input: String, scheme: String },
}

/// Immutable network identity of a backend.
#[derive(Clone)]
pub struct Endpoint {
    host: Arc<str>,
    port: u16,
    key: u64,
}

impl Endpoint {
    /// Build an endpoint. The host is lowercased.
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        let host: Arc<str> = Arc::from(host.as_ref().to_ascii_lowercase());
        let key = xxh3_64(format!("{}:{}", host, port).as_bytes());
        Self { host, port, key }
    }

    /// Parse `http://host:port[/...]` or bare `host:port`.
    ///
    /// A missing port defaults to 80.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let invalid = |reason: String| EndpointError::Invalid {
            input: input.to_string(),
            reason,
        };

        let candidate = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{}", input)
        };
        let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;

        if url.scheme() != "http" {
            return Err(EndpointError::Scheme {
                input: input.to_string(),
                scheme: url.scheme().to_string(),
            });
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        // Url keeps the brackets around IPv6 literals; connect() wants them gone
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Precomputed identity hash.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// `host:port` as used in a URI authority.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.port == other.port && self.host == other.host
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.authority())
    }
}
