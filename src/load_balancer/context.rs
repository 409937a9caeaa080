//! Request snapshot consulted by routing policies.

use std::net::SocketAddr;

use hyper::http::request::Parts;
use hyper::http::Uri;

/// Read-only view of one request head, built once when the head arrives.
#[derive(Debug, Clone)]
pub struct RequestContext {
    uri: Uri,
    client_address: SocketAddr,
}

impl RequestContext {
    pub fn new(uri: Uri, client_address: SocketAddr) -> Self {
        Self { uri, client_address }
    }

    pub fn from_parts(parts: &Parts, client_address: SocketAddr) -> Self {
        Self::new(parts.uri.clone(), client_address)
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }
}
