//! Hash-based sticky strategy.
//!
//! `index = xxh3(key) mod server_count`, where the key is the request path
//! and query or the client address. Hashing only the path and query keeps
//! the origin-form (HTTP/1.1) and absolute-form (HTTP/2) of one resource on
//! the same backend. The mapping is deterministic for a fixed server set
//! but there is no consistent-hashing ring: adding or removing a server
//! remaps most keys.
//!
//! When the hashed slot is not eligible the policy probes forward, so a
//! failed backend only displaces the keys that mapped to it.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::config::HashKey;
use crate::load_balancer::backend::BackendState;
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::PolicyError;

#[derive(Debug)]
pub struct IpHash {
    servers: Vec<Arc<BackendState>>,
    key: HashKey,
}

impl IpHash {
    pub fn new(key: HashKey) -> Self {
        Self {
            servers: Vec::new(),
            key,
        }
    }

    pub fn add(&mut self, backend: Arc<BackendState>) {
        self.servers.push(backend);
    }

    pub fn servers(&self) -> &[Arc<BackendState>] {
        &self.servers
    }

    fn hash(&self, ctx: &RequestContext) -> u64 {
        match self.key {
            HashKey::Uri => {
                let key = ctx.uri().path_and_query().map_or("/", |pq| pq.as_str());
                xxh3_64(key.as_bytes())
            }
            HashKey::ClientAddress => xxh3_64(ctx.client_address().ip().to_string().as_bytes()),
        }
    }

    pub fn pick(
        &self,
        ctx: &RequestContext,
        eligible: impl Fn(&BackendState) -> bool,
    ) -> Result<Arc<BackendState>, PolicyError> {
        if self.servers.is_empty() {
            return Err(PolicyError::NoServers);
        }

        let len = self.servers.len();
        let start = (self.hash(ctx) % len as u64) as usize;
        for i in 0..len {
            let backend = &self.servers[(start + i) % len];
            if eligible(backend) {
                return Ok(backend.clone());
            }
        }
        Err(PolicyError::NoLiveServers)
    }
}
