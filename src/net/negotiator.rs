//! Per-connection protocol negotiation.
//!
//! # Responsibilities
//! - Decide HTTP/1.1 vs HTTP/2 once per accepted connection
//!   - TLS: ALPN `h2` selects HTTP/2, anything else HTTP/1.1
//!   - Cleartext: an HTTP/2 prior-knowledge preface selects HTTP/2
//! - Run the matching hyper server pipeline until the connection ends or a
//!   graceful shutdown is requested
//!
//! The decision is fixed for the connection lifetime and is also the
//! protocol used toward backends for every request it carries.

use std::convert::Infallible;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::session::ProxyBody;

/// HTTP/2 connection preface sent by prior-knowledge clients.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const SNIFF_ATTEMPTS: usize = 20;
const SNIFF_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// Protocol selected by a negotiated ALPN id.
    pub fn from_alpn(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(b"h2") => Protocol::Http2,
            _ => Protocol::Http1,
        }
    }

    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            Protocol::Http1 => b"http/1.1",
            Protocol::Http2 => b"h2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

/// Result of inspecting the first bytes of a cleartext connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Http1,
    Http2,
    /// Consistent with the preface so far; wait for more bytes.
    NeedMore,
}

pub fn classify_preface(buf: &[u8]) -> Sniff {
    if buf.len() >= H2_PREFACE.len() {
        if buf.starts_with(H2_PREFACE) {
            Sniff::Http2
        } else {
            Sniff::Http1
        }
    } else if H2_PREFACE.starts_with(buf) {
        Sniff::NeedMore
    } else {
        Sniff::Http1
    }
}

/// Peek at a cleartext connection without consuming bytes.
/// Falls back to HTTP/1.1 if the preface never completes.
pub async fn sniff_cleartext(stream: &TcpStream) -> std::io::Result<Protocol> {
    let mut buf = [0u8; H2_PREFACE.len()];
    for _ in 0..SNIFF_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        match classify_preface(&buf[..n]) {
            Sniff::Http2 => return Ok(Protocol::Http2),
            Sniff::Http1 => return Ok(Protocol::Http1),
            Sniff::NeedMore if n == 0 => return Ok(Protocol::Http1),
            Sniff::NeedMore => tokio::time::sleep(SNIFF_BACKOFF).await,
        }
    }
    Ok(Protocol::Http1)
}

/// Serve one connection with the pipeline for `protocol`.
///
/// When `shutdown` flips to true the connection stops accepting new requests
/// and finishes in-flight ones.
pub async fn serve<I, S>(
    io: I,
    protocol: Protocol,
    service: S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let io = TokioIo::new(io);
    match protocol {
        Protocol::Http1 => {
            let conn = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => result,
                _ = stopped(&mut shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            }
        }
        Protocol::Http2 => {
            let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => result,
                _ = stopped(&mut shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            }
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
