//! Connection-pairing and backpressure engine.
//!
//! # Data Flow
//! ```text
//! client request head
//!     → upstream.rs (UpstreamSession, client side)
//!         ├─ RequestHead / body frames ─▶ downstream.rs (DownstreamSession)
//!         │                                   → queue.rs → wire.rs BackendWire → backend
//!         └─ ◀─ ResponseHead / body frames ─┘
//!     → queue.rs → wire.rs ClientWire → client
//!
//! Backpressure:
//!     BackendWire unwritable → backend gate increment → every upstream on
//!     that backend stops reading its client
//!     ClientWire unwritable → paired downstream throttled directly
//! ```
//!
//! # Design Decisions
//! - One tokio task per session; all of a session's state is owned by it
//! - Other tasks reach a session only by posting a [`Command`] to its inbox
//! - Handles expose read-only flags so peers can inspect without locking

pub mod downstream;
pub mod error;
pub mod message;
pub mod queue;
pub mod upstream;
pub mod watchdog;
pub mod wire;

use std::fmt;
use std::future::{self, Future};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use crate::config::SessionConfig;
use crate::load_balancer::{BackendState, Endpoint, ThrottleListener};

pub use error::SessionError;
pub use message::{Frame, Message};
pub use queue::{Flush, SendQueue, SessionState, Wire};
pub use watchdog::Watchdog;
pub use wire::{ProxyBody, WriteBudget};

/// Process-unique session identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Faces the client.
    Upstream,
    /// Faces a backend.
    Downstream,
}

/// The peer on the far side of a session's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    Client(SocketAddr),
    Backend(Endpoint),
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::Client(addr) => write!(f, "{addr}"),
            Remote::Backend(endpoint) => write!(f, "{endpoint}"),
        }
    }
}

/// Observable session flags, written only by the owning task.
#[derive(Debug)]
pub(crate) struct SessionFlags {
    writable: AtomicBool,
    draining: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl SessionFlags {
    fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            writable: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            connected: AtomicBool::new(connected),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    pub(crate) fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub(crate) fn set_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Work posted to a session's inbox.
#[derive(Debug)]
pub(crate) enum Command {
    /// Start connecting (downstream only).
    Connect,
    Send(Message),
    /// Continue a flush that ran out of batch budget.
    Flush,
    /// Stop reading from the transport's peer.
    Throttle,
    Unthrottle,
    /// The transport's pending bytes fell below the low watermark.
    WritabilityChanged,
    /// Drain queued messages, then close.
    Shutdown,
    Abort(SessionError),
    Peer(PeerEvent),
}

/// Lifecycle events from the paired session.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Connected,
    /// Backend connect failed; `unsent` holds every message the downstream
    /// session accepted, in order.
    ConnectFailed {
        error: SessionError,
        unsent: Vec<Message>,
    },
    Closed(Option<SessionError>),
}

/// Capabilities shared by both halves of a proxied exchange.
pub trait ProxyChannel: Send + Sync {
    /// Queue a message. Order is preserved; the message comes back if the
    /// session is gone.
    fn send(&self, message: Message) -> Result<(), Message>;

    /// Stop reading from the peer transport. Idempotent.
    fn throttle(&self);

    /// Resume reading from the peer transport. Idempotent.
    fn unthrottle(&self);

    fn is_writable(&self) -> bool;

    fn is_draining(&self) -> bool;

    fn remote_address(&self) -> &Remote;

    /// Begin connecting. A no-op for sessions whose transport already exists.
    fn run(&self);

    /// Stop admitting sends, flush what is queued, then close.
    fn shutdown(&self);

    /// Close immediately, failing everything still queued.
    fn abort(&self, reason: SessionError);
}

/// Cloneable address of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    kind: SessionKind,
    remote: Remote,
    tx: mpsc::UnboundedSender<Command>,
    flags: Arc<SessionFlags>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub(crate) fn post(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    pub(crate) fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .finish()
    }
}

impl ProxyChannel for SessionHandle {
    fn send(&self, message: Message) -> Result<(), Message> {
        match self.tx.send(Command::Send(message)) {
            Ok(()) => Ok(()),
            Err(SendError(Command::Send(message))) => Err(message),
            // only Send commands are posted here
            Err(SendError(_)) => Ok(()),
        }
    }

    fn throttle(&self) {
        self.post(Command::Throttle);
    }

    fn unthrottle(&self) {
        self.post(Command::Unthrottle);
    }

    fn is_writable(&self) -> bool {
        self.flags.writable.load(Ordering::Acquire)
    }

    fn is_draining(&self) -> bool {
        self.flags.draining.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> &Remote {
        &self.remote
    }

    fn run(&self) {
        self.post(Command::Connect);
    }

    fn shutdown(&self) {
        self.post(Command::Shutdown);
    }

    fn abort(&self, reason: SessionError) {
        self.post(Command::Abort(reason));
    }
}

/// Upstream sessions listen on their backend's throttle gate.
impl ThrottleListener for SessionHandle {
    fn on_throttle(&self) {
        self.throttle();
    }

    fn on_stop_throttle(&self) {
        self.unthrottle();
    }
}

/// Allocate the inbox and handle for a new session.
pub(crate) fn channel(
    kind: SessionKind,
    remote: Remote,
    connected: bool,
) -> (SessionHandle, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id: SessionId::next(),
        kind,
        remote,
        tx,
        flags: SessionFlags::new(connected),
    };
    (handle, rx)
}

/// Per-session tunables, derived from `[session]`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub flush_batch: usize,
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub failover_attempts: usize,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            flush_batch: config.flush_batch,
            read_timeout: (config.read_timeout_secs > 0)
                .then(|| Duration::from_secs(config.read_timeout_secs)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            failover_attempts: config.failover_attempts as usize,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Holds at most one throttle increment on a backend for as long as the
/// owning downstream session's transport is unwritable.
#[derive(Debug)]
pub(crate) struct ThrottleHold {
    backend: Arc<BackendState>,
    held: bool,
}

impl ThrottleHold {
    pub(crate) fn new(backend: Arc<BackendState>) -> Self {
        Self {
            backend,
            held: false,
        }
    }

    /// Track a writability observation. Only transitions touch the gate.
    pub(crate) fn update(&mut self, writable: bool) {
        match (writable, self.held) {
            (false, false) => {
                self.backend.increment_throttle();
                self.held = true;
            }
            (true, true) => {
                self.backend.decrement_throttle();
                self.held = false;
            }
            _ => {}
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for ThrottleHold {
    fn drop(&mut self) {
        self.update(true);
    }
}

/// Await an optional future held in place; pending forever while empty.
/// The caller clears the slot once it yields.
pub(crate) async fn poll_slot<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

/// Next frame of an optional body; pending forever while empty.
pub(crate) async fn next_frame(
    body: &mut Option<Incoming>,
) -> Option<Result<hyper::body::Frame<Bytes>, hyper::Error>> {
    match body.as_mut() {
        Some(body) => body.frame().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::throttle::tests::CountingListener;

    fn backend() -> Arc<BackendState> {
        Arc::new(BackendState::new(
            Endpoint::new("127.0.0.1", 9000),
            Duration::from_secs(10),
        ))
    }

    #[test]
    fn hold_touches_gate_on_transitions_only() {
        let b = backend();
        let mut hold = ThrottleHold::new(b.clone());
        hold.update(true);
        assert_eq!(b.gate().count(), 0);
        hold.update(false);
        hold.update(false);
        assert_eq!(b.gate().count(), 1);
        assert!(hold.is_held());
        drop(hold);
        assert_eq!(b.gate().count(), 0);
    }

    // Two upstream sessions S1/S2 depend on backend B through two downstream
    // sessions. Both downstreams go unwritable then drain: S1 and S2 must
    // each see exactly one throttle and one resume.
    #[tokio::test]
    async fn shared_backend_throttles_each_upstream_once() {
        let b = backend();
        let s1 = Arc::new(CountingListener::default());
        let s2 = Arc::new(CountingListener::default());
        b.register_listener(s1.clone());
        b.register_listener(s2.clone());

        let mut d1 = ThrottleHold::new(b.clone());
        let mut d2 = ThrottleHold::new(b.clone());
        d1.update(false);
        d2.update(false);
        assert_eq!(s1.counts(), (1, 0));
        assert_eq!(s2.counts(), (1, 0));

        d1.update(true);
        assert_eq!(s1.counts(), (1, 0));
        d2.update(true);
        assert_eq!(s1.counts(), (1, 1));
        assert_eq!(s2.counts(), (1, 1));
    }

    #[tokio::test]
    async fn handle_listener_posts_commands() {
        let b = backend();
        let (handle, mut inbox) = channel(
            SessionKind::Upstream,
            Remote::Client("127.0.0.1:5000".parse().unwrap()),
            true,
        );
        b.register_listener(Arc::new(handle.clone()));

        b.increment_throttle();
        b.decrement_throttle();
        assert!(matches!(inbox.recv().await, Some(Command::Throttle)));
        assert!(matches!(inbox.recv().await, Some(Command::Unthrottle)));
    }

    #[test]
    fn send_to_closed_session_returns_message() {
        let (handle, inbox) = channel(
            SessionKind::Downstream,
            Remote::Backend(Endpoint::new("127.0.0.1", 1)),
            false,
        );
        drop(inbox);
        assert!(handle.is_closed());
        let returned = handle.send(Message::new(Frame::End)).unwrap_err();
        assert!(matches!(returned.frame(), Frame::End));
    }

    #[test]
    fn settings_from_config() {
        let config = SessionConfig {
            read_timeout_secs: 0,
            ..SessionConfig::default()
        };
        let settings = SessionSettings::from(&config);
        assert!(settings.read_timeout.is_none());
        assert_eq!(settings.flush_batch, 16);
        assert_eq!(settings.failover_attempts, 1);
    }
}
