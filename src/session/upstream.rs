//! Client-facing half of a proxied exchange.
//!
//! # Responsibilities
//! - Own the client request body and the response channel back to hyper
//! - Pair with a downstream session and forward the request to it
//! - Stop reading the client while the backend's throttle gate is raised
//! - Throttle the paired downstream while the client cannot keep up
//! - Fail over to another endpoint when the backend connect fails
//!
//! # Lifecycle
//! ```text
//! spawn → register on backend gate → downstream.run() → RequestHead sent
//!     Peer(Connected)      → start reading the client body
//!     Peer(ConnectFailed)  → mark failed, pick another endpoint, replay unsent
//!     End written          → Closed
//! ```

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::{Body, Incoming};
use hyper::{Request, Response, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::load_balancer::{BackendState, ListenerId, Pool, RequestContext};
use crate::net::Protocol;
use crate::observability::metrics;
use crate::resilience::FailoverState;
use crate::session::error::SessionError;
use crate::session::message::{Frame, Message};
use crate::session::queue::{Flush, SendQueue, Wire};
use crate::session::watchdog::Watchdog;
use crate::session::wire::{ClientWire, ProxyBody, WriteBudget};
use crate::session::{
    self, downstream, next_frame, Command, PeerEvent, ProxyChannel, Remote, SessionHandle,
    SessionKind, SessionSettings,
};

/// Everything needed to start proxying one request.
pub(crate) struct UpstreamRequest {
    pub request: Request<Incoming>,
    pub client: SocketAddr,
    pub backend: Arc<BackendState>,
    pub pool: Arc<Pool>,
    pub context: RequestContext,
    pub protocol: Protocol,
    pub settings: SessionSettings,
}

enum Exit {
    Done,
    Drained,
    Failed(SessionError),
}

struct UpstreamSession {
    handle: SessionHandle,
    inbox: mpsc::UnboundedReceiver<Command>,
    pool: Arc<Pool>,
    context: RequestContext,
    protocol: Protocol,
    settings: SessionSettings,

    queue: SendQueue,
    wire: ClientWire,
    client_writable: bool,
    body: Option<Incoming>,
    throttled: bool,
    watchdog: Watchdog,

    peer: SessionHandle,
    peer_connected: bool,
    end_received: bool,
    backend: Arc<BackendState>,
    listener: ListenerId,
    /// Frames the peer refused because it was shutting down after a failed
    /// connect; replayed after `unsent` on failover.
    stash: Vec<Message>,
    failover: FailoverState,

    method: String,
    status: Option<StatusCode>,
    started: Instant,
}

/// Start proxying `request`. The receiver yields the response head (with a
/// streaming body) or a gateway error; it is dropped without a value only
/// if the session dies before either exists.
pub(crate) fn spawn(params: UpstreamRequest) -> oneshot::Receiver<Response<ProxyBody>> {
    let UpstreamRequest {
        request,
        client,
        backend,
        pool,
        context,
        protocol,
        settings,
    } = params;

    let (parts, body) = request.into_parts();
    let end_of_stream = body.is_end_stream();
    let method = parts.method.to_string();

    let (handle, inbox) = session::channel(SessionKind::Upstream, Remote::Client(client), true);
    let (respond, response) = oneshot::channel();
    let budget = WriteBudget::new(settings.high_watermark, settings.low_watermark, handle.sender());

    // registered before the peer exists so a raised gate is seen before any read
    let listener = backend.register_listener(Arc::new(handle.clone()));
    let peer = downstream::spawn(backend.clone(), handle.clone(), protocol, &settings);
    peer.run();

    let mut stash = Vec::new();
    if let Err(head) = peer.send(Message::new(Frame::RequestHead {
        parts,
        end_of_stream,
    })) {
        stash.push(head);
    }

    let session = UpstreamSession {
        inbox,
        pool,
        context,
        protocol,
        queue: SendQueue::active(settings.flush_batch),
        wire: ClientWire::new(respond, budget),
        client_writable: true,
        body: (!end_of_stream).then_some(body),
        throttled: false,
        watchdog: Watchdog::new(settings.read_timeout),
        peer,
        peer_connected: false,
        end_received: false,
        failover: FailoverState::new(backend.endpoint().clone(), settings.failover_attempts),
        backend,
        listener,
        stash,
        method,
        status: None,
        started: Instant::now(),
        settings,
        handle,
    };
    metrics::session_opened("upstream");
    tokio::spawn(session.run());
    response
}

impl UpstreamSession {
    async fn run(mut self) {
        tracing::debug!(
            session_id = %self.handle.id(),
            client = %self.handle.remote_address(),
            endpoint = %self.backend.endpoint(),
            "Upstream session started"
        );

        let exit = loop {
            let step = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => ControlFlow::Break(Exit::Failed(SessionError::PeerGone)),
                },
                frame = next_frame(&mut self.body), if self.peer_connected && !self.throttled => {
                    self.on_client_frame(frame)
                }
                _ = self.watchdog.expired() => {
                    let timeout = self.watchdog.timeout().unwrap_or_default();
                    ControlFlow::Break(Exit::Failed(SessionError::ReadTimeout(timeout)))
                }
            };
            if let ControlFlow::Break(exit) = step {
                break exit;
            }
        };

        self.finish(exit);
    }

    fn reading(&self) -> bool {
        self.body.is_some() && self.peer_connected && !self.throttled
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<Exit> {
        match command {
            Command::Send(message) => {
                match message.frame() {
                    Frame::ResponseHead(parts) => self.status = Some(parts.status),
                    Frame::End => self.end_received = true,
                    _ => {}
                }
                let result = self.queue.send(message, &mut self.wire);
                self.after_write(result)
            }
            Command::Flush | Command::WritabilityChanged => {
                let result = self.queue.flush(&mut self.wire);
                self.after_write(result)
            }
            Command::Throttle => {
                if !self.throttled {
                    tracing::trace!(session_id = %self.handle.id(), "Client reads paused");
                }
                self.throttled = true;
                self.watchdog.disarm();
                ControlFlow::Continue(())
            }
            Command::Unthrottle => {
                if self.throttled {
                    tracing::trace!(session_id = %self.handle.id(), "Client reads resumed");
                }
                self.throttled = false;
                if self.reading() {
                    self.watchdog.arm();
                }
                ControlFlow::Continue(())
            }
            Command::Shutdown => {
                if self.queue.begin_drain() {
                    self.handle.flags().set_draining();
                }
                let result = self.queue.flush(&mut self.wire);
                self.after_write(result)
            }
            Command::Abort(reason) => ControlFlow::Break(Exit::Failed(reason)),
            // the client transport already exists
            Command::Connect => ControlFlow::Continue(()),
            Command::Peer(PeerEvent::Connected) => {
                self.peer_connected = true;
                if self.reading() {
                    self.watchdog.arm();
                }
                ControlFlow::Continue(())
            }
            Command::Peer(PeerEvent::ConnectFailed { error, unsent }) => {
                self.on_connect_failed(error, unsent)
            }
            Command::Peer(PeerEvent::Closed(None)) => {
                if self.end_received {
                    // End is queued ahead of this event; finish flushing it
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(Exit::Failed(SessionError::PeerGone))
                }
            }
            Command::Peer(PeerEvent::Closed(Some(error))) => {
                ControlFlow::Break(Exit::Failed(error))
            }
        }
    }

    fn after_write(&mut self, result: Result<Flush, SessionError>) -> ControlFlow<Exit> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return ControlFlow::Break(Exit::Failed(e)),
        };

        let writable = self.wire.is_writable();
        if writable != self.client_writable {
            self.client_writable = writable;
            self.handle.flags().set_writable(writable);
            // only this session depends on its client, so pressure goes
            // straight to the paired downstream
            if writable {
                self.peer.unthrottle();
            } else {
                self.peer.throttle();
            }
        }

        if self.wire.is_finished() && self.queue.is_empty() {
            return ControlFlow::Break(Exit::Done);
        }
        match outcome {
            Flush::Rearm => {
                self.handle.post(Command::Flush);
                ControlFlow::Continue(())
            }
            Flush::Drained => ControlFlow::Break(Exit::Drained),
            Flush::Idle | Flush::Blocked => ControlFlow::Continue(()),
        }
    }

    fn on_client_frame(
        &mut self,
        frame: Option<Result<hyper::body::Frame<bytes::Bytes>, hyper::Error>>,
    ) -> ControlFlow<Exit> {
        let message = match frame {
            None => {
                self.body = None;
                self.watchdog.disarm();
                Frame::End
            }
            Some(Err(e)) => return ControlFlow::Break(Exit::Failed(e.into())),
            Some(Ok(frame)) => {
                self.watchdog.arm();
                match frame.into_data() {
                    Ok(bytes) => Frame::Data(bytes),
                    Err(frame) => match frame.into_trailers() {
                        Ok(trailers) => Frame::Trailers(trailers),
                        Err(_) => return ControlFlow::Continue(()),
                    },
                }
            }
        };
        self.forward(Message::new(message));
        ControlFlow::Continue(())
    }

    fn forward(&mut self, message: Message) {
        if let Err(message) = self.peer.send(message) {
            // peer is winding down; its ConnectFailed or Closed event follows
            self.stash.push(message);
        }
    }

    fn on_connect_failed(&mut self, error: SessionError, unsent: Vec<Message>) -> ControlFlow<Exit> {
        let failed = self.backend.endpoint().clone();
        self.backend.deregister_listener(self.listener);
        self.pool.policy().mark_failed(&failed);
        metrics::record_backend_health(&failed, false);

        if !self.failover.try_next() {
            return ControlFlow::Break(Exit::Failed(error));
        }
        let next = match self.pool.select_excluding(&self.context, self.failover.tried()) {
            Ok(next) => next,
            Err(policy_error) => {
                tracing::warn!(
                    session_id = %self.handle.id(),
                    pool = %self.pool.name(),
                    error = %policy_error,
                    "No endpoint left to fail over to"
                );
                return ControlFlow::Break(Exit::Failed(error));
            }
        };

        tracing::info!(
            session_id = %self.handle.id(),
            pool = %self.pool.name(),
            from = %failed,
            to = %next.endpoint(),
            remaining = self.failover.remaining(),
            "Failing over"
        );
        metrics::record_failover(self.pool.name());

        self.failover.record(next.endpoint().clone());
        self.backend = next;
        self.throttled = false;
        self.listener = self.backend.register_listener(Arc::new(self.handle.clone()));
        self.peer = downstream::spawn(
            self.backend.clone(),
            self.handle.clone(),
            self.protocol,
            &self.settings,
        );
        self.peer_connected = false;
        self.peer.run();

        let stash = std::mem::take(&mut self.stash);
        for message in unsent.into_iter().chain(stash) {
            if self.peer.send(message).is_err() {
                return ControlFlow::Break(Exit::Failed(SessionError::PeerGone));
            }
        }
        ControlFlow::Continue(())
    }

    fn finish(mut self, exit: Exit) {
        self.handle.flags().set_closed();
        self.backend.deregister_listener(self.listener);
        metrics::session_closed("upstream");

        let status = match &exit {
            Exit::Done | Exit::Drained => {
                if !self.wire.is_finished() {
                    self.wire.fail(&SessionError::Draining);
                }
                self.peer.shutdown();
                self.status.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Exit::Failed(error) => {
                self.queue.close(error);
                let status = if self.wire.head_sent() {
                    self.status.unwrap_or(StatusCode::BAD_GATEWAY)
                } else {
                    error.gateway_status()
                };
                self.wire.fail(error);
                self.peer.abort(error.clone());
                tracing::debug!(
                    session_id = %self.handle.id(),
                    endpoint = %self.backend.endpoint(),
                    error = %error,
                    "Upstream session failed"
                );
                status
            }
        };

        metrics::record_request(
            &self.method,
            status.as_u16(),
            &self.backend.endpoint().to_string(),
            self.started,
        );
        tracing::debug!(
            session_id = %self.handle.id(),
            status = status.as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Upstream session closed"
        );
    }
}
