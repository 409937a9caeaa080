//! Backend-facing half of a proxied exchange.
//!
//! # Responsibilities
//! - Connect to the selected backend (bounded by the connect timeout) and
//!   speak the protocol negotiated with the client
//! - Write the request head and body frames it receives, in order
//! - Stream the backend response to the paired upstream session, pausing
//!   while throttled
//! - Hold one throttle increment on the backend while its transport is
//!   unwritable
//!
//! # Lifecycle
//! ```text
//! Connecting ──connect ok──▶ Active ──shutdown──▶ Draining ──▶ Closed
//!     │                        │
//!     └─connect failed─▶ ConnectFailed{unsent} to peer, Closed
//!                              └─response end / error / timeout─▶ Closed
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::Response;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::mpsc;

use crate::load_balancer::{BackendState, Endpoint, PendingGuard};
use crate::net::Protocol;
use crate::observability::metrics;
use crate::resilience::connect_with_timeout;
use crate::session::error::SessionError;
use crate::session::message::{Frame, Message};
use crate::session::queue::{Flush, SendQueue, Wire};
use crate::session::watchdog::Watchdog;
use crate::session::wire::{BackendSender, BackendWire, WriteBudget};
use crate::session::{
    self, next_frame, poll_slot, Command, PeerEvent, ProxyChannel, Remote, SessionHandle,
    SessionKind, SessionSettings, ThrottleHold,
};

type ConnectFuture = BoxFuture<'static, Result<BackendSender, SessionError>>;

enum Exit {
    /// Response fully relayed.
    Done,
    /// Drained after a shutdown request.
    Drained,
    ConnectFailed(SessionError),
    Failed(SessionError),
}

struct DownstreamSession {
    handle: SessionHandle,
    peer: SessionHandle,
    inbox: mpsc::UnboundedReceiver<Command>,
    backend: Arc<BackendState>,
    protocol: Protocol,
    connect_timeout: Duration,

    queue: SendQueue,
    wire: BackendWire,
    connecting: Option<ConnectFuture>,
    body: Option<Incoming>,
    throttled: bool,
    hold: ThrottleHold,
    watchdog: Watchdog,
    guard: PendingGuard,
}

/// Create a downstream session toward `backend`, paired with `peer`.
/// It stays idle until [`ProxyChannel::run`] is called.
pub(crate) fn spawn(
    backend: Arc<BackendState>,
    peer: SessionHandle,
    protocol: Protocol,
    settings: &SessionSettings,
) -> SessionHandle {
    let (handle, inbox) = session::channel(
        SessionKind::Downstream,
        Remote::Backend(backend.endpoint().clone()),
        false,
    );
    let budget = WriteBudget::new(settings.high_watermark, settings.low_watermark, handle.sender());

    let session = DownstreamSession {
        handle: handle.clone(),
        peer,
        inbox,
        protocol,
        connect_timeout: settings.connect_timeout,
        queue: SendQueue::connecting(settings.flush_batch),
        wire: BackendWire::new(backend.clone(), protocol, budget),
        connecting: None,
        body: None,
        throttled: false,
        hold: ThrottleHold::new(backend.clone()),
        watchdog: Watchdog::new(settings.read_timeout),
        guard: backend.begin_request(),
        backend,
    };
    metrics::session_opened("downstream");
    tokio::spawn(session.run());
    handle
}

impl DownstreamSession {
    async fn run(mut self) {
        tracing::debug!(
            session_id = %self.handle.id(),
            peer_id = %self.peer.id(),
            endpoint = %self.backend.endpoint(),
            "Downstream session started"
        );

        let exit = loop {
            let step = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => ControlFlow::Break(Exit::Failed(SessionError::PeerGone)),
                },
                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect(result)
                }
                result = poll_slot(&mut self.wire.response) => {
                    self.wire.response = None;
                    self.on_response(result)
                }
                frame = next_frame(&mut self.body), if !self.throttled => self.on_frame(frame),
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

    fn on_command(&mut self, command: Command) -> ControlFlow<Exit> {
        match command {
            Command::Connect => {
                if self.connecting.is_none() && !self.queue.is_connected() {
                    self.connecting = Some(Box::pin(connect(
                        self.backend.endpoint().clone(),
                        self.protocol,
                        self.connect_timeout,
                    )));
                }
                ControlFlow::Continue(())
            }
            Command::Send(message) => {
                if self.queue.is_connected() && self.body.is_none() {
                    // request still streaming, backend not answering yet
                    self.watchdog.arm();
                }
                let result = self.queue.send(message, &mut self.wire);
                self.after_write(result)
            }
            Command::Flush | Command::WritabilityChanged => {
                let result = self.queue.flush(&mut self.wire);
                self.after_write(result)
            }
            Command::Throttle => {
                self.throttled = true;
                self.watchdog.disarm();
                ControlFlow::Continue(())
            }
            Command::Unthrottle => {
                self.throttled = false;
                if self.body.is_some() {
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
            Command::Peer(PeerEvent::Closed(error)) => {
                ControlFlow::Break(Exit::Failed(error.unwrap_or(SessionError::PeerGone)))
            }
            Command::Peer(_) => ControlFlow::Continue(()),
        }
    }

    fn after_write(&mut self, result: Result<Flush, SessionError>) -> ControlFlow<Exit> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return ControlFlow::Break(Exit::Failed(e)),
        };

        let writable = self.wire.is_writable();
        self.handle.flags().set_writable(writable);
        self.hold.update(writable);

        match outcome {
            Flush::Rearm => {
                self.handle.post(Command::Flush);
                ControlFlow::Continue(())
            }
            Flush::Drained => ControlFlow::Break(Exit::Drained),
            Flush::Idle | Flush::Blocked => ControlFlow::Continue(()),
        }
    }

    fn on_connect(&mut self, result: Result<BackendSender, SessionError>) -> ControlFlow<Exit> {
        match result {
            Ok(sender) => {
                tracing::debug!(
                    session_id = %self.handle.id(),
                    endpoint = %self.backend.endpoint(),
                    protocol = ?self.protocol,
                    "Backend connected"
                );
                self.wire.attach(sender);
                self.queue.mark_connected();
                self.handle.flags().set_connected();
                self.peer.post(Command::Peer(PeerEvent::Connected));
                self.watchdog.arm();
                let result = self.queue.flush(&mut self.wire);
                self.after_write(result)
            }
            Err(e) => ControlFlow::Break(Exit::ConnectFailed(e)),
        }
    }

    fn on_response(
        &mut self,
        result: Result<Response<Incoming>, hyper::Error>,
    ) -> ControlFlow<Exit> {
        let response = match result {
            Ok(response) => response,
            Err(e) => return ControlFlow::Break(Exit::Failed(e.into())),
        };

        let (parts, body) = response.into_parts();
        tracing::debug!(
            session_id = %self.handle.id(),
            status = parts.status.as_u16(),
            "Backend responded"
        );
        if self.peer.send(Message::new(Frame::ResponseHead(parts))).is_err() {
            return ControlFlow::Break(Exit::Failed(SessionError::PeerGone));
        }
        self.body = Some(body);
        if self.throttled {
            self.watchdog.disarm();
        } else {
            self.watchdog.arm();
        }
        ControlFlow::Continue(())
    }

    fn on_frame(
        &mut self,
        frame: Option<Result<hyper::body::Frame<bytes::Bytes>, hyper::Error>>,
    ) -> ControlFlow<Exit> {
        let frame = match frame {
            None => {
                self.body = None;
                self.watchdog.disarm();
                return match self.peer.send(Message::new(Frame::End)) {
                    Ok(()) => ControlFlow::Break(Exit::Done),
                    Err(_) => ControlFlow::Break(Exit::Failed(SessionError::PeerGone)),
                };
            }
            Some(Err(e)) => return ControlFlow::Break(Exit::Failed(e.into())),
            Some(Ok(frame)) => frame,
        };

        self.watchdog.arm();
        let message = match frame.into_data() {
            Ok(bytes) => {
                self.guard.record_received(bytes.len());
                Frame::Data(bytes)
            }
            Err(frame) => match frame.into_trailers() {
                Ok(trailers) => Frame::Trailers(trailers),
                Err(_) => return ControlFlow::Continue(()),
            },
        };
        match self.peer.send(Message::new(message)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(Exit::Failed(SessionError::PeerGone)),
        }
    }

    fn finish(mut self, exit: Exit) {
        self.handle.flags().set_closed();
        metrics::session_closed("downstream");

        match exit {
            Exit::ConnectFailed(error) => {
                // no further sends are accepted; collect everything already posted
                self.inbox.close();
                let mut unsent = self.queue.take_unsent();
                while let Ok(command) = self.inbox.try_recv() {
                    if let Command::Send(message) = command {
                        unsent.push(message);
                    }
                }
                tracing::warn!(
                    session_id = %self.handle.id(),
                    endpoint = %self.backend.endpoint(),
                    error = %error,
                    unsent = unsent.len(),
                    "Backend connect failed"
                );
                self.peer
                    .post(Command::Peer(PeerEvent::ConnectFailed { error, unsent }));
            }
            Exit::Done | Exit::Drained => {
                self.guard.succeed();
                self.queue.close(&SessionError::Closed);
                tracing::debug!(session_id = %self.handle.id(), "Downstream session closed");
                self.peer.post(Command::Peer(PeerEvent::Closed(None)));
            }
            Exit::Failed(error) => {
                self.queue.close(&error);
                self.wire.fail(&error);
                tracing::debug!(
                    session_id = %self.handle.id(),
                    endpoint = %self.backend.endpoint(),
                    error = %error,
                    "Downstream session failed"
                );
                self.peer.post(Command::Peer(PeerEvent::Closed(Some(error))));
            }
        }
        // dropping self releases the throttle hold and the pending guard
    }
}

/// Open a connection to `endpoint` and complete the protocol handshake.
async fn connect(
    endpoint: Endpoint,
    protocol: Protocol,
    timeout: Duration,
) -> Result<BackendSender, SessionError> {
    let stream = connect_with_timeout(&endpoint, timeout).await?;
    let io = TokioIo::new(stream);
    let handshake_failed = |e: hyper::Error| SessionError::Connect {
        endpoint: endpoint.clone(),
        reason: e.to_string(),
    };

    match protocol {
        Protocol::Http1 => {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(handshake_failed)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "Backend connection ended with error");
                }
            });
            sender.ready().await.map_err(handshake_failed)?;
            Ok(BackendSender::Http1(sender))
        }
        Protocol::Http2 => {
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                    .await
                    .map_err(handshake_failed)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "Backend connection ended with error");
                }
            });
            sender.ready().await.map_err(handshake_failed)?;
            Ok(BackendSender::Http2(sender))
        }
    }
}
