//! Session transports.
//!
//! # Responsibilities
//! - `WriteBudget`: per-transport watermark accounting that decides writability
//! - `ProxyBody`: the body type handed to hyper on both hops; releasing bytes
//!   as hyper polls them is what makes a session writable again
//! - `ClientWire`: upstream session → client (response head, then body)
//! - `BackendWire`: downstream session → backend (request head, then body)
//!
//! # Design Decisions
//! - Bytes are charged when a session writes a frame and released when hyper
//!   pulls it off the channel, so "pending" means accepted by us but not yet
//!   taken by the connection
//! - Only the writable edge is posted back to the owning session; the
//!   unwritable edge is observed synchronously by the writer itself

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hyper::body::{Body, Frame as BodyFrame, Incoming, SizeHint};
use hyper::client::conn::{http1, http2};
use hyper::{HeaderMap, Request, Response};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::http::request::prepare_for_backend;
use crate::http::response::{error_response, prepare_for_client};
use crate::load_balancer::BackendState;
use crate::net::Protocol;
use crate::session::error::SessionError;
use crate::session::message::Frame;
use crate::session::queue::Wire;
use crate::session::Command;

/// Watermark accounting for one outbound transport.
#[derive(Debug)]
pub struct WriteBudget {
    high: usize,
    low: usize,
    state: Mutex<BudgetState>,
    notify: mpsc::UnboundedSender<Command>,
}

#[derive(Debug)]
struct BudgetState {
    pending: usize,
    writable: bool,
}

impl WriteBudget {
    pub(crate) fn new(high: usize, low: usize, notify: mpsc::UnboundedSender<Command>) -> Arc<Self> {
        Arc::new(Self {
            high,
            low: low.min(high),
            state: Mutex::new(BudgetState {
                pending: 0,
                writable: true,
            }),
            notify,
        })
    }

    /// Account for bytes handed to the transport. Returns the writability
    /// after the charge.
    pub fn charge(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        state.pending += bytes;
        if state.writable && state.pending > self.high {
            state.writable = false;
        }
        state.writable
    }

    /// Account for bytes taken by the connection. Crossing the low watermark
    /// posts `WritabilityChanged` to the owning session.
    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(bytes);
        if !state.writable && state.pending <= self.low {
            state.writable = true;
            drop(state);
            let _ = self.notify.send(Command::WritabilityChanged);
        }
    }

    fn release_all(&self) {
        let pending = self.state.lock().pending;
        self.release(pending);
    }

    pub fn is_writable(&self) -> bool {
        self.state.lock().writable
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}

#[derive(Debug)]
enum BodyItem {
    Data(Bytes),
    Trailers(HeaderMap),
    Error(SessionError),
}

/// Body streamed from a session to hyper.
#[derive(Debug)]
pub struct ProxyBody {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Empty,
    Full(Option<Bytes>),
    Channel {
        rx: mpsc::UnboundedReceiver<BodyItem>,
        budget: Arc<WriteBudget>,
        done: bool,
    },
}

impl ProxyBody {
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    pub fn full(bytes: Bytes) -> Self {
        Self {
            kind: Kind::Full(Some(bytes)),
        }
    }

    /// A body fed by a [`BodyWriter`], charging `budget` as it goes.
    pub(crate) fn channel(budget: Arc<WriteBudget>) -> (BodyWriter, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = BodyWriter {
            tx,
            budget: budget.clone(),
        };
        let body = Self {
            kind: Kind::Channel {
                rx,
                budget,
                done: false,
            },
        };
        (writer, body)
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = SessionError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BodyFrame<Bytes>, SessionError>>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(bytes) => Poll::Ready(bytes.take().map(|b| Ok(BodyFrame::data(b)))),
            Kind::Channel { rx, budget, done } => {
                if *done {
                    return Poll::Ready(None);
                }
                match ready!(rx.poll_recv(cx)) {
                    Some(BodyItem::Data(bytes)) => {
                        budget.release(bytes.len());
                        Poll::Ready(Some(Ok(BodyFrame::data(bytes))))
                    }
                    Some(BodyItem::Trailers(trailers)) => {
                        *done = true;
                        Poll::Ready(Some(Ok(BodyFrame::trailers(trailers))))
                    }
                    Some(BodyItem::Error(error)) => {
                        *done = true;
                        Poll::Ready(Some(Err(error)))
                    }
                    None => {
                        *done = true;
                        Poll::Ready(None)
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(bytes) => bytes.is_none(),
            Kind::Channel { done, .. } => *done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Full(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64))
            }
            Kind::Channel { .. } => SizeHint::default(),
        }
    }
}

impl Drop for ProxyBody {
    fn drop(&mut self) {
        // bytes never polled must not keep the session unwritable
        if let Kind::Channel { rx, budget, .. } = &mut self.kind {
            rx.close();
            budget.release_all();
        }
    }
}

/// Sending half of a channel [`ProxyBody`].
#[derive(Debug)]
pub(crate) struct BodyWriter {
    tx: mpsc::UnboundedSender<BodyItem>,
    budget: Arc<WriteBudget>,
}

impl BodyWriter {
    fn push_data(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.budget.charge(bytes.len());
        self.tx
            .send(BodyItem::Data(bytes))
            .map_err(|_| SessionError::PeerGone)
    }

    fn push_trailers(&self, trailers: HeaderMap) -> Result<(), SessionError> {
        self.tx
            .send(BodyItem::Trailers(trailers))
            .map_err(|_| SessionError::PeerGone)
    }

    /// Terminate the body with an error; hyper resets the stream.
    fn fail(self, error: SessionError) {
        let _ = self.tx.send(BodyItem::Error(error));
    }
}

/// The client-facing transport of an upstream session.
pub(crate) struct ClientWire {
    respond: Option<oneshot::Sender<Response<ProxyBody>>>,
    body: Option<BodyWriter>,
    budget: Arc<WriteBudget>,
    finished: bool,
}

impl ClientWire {
    pub(crate) fn new(
        respond: oneshot::Sender<Response<ProxyBody>>,
        budget: Arc<WriteBudget>,
    ) -> Self {
        Self {
            respond: Some(respond),
            body: None,
            budget,
            finished: false,
        }
    }

    /// True once the end of the response has been written.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.respond.is_none()
    }

    /// Report a failure to the client: a gateway error if no head went out
    /// yet, otherwise an aborted body.
    pub(crate) fn fail(&mut self, error: &SessionError) {
        if let Some(respond) = self.respond.take() {
            let _ = respond.send(error_response(error.gateway_status(), &error.to_string()));
        } else if let Some(body) = self.body.take() {
            body.fail(error.clone());
        }
        self.finished = true;
    }

    fn writer(&self) -> Result<&BodyWriter, SessionError> {
        self.body
            .as_ref()
            .ok_or(SessionError::Protocol("response body frame without an open body"))
    }
}

impl Wire for ClientWire {
    fn write(&mut self, frame: Frame) -> Result<(), SessionError> {
        match frame {
            Frame::ResponseHead(mut parts) => {
                let respond = self
                    .respond
                    .take()
                    .ok_or(SessionError::Protocol("duplicate response head"))?;
                prepare_for_client(&mut parts);
                let (writer, body) = ProxyBody::channel(self.budget.clone());
                self.body = Some(writer);
                respond
                    .send(Response::from_parts(parts, body))
                    .map_err(|_| SessionError::PeerGone)
            }
            Frame::Data(bytes) => self.writer()?.push_data(bytes),
            Frame::Trailers(trailers) => self.writer()?.push_trailers(trailers),
            Frame::End => {
                self.body = None;
                self.finished = true;
                Ok(())
            }
            Frame::RequestHead { .. } => {
                Err(SessionError::Protocol("request head sent toward the client"))
            }
        }
    }

    fn is_writable(&self) -> bool {
        self.budget.is_writable()
    }
}

/// Established connection to a backend.
pub(crate) enum BackendSender {
    Http1(http1::SendRequest<ProxyBody>),
    Http2(http2::SendRequest<ProxyBody>),
}

pub(crate) type ResponseFuture = BoxFuture<'static, Result<Response<Incoming>, hyper::Error>>;

impl BackendSender {
    fn send(&mut self, request: Request<ProxyBody>) -> ResponseFuture {
        match self {
            BackendSender::Http1(sender) => Box::pin(sender.send_request(request)),
            BackendSender::Http2(sender) => Box::pin(sender.send_request(request)),
        }
    }
}

/// The backend-facing transport of a downstream session.
pub(crate) struct BackendWire {
    backend: Arc<BackendState>,
    protocol: Protocol,
    sender: Option<BackendSender>,
    body: Option<BodyWriter>,
    budget: Arc<WriteBudget>,
    /// Set once the request head is written; polled by the session loop.
    pub(crate) response: Option<ResponseFuture>,
}

impl BackendWire {
    pub(crate) fn new(backend: Arc<BackendState>, protocol: Protocol, budget: Arc<WriteBudget>) -> Self {
        Self {
            backend,
            protocol,
            sender: None,
            body: None,
            budget,
            response: None,
        }
    }

    pub(crate) fn attach(&mut self, sender: BackendSender) {
        self.sender = Some(sender);
    }

    /// Abort the request body, if one is still streaming.
    pub(crate) fn fail(&mut self, error: &SessionError) {
        if let Some(body) = self.body.take() {
            body.fail(error.clone());
        }
    }

    fn writer(&self) -> Result<&BodyWriter, SessionError> {
        self.body
            .as_ref()
            .ok_or(SessionError::Protocol("request body frame without an open body"))
    }
}

impl Wire for BackendWire {
    fn write(&mut self, frame: Frame) -> Result<(), SessionError> {
        match frame {
            Frame::RequestHead {
                mut parts,
                end_of_stream,
            } => {
                prepare_for_backend(&mut parts, self.backend.endpoint(), self.protocol)
                    .map_err(|_| SessionError::Protocol("request head not representable"))?;
                let body = if end_of_stream {
                    ProxyBody::empty()
                } else {
                    let (writer, body) = ProxyBody::channel(self.budget.clone());
                    self.body = Some(writer);
                    body
                };
                let sender = self
                    .sender
                    .as_mut()
                    .ok_or(SessionError::Protocol("request head before connect"))?;
                self.response = Some(sender.send(Request::from_parts(parts, body)));
                Ok(())
            }
            Frame::Data(bytes) => {
                self.backend.record_sent(bytes.len());
                self.writer()?.push_data(bytes)
            }
            Frame::Trailers(trailers) => self.writer()?.push_trailers(trailers),
            Frame::End => {
                self.body = None;
                Ok(())
            }
            Frame::ResponseHead(_) => {
                Err(SessionError::Protocol("response head sent toward the backend"))
            }
        }
    }

    fn is_writable(&self) -> bool {
        self.budget.is_writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn budget(high: usize, low: usize) -> (Arc<WriteBudget>, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WriteBudget::new(high, low, tx), rx)
    }

    #[test]
    fn watermarks_have_hysteresis() {
        let (budget, mut notices) = budget(100, 50);
        assert!(budget.charge(80));
        assert!(!budget.charge(40));

        budget.release(30);
        assert!(!budget.is_writable());
        assert!(notices.try_recv().is_err());

        budget.release(40);
        assert!(budget.is_writable());
        assert!(matches!(notices.try_recv(), Ok(Command::WritabilityChanged)));
        assert_eq!(budget.pending(), 50);
    }

    #[tokio::test]
    async fn polling_body_releases_budget() {
        let (budget, mut notices) = budget(4, 2);
        let (writer, mut body) = ProxyBody::channel(budget.clone());

        writer.push_data(Bytes::from_static(b"abc")).unwrap();
        writer.push_data(Bytes::from_static(b"def")).unwrap();
        assert!(!budget.is_writable());

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "abc");
        assert!(!budget.is_writable());

        let second = body.frame().await.unwrap().unwrap();
        assert_eq!(second.into_data().unwrap(), "def");
        assert!(budget.is_writable());
        assert!(matches!(notices.try_recv(), Ok(Command::WritabilityChanged)));

        drop(writer);
        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn dropped_body_releases_budget() {
        let (budget, _notices) = budget(1, 0);
        let (writer, body) = ProxyBody::channel(budget.clone());
        writer.push_data(Bytes::from_static(b"xyz")).unwrap();
        assert!(!budget.is_writable());

        drop(body);
        assert!(budget.is_writable());
        assert!(matches!(
            writer.push_data(Bytes::from_static(b"!")),
            Err(SessionError::PeerGone)
        ));
    }

    #[tokio::test]
    async fn client_wire_streams_response() {
        let (budget, _notices) = budget(1024, 512);
        let (tx, rx) = oneshot::channel();
        let mut wire = ClientWire::new(tx, budget);

        let (head, _) = Response::builder()
            .status(201)
            .header("connection", "close")
            .body(())
            .unwrap()
            .into_parts();
        wire.write(Frame::ResponseHead(head)).unwrap();
        wire.write(Frame::Data(Bytes::from_static(b"hello "))).unwrap();
        wire.write(Frame::Data(Bytes::from_static(b"world"))).unwrap();
        wire.write(Frame::End).unwrap();
        assert!(wire.is_finished());

        let response = rx.await.unwrap();
        assert_eq!(response.status(), 201);
        assert!(response.headers().get("connection").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn client_wire_failure_before_head_is_gateway_error() {
        let (budget, _notices) = budget(1024, 512);
        let (tx, rx) = oneshot::channel();
        let mut wire = ClientWire::new(tx, budget);
        wire.fail(&SessionError::ReadTimeout(std::time::Duration::from_secs(1)));
        assert_eq!(rx.await.unwrap().status(), 504);
    }
}
