//! Units of work carried between paired sessions.

use bytes::Bytes;
use hyper::http::{request, response, HeaderMap};
use tokio::sync::oneshot;

use crate::session::error::SessionError;

/// One piece of an HTTP exchange, in the order it crossed the wire.
#[derive(Debug)]
pub enum Frame {
    /// Request line and headers. `end_of_stream` is set when no body follows.
    RequestHead {
        parts: request::Parts,
        end_of_stream: bool,
    },
    ResponseHead(response::Parts),
    Data(Bytes),
    Trailers(HeaderMap),
    /// End of the body.
    End,
}

/// Signalled once the message is handed to the transport, or with the error
/// that prevented it.
pub type Completion = oneshot::Sender<Result<(), SessionError>>;

/// A frame plus an optional completion signal.
#[derive(Debug)]
pub struct Message {
    frame: Frame,
    completion: Option<Completion>,
}

impl Message {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            completion: None,
        }
    }

    /// Build a message whose delivery can be awaited.
    pub fn with_completion(frame: Frame) -> (Self, oneshot::Receiver<Result<(), SessionError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                frame,
                completion: Some(tx),
            },
            rx,
        )
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_parts(self) -> (Frame, Option<Completion>) {
        (self.frame, self.completion)
    }

    /// Drop the frame, failing its completion.
    pub fn reject(self, error: SessionError) {
        if let Some(completion) = self.completion {
            let _ = completion.send(Err(error));
        }
    }
}
