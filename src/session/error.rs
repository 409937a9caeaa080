//! Session error taxonomy.

use std::time::Duration;

use hyper::StatusCode;

use crate::load_balancer::Endpoint;

/// Errors that end a session.
///
/// Cloneable so one failure can be reported to the paired session, the
/// response body and queued completions alike.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: Endpoint, reason: String },
    #[error("connect to {0} timed out")]
    ConnectTimeout(Endpoint),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no data read for {0:?}")]
    ReadTimeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("paired session is gone")]
    PeerGone,
    #[error("session is draining")]
    Draining,
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// True for failures that happened before any byte reached the backend.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, SessionError::Connect { .. } | SessionError::ConnectTimeout(_))
    }

    /// Status returned to the client when the failure happens before the
    /// response head was sent.
    pub fn gateway_status(&self) -> StatusCode {
        match self {
            SessionError::ReadTimeout(_) | SessionError::ConnectTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<hyper::Error> for SessionError {
    fn from(e: hyper::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}
