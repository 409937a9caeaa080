//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound backend TCP connects by `session.connect_timeout_secs`
//! - Keep timeouts distinct from refusals so the client sees 504 vs 502
//!
//! Idle read timeouts live with the sessions (`session::watchdog`).

use std::time::Duration;

use tokio::net::TcpStream;

use crate::load_balancer::Endpoint;
use crate::session::SessionError;

/// Open a TCP connection to `endpoint` within `timeout`.
pub async fn connect_with_timeout(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<TcpStream, SessionError> {
    let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Connect {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(SessionError::ConnectTimeout(endpoint.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connect_is_connect_error() {
        // bind then drop to find a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_with_timeout(&Endpoint::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert!(err.is_connect_failure());
    }

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect_with_timeout(&Endpoint::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
