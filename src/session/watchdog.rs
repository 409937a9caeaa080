//! Read-timeout watchdog.
//!
//! Armed while a session waits on its transport, re-armed on every read and
//! disarmed while the session is not expecting data (throttled, or finished
//! reading). Expiry is polled from the session's own select loop, so it never
//! touches session state from another task.

use std::future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Watchdog {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// `None` disables the watchdog entirely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Start (or restart) the countdown.
    pub fn arm(&mut self) {
        self.deadline = self.timeout.map(|t| Instant::now() + t);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; pending forever when disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }
}
