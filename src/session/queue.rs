//! Per-session FIFO send queue.
//!
//! Pure state machine with no I/O of its own: the owning session passes in
//! its transport as a [`Wire`]. Keeping it synchronous makes the ordering and
//! draindown rules testable without a runtime.
//!
//! # Send algorithm
//! ```text
//! send(msg):
//!     Draining/Closed           → reject (completion gets an error)
//!     Active ∧ writable ∧ empty → write now
//!     otherwise                 → enqueue, then flush
//!
//! flush():
//!     while writable ∧ non-empty ∧ budget left → pop front, write
//!     budget exhausted with messages left      → Rearm (post Flush to self)
//!     unwritable with messages left            → Blocked (wait for writability)
//!     empty while draining                     → Drained (close transport)
//! ```

use std::collections::VecDeque;

use crate::session::error::SessionError;
use crate::session::message::{Frame, Message};

/// Outbound transport of a session.
pub trait Wire {
    /// Hand one frame to the transport.
    fn write(&mut self, frame: Frame) -> Result<(), SessionError>;

    /// False while the transport's outbound buffer is above its high watermark.
    fn is_writable(&self) -> bool;
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

/// Result of a send or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Nothing left to write.
    Idle,
    /// Messages remain but the transport is unwritable or not connected yet.
    Blocked,
    /// Batch budget used up with messages remaining and the transport still
    /// writable; the session should post itself another flush.
    Rearm,
    /// Draining and the queue is empty: the transport can be closed.
    Drained,
}

#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<Message>,
    connected: bool,
    draining: bool,
    closed: bool,
    flush_batch: usize,
}

impl SendQueue {
    /// A queue for a transport that is still connecting.
    pub fn connecting(flush_batch: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            connected: false,
            draining: false,
            closed: false,
            flush_batch: flush_batch.max(1),
        }
    }

    /// A queue for an already established transport.
    pub fn active(flush_batch: usize) -> Self {
        let mut queue = Self::connecting(flush_batch);
        queue.connected = true;
        queue
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.draining {
            SessionState::Draining
        } else if self.connected {
            SessionState::Active
        } else {
            SessionState::Connecting
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.closed
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Connecting → Active.
    pub fn mark_connected(&mut self) {
        if !self.closed {
            self.connected = true;
        }
    }

    /// Stop admitting sends. Returns true the first time. Never cleared.
    pub fn begin_drain(&mut self) -> bool {
        let first = !self.draining;
        self.draining = true;
        first
    }

    /// Submit a message for writing, preserving call order.
    pub fn send<W: Wire>(&mut self, message: Message, wire: &mut W) -> Result<Flush, SessionError> {
        if self.closed {
            message.reject(SessionError::Closed);
            return Ok(Flush::Idle);
        }
        if self.draining {
            message.reject(SessionError::Draining);
            return Ok(if self.queue.is_empty() { Flush::Drained } else { Flush::Blocked });
        }

        if self.connected && self.queue.is_empty() && wire.is_writable() {
            write_one(message, wire)?;
            return Ok(Flush::Idle);
        }

        self.queue.push_back(message);
        self.flush(wire)
    }

    /// Write queued messages up to the batch budget.
    pub fn flush<W: Wire>(&mut self, wire: &mut W) -> Result<Flush, SessionError> {
        if self.closed {
            return Ok(Flush::Idle);
        }
        if !self.connected {
            return Ok(if self.queue.is_empty() { Flush::Idle } else { Flush::Blocked });
        }

        let mut budget = self.flush_batch;
        while !self.queue.is_empty() {
            if !wire.is_writable() {
                return Ok(Flush::Blocked);
            }
            if budget == 0 {
                return Ok(Flush::Rearm);
            }
            if let Some(message) = self.queue.pop_front() {
                write_one(message, wire)?;
            }
            budget -= 1;
        }

        Ok(if self.draining { Flush::Drained } else { Flush::Idle })
    }

    /// Remove everything still queued, in order, and close the queue.
    /// Used when a connect fails so the messages can be replayed elsewhere.
    pub fn take_unsent(&mut self) -> Vec<Message> {
        self.closed = true;
        self.queue.drain(..).collect()
    }

    /// Close the queue, failing every queued completion with `error`.
    pub fn close(&mut self, error: &SessionError) {
        self.closed = true;
        for message in self.queue.drain(..) {
            message.reject(error.clone());
        }
    }
}

fn write_one<W: Wire>(message: Message, wire: &mut W) -> Result<(), SessionError> {
    let (frame, completion) = message.into_parts();
    let result = wire.write(frame);
    if let Some(completion) = completion {
        let _ = completion.send(result.clone());
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;

    /// Records written frames; writability is toggled by the test.
    #[derive(Default)]
    pub(crate) struct RecordingWire {
        pub written: Vec<Bytes>,
        pub blocked: bool,
        pub fail: bool,
    }

    impl Wire for RecordingWire {
        fn write(&mut self, frame: Frame) -> Result<(), SessionError> {
            if self.fail {
                return Err(SessionError::Transport("boom".into()));
            }
            if let Frame::Data(bytes) = frame {
                self.written.push(bytes);
            }
            Ok(())
        }

        fn is_writable(&self) -> bool {
            !self.blocked
        }
    }

    fn data(n: usize) -> Message {
        Message::new(Frame::Data(Bytes::from(n.to_string())))
    }

    fn written(wire: &RecordingWire) -> Vec<String> {
        wire.written
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    fn expected(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|n| n.to_string()).collect()
    }

    #[test]
    fn writes_in_call_order_through_blocking() {
        let mut queue = SendQueue::active(4);
        let mut wire = RecordingWire::default();

        for n in 0..3 {
            assert_eq!(queue.send(data(n), &mut wire).unwrap(), Flush::Idle);
        }

        wire.blocked = true;
        for n in 3..10 {
            assert_eq!(queue.send(data(n), &mut wire).unwrap(), Flush::Blocked);
        }
        assert_eq!(queue.len(), 7);

        wire.blocked = false;
        // a new send while messages are queued must not jump the queue
        assert_eq!(queue.send(data(10), &mut wire).unwrap(), Flush::Rearm);
        while queue.flush(&mut wire).unwrap() == Flush::Rearm {}

        assert_eq!(written(&wire), expected(0..11));
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_is_bounded_by_batch() {
        let mut queue = SendQueue::connecting(3);
        let mut wire = RecordingWire::default();
        for n in 0..7 {
            assert_eq!(queue.send(data(n), &mut wire).unwrap(), Flush::Blocked);
        }
        assert_eq!(queue.state(), SessionState::Connecting);

        queue.mark_connected();
        assert_eq!(queue.flush(&mut wire).unwrap(), Flush::Rearm);
        assert_eq!(wire.written.len(), 3);
        assert_eq!(queue.flush(&mut wire).unwrap(), Flush::Rearm);
        assert_eq!(queue.flush(&mut wire).unwrap(), Flush::Idle);
        assert_eq!(written(&wire), expected(0..7));
    }

    #[test]
    fn drain_writes_earlier_messages_and_rejects_later() {
        let mut queue = SendQueue::active(16);
        let mut wire = RecordingWire { blocked: true, ..Default::default() };

        for n in 0..3 {
            queue.send(data(n), &mut wire).unwrap();
        }
        assert!(queue.begin_drain());
        assert!(!queue.begin_drain());
        assert_eq!(queue.state(), SessionState::Draining);

        let (late, mut late_done) = Message::with_completion(Frame::Data(Bytes::from("late")));
        queue.send(late, &mut wire).unwrap();
        assert!(matches!(late_done.try_recv(), Ok(Err(SessionError::Draining))));

        wire.blocked = false;
        assert_eq!(queue.flush(&mut wire).unwrap(), Flush::Drained);
        assert_eq!(written(&wire), expected(0..3));
        // draining never clears
        assert_eq!(queue.state(), SessionState::Draining);
    }

    #[test]
    fn completions_report_delivery() {
        let mut queue = SendQueue::active(16);
        let mut wire = RecordingWire::default();

        let (msg, mut done) = Message::with_completion(Frame::Data(Bytes::from("x")));
        queue.send(msg, &mut wire).unwrap();
        assert!(matches!(done.try_recv(), Ok(Ok(()))));

        wire.blocked = true;
        let (msg, mut pending) = Message::with_completion(Frame::Data(Bytes::from("y")));
        queue.send(msg, &mut wire).unwrap();
        assert!(pending.try_recv().is_err());

        queue.close(&SessionError::PeerGone);
        assert!(matches!(pending.try_recv(), Ok(Err(SessionError::PeerGone))));
        assert_eq!(queue.state(), SessionState::Closed);
    }

    #[test]
    fn take_unsent_preserves_order() {
        let mut queue = SendQueue::connecting(16);
        let mut wire = RecordingWire::default();
        for n in 0..4 {
            queue.send(data(n), &mut wire).unwrap();
        }
        let unsent = queue.take_unsent();
        let order: Vec<_> = unsent
            .iter()
            .map(|m| match m.frame() {
                Frame::Data(b) => String::from_utf8(b.to_vec()).unwrap(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(order, expected(0..4));
        assert!(wire.written.is_empty());
        assert_eq!(queue.state(), SessionState::Closed);
    }

    #[test]
    fn write_error_surfaces() {
        let mut queue = SendQueue::active(16);
        let mut wire = RecordingWire { fail: true, ..Default::default() };
        assert!(queue.send(data(0), &mut wire).is_err());
    }
}
