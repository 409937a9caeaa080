//! Per-backend throttle gate.
//!
//! # Responsibilities
//! - Count how many downstream sessions to one backend are currently unwritable
//! - Notify every registered listener on the 0→1 and 1→0 edges only
//! - Replay the current state to listeners that register while throttled
//!
//! # Design Decisions
//! - The counter is a plain atomic; the listener set is locked only on edges
//!   and on (de)registration, never on intermediate increments
//! - Edge delivery re-reads the counter under the lock and compares it with
//!   the last state delivered, so racing edges collapse instead of leaving
//!   listeners throttled forever or notifying twice
//! - Listeners must not block: the session implementation just posts a
//!   command to its own inbox

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Receiver of throttle edges.
pub trait ThrottleListener: Send + Sync {
    /// Backend became saturated: stop reading from the peer.
    fn on_throttle(&self);
    /// Backend drained: resume reading.
    fn on_stop_throttle(&self);
}

/// Handle returned by [`ThrottleGate::register`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerSet {
    next_id: u64,
    /// Last state delivered to listeners.
    throttled: bool,
    /// Throttle edges delivered so far.
    raised: u64,
    entries: Vec<(ListenerId, Arc<dyn ThrottleListener>)>,
}

/// Atomic throttle counter plus its listener set.
pub struct ThrottleGate {
    count: AtomicUsize,
    listeners: Mutex<ListenerSet>,
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            listeners: Mutex::new(ListenerSet {
                next_id: 0,
                throttled: false,
                raised: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Raise the counter. Returns the post-increment count.
    pub fn increment(&self) -> usize {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.deliver_edge();
        }
        prev + 1
    }

    /// Lower the counter. Returns the post-decrement count; a no-op at zero.
    pub fn decrement(&self) -> usize {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 {
            self.deliver_edge();
        }
        current - 1
    }

    /// Current counter value.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_throttled(&self) -> bool {
        self.count() > 0
    }

    /// Add a listener. If the gate is currently throttled the listener
    /// receives `on_throttle` immediately.
    pub fn register(&self, listener: Arc<dyn ThrottleListener>) -> ListenerId {
        let mut set = self.listeners.lock();
        let id = ListenerId(set.next_id);
        set.next_id += 1;
        if set.throttled {
            listener.on_throttle();
        }
        set.entries.push((id, listener));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn deregister(&self, id: ListenerId) {
        self.listeners.lock().entries.retain(|(entry, _)| *entry != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Number of 0→1 edges delivered since the gate was created.
    pub fn times_raised(&self) -> u64 {
        self.listeners.lock().raised
    }

    fn deliver_edge(&self) {
        let mut set = self.listeners.lock();
        let throttled = self.count.load(Ordering::Acquire) > 0;
        if throttled == set.throttled {
            return;
        }
        set.throttled = throttled;
        if throttled {
            set.raised += 1;
        }
        for (_, listener) in &set.entries {
            if throttled {
                listener.on_throttle();
            } else {
                listener.on_stop_throttle();
            }
        }
    }
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThrottleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleGate")
            .field("count", &self.count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts notifications.
    #[derive(Default)]
    pub(crate) struct CountingListener {
        pub throttles: AtomicUsize,
        pub resumes: AtomicUsize,
    }

    impl ThrottleListener for CountingListener {
        fn on_throttle(&self) {
            self.throttles.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stop_throttle(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingListener {
        pub(crate) fn counts(&self) -> (usize, usize) {
            (
                self.throttles.load(Ordering::SeqCst),
                self.resumes.load(Ordering::SeqCst),
            )
        }
    }

    #[test]
    fn fires_only_on_edges() {
        let gate = ThrottleGate::new();
        let listeners: Vec<Arc<CountingListener>> =
            (0..3).map(|_| Arc::new(CountingListener::default())).collect();
        for l in &listeners {
            gate.register(l.clone());
        }

        let n = 5;
        for i in 1..=n {
            assert_eq!(gate.increment(), i);
            for l in &listeners {
                assert_eq!(l.counts(), (1, 0));
            }
        }
        for i in (0..n).rev() {
            assert_eq!(gate.decrement(), i);
            let expected = if i == 0 { (1, 1) } else { (1, 0) };
            for l in &listeners {
                assert_eq!(l.counts(), expected);
            }
        }
        assert_eq!(gate.times_raised(), 1);

        gate.increment();
        gate.decrement();
        assert_eq!(gate.times_raised(), 2);
    }

    #[test]
    fn decrement_at_zero_is_noop() {
        let gate = ThrottleGate::new();
        let l = Arc::new(CountingListener::default());
        gate.register(l.clone());
        assert_eq!(gate.decrement(), 0);
        assert_eq!(l.counts(), (0, 0));
        assert_eq!(gate.increment(), 1);
        assert_eq!(l.counts(), (1, 0));
    }

    #[test]
    fn late_registration_sees_current_state() {
        let gate = ThrottleGate::new();
        gate.increment();

        let late = Arc::new(CountingListener::default());
        gate.register(late.clone());
        assert_eq!(late.counts(), (1, 0));

        gate.decrement();
        assert_eq!(late.counts(), (1, 1));
    }

    #[test]
    fn deregistered_listener_is_silent() {
        let gate = ThrottleGate::new();
        let l = Arc::new(CountingListener::default());
        let id = gate.register(l.clone());
        gate.deregister(id);
        assert_eq!(gate.listener_count(), 0);

        gate.increment();
        gate.decrement();
        assert_eq!(l.counts(), (0, 0));
    }

    #[test]
    fn concurrent_edges_settle_unthrottled() {
        let gate = Arc::new(ThrottleGate::new());
        let l = Arc::new(CountingListener::default());
        gate.register(l.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        gate.increment();
                        gate.decrement();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(gate.count(), 0);
        let (throttles, resumes) = l.counts();
        // every throttle delivered was matched by a resume
        assert_eq!(throttles, resumes);
    }
}
