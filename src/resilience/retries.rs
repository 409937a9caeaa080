//! Failover bookkeeping.
//!
//! # Responsibilities
//! - Remember which endpoints a request has already tried
//! - Enforce `session.failover_attempts`
//!
//! # Design Decisions
//! - Only connect failures fail over: nothing reached the backend yet, so
//!   replaying the request is safe for every method
//! - Once a connection is established, errors go to the client as-is

use crate::load_balancer::Endpoint;

#[derive(Debug, Clone)]
pub struct FailoverState {
    remaining: usize,
    tried: Vec<Endpoint>,
}

impl FailoverState {
    /// Start tracking a request first sent to `first`.
    pub fn new(first: Endpoint, attempts: usize) -> Self {
        Self {
            remaining: attempts,
            tried: vec![first],
        }
    }

    /// Endpoints already tried, in order.
    pub fn tried(&self) -> &[Endpoint] {
        &self.tried
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Consume one attempt. Returns false when none are left.
    pub fn try_next(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Record the endpoint chosen for the next attempt.
    pub fn record(&mut self, endpoint: Endpoint) {
        if !self.tried.contains(&endpoint) {
            self.tried.push(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_bounded() {
        let mut state = FailoverState::new(Endpoint::new("a", 1), 2);
        assert!(state.try_next());
        state.record(Endpoint::new("b", 1));
        assert!(state.try_next());
        state.record(Endpoint::new("b", 1));
        assert!(!state.try_next());
        assert_eq!(state.tried().len(), 2);
        assert_eq!(state.remaining(), 0);
    }

    #[test]
    fn zero_attempts_never_fail_over() {
        let mut state = FailoverState::new(Endpoint::new("a", 1), 0);
        assert!(!state.try_next());
    }
}
