//! Observable state cell shared by a worker thread and the control thread
//!
//! Workers publish transitions with [`StateCell::set`]; the control thread
//! blocks on [`StateCell::wait_until`] with an upper bound instead of
//! spinning.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct StateCell<S> {
    state: Mutex<S>,
    changed: Condvar,
}

impl<S: Copy + PartialEq> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> S {
        *self.state.lock()
    }

    pub fn set(&self, next: S) {
        *self.state.lock() = next;
        self.changed.notify_all();
    }

    /// Replace `from` with `to` if it is current. Returns whether it swapped.
    pub fn transition(&self, from: S, to: S) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            drop(state);
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Block until `pred` holds. Returns the state reached or `None` on timeout.
    pub fn wait_until(&self, timeout: Duration, mut pred: impl FnMut(S) -> bool) -> Option<S> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !pred(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return if pred(*state) { Some(*state) } else { None };
            }
        }
        Some(*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Idle,
        Busy,
        Done,
    }

    #[test]
    fn test_wait_sees_worker_transition() {
        let cell = Arc::new(StateCell::new(Phase::Idle));
        let worker = {
            let cell = cell.clone();
            thread::spawn(move || {
                cell.set(Phase::Busy);
                thread::sleep(Duration::from_millis(20));
                cell.set(Phase::Done);
            })
        };
        let reached = cell.wait_until(Duration::from_secs(5), |s| s == Phase::Done);
        assert_eq!(reached, Some(Phase::Done));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let cell = StateCell::new(Phase::Idle);
        assert_eq!(cell.wait_until(Duration::from_millis(10), |s| s == Phase::Done), None);
    }

    #[test]
    fn test_transition_only_from_expected() {
        let cell = StateCell::new(Phase::Idle);
        assert!(!cell.transition(Phase::Busy, Phase::Done));
        assert!(cell.transition(Phase::Idle, Phase::Busy));
        assert_eq!(cell.get(), Phase::Busy);
    }
}
