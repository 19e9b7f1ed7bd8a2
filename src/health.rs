//! Health vocabulary shared with the endpoints this core talks to.
//!
//! States are ordered `Starting < Connecting < Connected < Idle < Terminating < Terminated`.
//! Transitions only move forward, except that `Connected` and `Idle` may alternate. `Terminated`
//! is absorbing. Gauges encode the state as `0..=5` in that order.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const STATE_STARTING: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_IDLE: u8 = 3;
const STATE_TERMINATING: u8 = 4;
const STATE_TERMINATED: u8 = 5;

/// Lifecycle state of a monitored endpoint, attached by value to every delivery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthState {
    Starting,
    Connecting,
    Connected,
    Idle,
    Terminating,
    Terminated,
}

impl HealthState {
    /// Numeric encoding for gauges.
    pub fn code(self) -> u8 {
        match self {
            HealthState::Starting => STATE_STARTING,
            HealthState::Connecting => STATE_CONNECTING,
            HealthState::Connected => STATE_CONNECTED,
            HealthState::Idle => STATE_IDLE,
            HealthState::Terminating => STATE_TERMINATING,
            HealthState::Terminated => STATE_TERMINATED,
        }
    }

    fn from_code(v: u8) -> Self {
        match v {
            STATE_STARTING => HealthState::Starting,
            STATE_CONNECTING => HealthState::Connecting,
            STATE_CONNECTED => HealthState::Connected,
            STATE_IDLE => HealthState::Idle,
            STATE_TERMINATING => HealthState::Terminating,
            _ => HealthState::Terminated,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: HealthState) -> bool {
        match (self, next) {
            (HealthState::Terminated, _) => false,
            (HealthState::Idle, HealthState::Connected) => true,
            (from, to) => to > from,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Connecting => "connecting",
            HealthState::Connected => "connected",
            HealthState::Idle => "idle",
            HealthState::Terminating => "terminating",
            HealthState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free holder of the current [`HealthState`].
///
/// Clones observe the same state. Illegal transitions are ignored, so concurrent writers can
/// race without ever moving the state backwards.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: Arc<AtomicU8>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { state: Arc::new(AtomicU8::new(STATE_STARTING)) }
    }

    pub fn get(&self) -> HealthState {
        HealthState::from_code(self.state.load(Ordering::Acquire))
    }

    /// Attempt a transition; returns `true` when the state changed.
    pub fn transition(&self, next: HealthState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !HealthState::from_code(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
