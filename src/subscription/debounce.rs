use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::subscription::Notification;
use crate::sync::lock;

#[derive(Default)]
struct DebounceState {
    pending: Option<Arc<Notification>>,
    deadline: Option<Instant>,
    timer_running: bool,
}

/// What a debounce timer should do next.
#[derive(Debug)]
pub(crate) enum TimerStep {
    Sleep(Duration),
    Fire(Arc<Notification>),
    Idle,
}

/// Trailing-edge debounce state for one subscription.
///
/// At most one timer runs per debouncer. Each scheduled notification replaces
/// the pending one and pushes the deadline back; the running timer keeps
/// sleeping until the deadline stops moving, then delivers the latest change.
pub(crate) struct Debouncer {
    wait: Duration,
    state: Mutex<DebounceState>,
}

impl Debouncer {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            state: Mutex::new(DebounceState::default()),
        }
    }

    /// Replace the pending notification and restart the quiet window.
    ///
    /// Returns `true` when no timer is running and the caller must start one.
    pub fn schedule(&self, notification: Arc<Notification>) -> bool {
        let mut state = lock(&self.state);
        state.pending = Some(notification);
        state.deadline = Some(Instant::now() + self.wait);
        if state.timer_running {
            return false;
        }
        state.timer_running = true;
        true
    }

    /// Called from the timer thread to decide whether to sleep, fire or exit.
    pub fn poll(&self, now: Instant) -> TimerStep {
        let mut state = lock(&self.state);
        let Some(deadline) = state.deadline else {
            state.timer_running = false;
            state.pending = None;
            return TimerStep::Idle;
        };
        if now < deadline {
            return TimerStep::Sleep(deadline - now);
        }

        state.deadline = None;
        state.timer_running = false;
        match state.pending.take() {
            Some(notification) => TimerStep::Fire(notification),
            None => TimerStep::Idle,
        }
    }

    /// The timer could not be started; the next schedule retries.
    pub fn timer_failed(&self) {
        lock(&self.state).timer_running = false;
    }

    /// Drop the pending notification; a running timer exits without firing.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.pending = None;
        state.deadline = None;
    }
}
