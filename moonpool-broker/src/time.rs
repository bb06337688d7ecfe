//! Wall-clock abstraction for liveness timestamps.
//!
//! Liveness timestamps are compared across processes, so they come from the
//! wall clock rather than tokio's monotonic clock. [`Clock`] lets tests drive
//! them deterministically with [`ManualClock`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Source of wall-clock timestamps.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Real time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
///
/// Each call to [`now`](Clock::now) returns the current value and then advances
/// it by the configured step, so consecutive readings are strictly increasing
/// unless the step is zero.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    step: ChronoDuration,
}

impl ManualClock {
    /// Start at `start`, advancing by `step` after every reading.
    pub fn new(start: DateTime<Utc>, step: ChronoDuration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState { now: start, step })),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: ChronoDuration) {
        self.state.lock().now += by;
    }

    /// Current value without advancing.
    pub fn peek(&self) -> DateTime<Utc> {
        self.state.lock().now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock();
        let now = state.now;
        state.now = now + state.step;
        now
    }
}
