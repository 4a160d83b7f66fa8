//! Time source used by the bus and mailbox deadlines.
//!
//! Time is injected rather than read from a global so tests can drive deadlines explicitly.

use core::cell::Cell;
use core::time::Duration;
use std::time::Instant;

/// Monotonic time since an arbitrary epoch fixed at clock construction.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Hand-cranked clock for tests.
#[derive(Debug, Default)]
pub struct MockClock {
    now: Cell<Duration>,
}

impl MockClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}
