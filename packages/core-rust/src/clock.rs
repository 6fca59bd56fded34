//! Wall-clock abstraction used for TTL evaluation.
//!
//! Backends never read the system time directly; they ask an injected
//! [`ClockSource`], so expiry behaviour can be tested deterministically with
//! [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// Clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    // Millisecond timestamps fit in i64 until the year 292 million.
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Manually driven clock. Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock frozen at `initial` epoch milliseconds.
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            time: Arc::new(AtomicI64::new(initial)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, millis: i64) {
        self.time.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.time.fetch_add(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// Returns a shared handle to the system clock.
#[must_use]
pub fn system_clock() -> Arc<dyn ClockSource> {
    Arc::new(SystemClock)
}
