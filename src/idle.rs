//! Idle strategies for pipeline workers
//!
//! An idle strategy controls how a worker backs off when one iteration of
//! its poll loop produced no work. Each variant trades latency against CPU
//! usage: busy spinning for the lowest latency, yielding for fairness on
//! shared cores, parking for the lowest CPU usage, and a composite ramp
//! that degrades from spinning through yielding to parking.

use std::hint;
use std::thread;
use std::time::Duration;

/// Configuration-side selector for an idle strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    /// Spin on the CPU pause instruction
    BusySpin,
    /// Yield the thread to the scheduler
    Yielding,
    /// Park the thread for a fixed duration
    ParkNanos(Duration),
    /// Ramp from spinning through yielding to parking with doubling backoff
    Backoff,
}

/// Spins attempted by the backoff ramp before yielding
const BACKOFF_MAX_SPINS: u64 = 100;

/// Yields attempted by the backoff ramp before parking
const BACKOFF_MAX_YIELDS: u64 = 10;

/// Initial park duration of the backoff ramp
const BACKOFF_MIN_PARK: Duration = Duration::from_nanos(1_000);

/// Maximum park duration of the backoff ramp
const BACKOFF_MAX_PARK: Duration = Duration::from_micros(100);

/// Backoff policy applied when a poll iteration produced no work
#[derive(Debug)]
pub enum IdleStrategy {
    /// Lowest latency, one full core
    BusySpin,
    /// Moderate latency and CPU usage
    Yielding,
    /// Lowest CPU usage, latency bounded by the park duration
    ParkNanos(Duration),
    /// Composite spin -> yield -> park ramp
    Backoff {
        /// Idle iterations since the last productive one
        count: u64,
        /// Current park duration, doubled up to the maximum
        park: Duration,
    },
}

impl IdleStrategy {
    /// Build a strategy from its configuration selector
    pub fn from_kind(kind: IdleKind) -> Self {
        match kind {
            IdleKind::BusySpin => Self::BusySpin,
            IdleKind::Yielding => Self::Yielding,
            IdleKind::ParkNanos(duration) => Self::ParkNanos(duration),
            IdleKind::Backoff => Self::Backoff {
                count: 0,
                park: BACKOFF_MIN_PARK,
            },
        }
    }

    /// Invoke the strategy with the work count of the last iteration
    ///
    /// A non-zero work count resets any ramp state and returns immediately.
    #[inline]
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        match self {
            Self::BusySpin => hint::spin_loop(),
            Self::Yielding => thread::yield_now(),
            Self::ParkNanos(duration) => thread::sleep(*duration),
            Self::Backoff { count, park } => {
                if *count < BACKOFF_MAX_SPINS {
                    hint::spin_loop();
                } else if *count < BACKOFF_MAX_SPINS + BACKOFF_MAX_YIELDS {
                    thread::yield_now();
                } else {
                    thread::sleep(*park);
                    *park = (*park * 2).min(BACKOFF_MAX_PARK);
                }
                *count += 1;
            }
        }
    }

    fn reset(&mut self) {
        if let Self::Backoff { count, park } = self {
            *count = 0;
            *park = BACKOFF_MIN_PARK;
        }
    }
}
