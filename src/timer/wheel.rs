//! Hashed timing wheel
//!
//! Timeouts hash onto a power-of-two array of spokes by their deadline
//! tick; entries more than one revolution out carry a round counter.
//! Expiration is cooperative: whoever calls `expire_timers` advances the
//! wheel to the current tick and fires due callbacks on its own thread.
//! Resolution is one tick and drift accumulated between calls is not
//! corrected.

use std::time::{ Duration, Instant };

use crate::error::{ RelayError, Result };

/// Handle to one scheduled timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

type TimerCallback = Box<dyn FnMut() -> Option<Duration> + Send>;

struct Timeout {
    id: u64,
    remaining_rounds: u64,
    callback: TimerCallback,
}

/// Wheel of one-shot timeouts with optional rescheduling
pub struct TimingWheel {
    tick: Duration,
    mask: u64,
    spokes: Vec<Vec<Timeout>>,
    start: Instant,
    current_tick: u64,
    next_id: u64,
}

impl TimingWheel {
    /// Create a wheel with the given tick duration and spoke count
    pub fn new(tick_duration: Duration, ticks_per_wheel: usize) -> Result<Self> {
        if tick_duration.is_zero() {
            return Err(RelayError::config("tick duration must be positive"));
        }
        if !ticks_per_wheel.is_power_of_two() {
            return Err(RelayError::config("ticks per wheel must be a power of 2"));
        }

        let mut spokes = Vec::with_capacity(ticks_per_wheel);
        spokes.resize_with(ticks_per_wheel, Vec::new);

        Ok(Self {
            tick: tick_duration,
            mask: (ticks_per_wheel - 1) as u64,
            spokes,
            start: Instant::now(),
            current_tick: 0,
            next_id: 1,
        })
    }

    /// Tick duration of this wheel
    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    /// Number of spokes
    pub fn ticks_per_wheel(&self) -> usize {
        self.spokes.len()
    }

    /// Currently scheduled timeouts
    pub fn timeout_count(&self) -> usize {
        self.spokes
            .iter()
            .map(Vec::len)
            .sum()
    }

    /// Schedule a callback after `delay`
    ///
    /// The callback fires at most once per scheduling; returning
    /// `Some(next_delay)` re-arms the same timeout id after that delay.
    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> TimeoutId
        where F: FnMut() -> Option<Duration> + Send + 'static
    {
        let id = self.next_id;
        self.next_id += 1;
        self.insert(id, delay, Box::new(callback));
        TimeoutId(id)
    }

    /// Remove a scheduled timeout; returns false when it already fired
    pub fn cancel(&mut self, id: TimeoutId) -> bool {
        for spoke in self.spokes.iter_mut() {
            if let Some(index) = spoke.iter().position(|timeout| timeout.id == id.0) {
                spoke.swap_remove(index);
                return true;
            }
        }
        false
    }

    /// Advance the wheel to `now`, firing due callbacks; returns the number
    /// of callbacks fired
    pub fn expire_timers(&mut self, now: Instant) -> usize {
        let tick_nanos = self.tick.as_nanos();
        let target = (now.duration_since(self.start).as_nanos() / tick_nanos) as u64;

        let mut expired = 0;
        while self.current_tick < target {
            self.current_tick += 1;
            let spoke = (self.current_tick & self.mask) as usize;
            if self.spokes[spoke].is_empty() {
                continue;
            }

            let bucket = std::mem::take(&mut self.spokes[spoke]);
            for mut timeout in bucket {
                if timeout.remaining_rounds > 0 {
                    timeout.remaining_rounds -= 1;
                    self.spokes[spoke].push(timeout);
                    continue;
                }
                expired += 1;
                if let Some(next_delay) = (timeout.callback)() {
                    self.insert(timeout.id, next_delay, timeout.callback);
                }
            }
        }
        expired
    }

    fn insert(&mut self, id: u64, delay: Duration, callback: TimerCallback) {
        let tick_nanos = self.tick.as_nanos();
        let delay_ticks = (
            ((delay.as_nanos() + tick_nanos - 1) / tick_nanos).max(1)
        ) as u64;
        let deadline = self.current_tick + delay_ticks;
        let spoke = (deadline & self.mask) as usize;
        let remaining_rounds = (delay_ticks - 1) / (self.spokes.len() as u64);

        self.spokes[spoke].push(Timeout {
            id,
            remaining_rounds,
            callback,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    const TICK: Duration = Duration::from_millis(1);

    fn wheel() -> TimingWheel {
        TimingWheel::new(TICK, 8).unwrap()
    }

    fn counter_callback(
        fires: &Arc<AtomicUsize>,
        reschedule: Option<Duration>
    ) -> impl FnMut() -> Option<Duration> + Send + 'static {
        let fires = Arc::clone(fires);
        move || {
            fires.fetch_add(1, Ordering::SeqCst);
            reschedule
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut wheel = wheel();
        let start = wheel.start;
        let fires = Arc::new(AtomicUsize::new(0));
        wheel.schedule(TICK * 5, counter_callback(&fires, None));

        assert_eq!(wheel.expire_timers(start + TICK * 4), 0);
        assert_eq!(fires.load(Ordering::SeqCst), 0);

        assert_eq!(wheel.expire_timers(start + TICK * 5), 1);
        assert_eq!(fires.load(Ordering::SeqCst), 1);

        assert_eq!(wheel.expire_timers(start + TICK * 100), 0);
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.timeout_count(), 0);
    }

    #[test]
    fn test_timeout_beyond_one_revolution() {
        let mut wheel = wheel();
        let start = wheel.start;
        let fires = Arc::new(AtomicUsize::new(0));
        // 20 ticks on an 8-spoke wheel needs two extra rounds
        wheel.schedule(TICK * 20, counter_callback(&fires, None));

        assert_eq!(wheel.expire_timers(start + TICK * 19), 0);
        assert_eq!(wheel.expire_timers(start + TICK * 20), 1);
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rescheduling_callback_repeats() {
        let mut wheel = wheel();
        let start = wheel.start;
        let fires = Arc::new(AtomicUsize::new(0));
        wheel.schedule(TICK * 3, counter_callback(&fires, Some(TICK * 3)));

        wheel.expire_timers(start + TICK * 12);
        assert_eq!(fires.load(Ordering::SeqCst), 4);
        assert_eq!(wheel.timeout_count(), 1);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let mut wheel = wheel();
        let start = wheel.start;
        let fires = Arc::new(AtomicUsize::new(0));
        let id = wheel.schedule(TICK * 5, counter_callback(&fires, None));

        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert_eq!(wheel.expire_timers(start + TICK * 10), 0);
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sub_tick_delay_rounds_up_to_one_tick() {
        let mut wheel = wheel();
        let start = wheel.start;
        let fires = Arc::new(AtomicUsize::new(0));
        wheel.schedule(Duration::from_nanos(1), counter_callback(&fires, None));

        assert_eq!(wheel.expire_timers(start + TICK), 1);
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(TimingWheel::new(Duration::ZERO, 8).is_err());
        assert!(TimingWheel::new(TICK, 7).is_err());
    }
}
