//! Timer executor and snapshot timer
//!
//! A dedicated thread advances the timing wheel in a tight loop while the
//! pipeline runs; its running flag is separate from the stage workers'.
//! The snapshot timer re-arms itself on every expiry and enqueues a
//! save-snapshot marker for the ingress worker, which owns the ingress
//! ring's producer side.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;
use std::time::{ Duration, Instant };

use parking_lot::Mutex;

use crate::error::{ RelayError, Result };
use crate::message::{ MarkerQueue, SAVE_SNAPSHOT_TEMPLATE_ID };
use crate::timer::wheel::{ TimeoutId, TimingWheel };

/// Dedicated thread expiring wheel timers while the pipeline runs
pub struct TimerExecutor {
    wheel: Arc<Mutex<TimingWheel>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerExecutor {
    /// Create an executor for a shared wheel
    pub fn new(wheel: Arc<Mutex<TimingWheel>>) -> Self {
        Self {
            wheel,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Launch the expiration thread
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(RelayError::usage("timer executor already started"));
        }

        self.running.store(true, Ordering::SeqCst);
        let wheel = Arc::clone(&self.wheel);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder
            ::new()
            .name("relay-timer".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let expired = wheel.lock().expire_timers(Instant::now());
                    if expired == 0 {
                        std::hint::spin_loop();
                    }
                }
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the expiration thread and join it; idempotent
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("timer executor thread panicked");
            }
        }
    }
}

impl Drop for TimerExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodic producer of save-snapshot markers
pub struct SnapshotTimer {
    wheel: Arc<Mutex<TimingWheel>>,
    markers: Arc<MarkerQueue>,
    interval: Duration,
    node_id: u16,
    timeout: Option<TimeoutId>,
}

impl SnapshotTimer {
    /// Create a timer feeding the given marker queue
    pub fn new(
        wheel: Arc<Mutex<TimingWheel>>,
        markers: Arc<MarkerQueue>,
        interval: Duration,
        node_id: u16
    ) -> Self {
        Self {
            wheel,
            markers,
            interval,
            node_id,
            timeout: None,
        }
    }

    /// Arm the repeating timeout
    pub fn start(&mut self) -> Result<()> {
        if self.timeout.is_some() {
            return Err(RelayError::usage("snapshot timer already started"));
        }

        let markers = Arc::clone(&self.markers);
        let interval = self.interval;
        let node_id = self.node_id;
        let id = self.wheel.lock().schedule(interval, move || {
            markers.enqueue(SAVE_SNAPSHOT_TEMPLATE_ID, node_id);
            Some(interval)
        });
        self.timeout = Some(id);
        Ok(())
    }

    /// Cancel the timeout; idempotent
    pub fn stop(&mut self) {
        if let Some(id) = self.timeout.take() {
            self.wheel.lock().cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::decode_snapshot;

    fn shared_wheel() -> Arc<Mutex<TimingWheel>> {
        Arc::new(Mutex::new(TimingWheel::new(Duration::from_micros(100), 512).unwrap()))
    }

    #[test]
    fn test_executor_fires_scheduled_timeouts() {
        let wheel = shared_wheel();
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = Arc::clone(&fired);
            wheel.lock().schedule(Duration::from_millis(1), move || {
                fired.store(true, Ordering::SeqCst);
                None
            });
        }

        let mut executor = TimerExecutor::new(Arc::clone(&wheel));
        executor.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::yield_now();
        }
        executor.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_executor_double_start_is_usage_error() {
        let mut executor = TimerExecutor::new(shared_wheel());
        executor.start().unwrap();
        assert!(executor.start().unwrap_err().is_usage());
        executor.stop();
    }

    #[test]
    fn test_executor_stop_is_idempotent() {
        let mut executor = TimerExecutor::new(shared_wheel());
        executor.start().unwrap();
        executor.stop();
        executor.stop();
    }

    #[test]
    fn test_snapshot_timer_emits_markers_at_interval() {
        let wheel = shared_wheel();
        let markers = Arc::new(MarkerQueue::new());
        let mut timer = SnapshotTimer::new(
            Arc::clone(&wheel),
            Arc::clone(&markers),
            Duration::from_millis(5),
            3
        );
        timer.start().unwrap();
        assert!(timer.start().unwrap_err().is_usage());

        let mut executor = TimerExecutor::new(Arc::clone(&wheel));
        executor.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        timer.stop();
        executor.stop();

        let mut count = 0;
        while let Some(marker) = markers.pop() {
            let (header, body) = decode_snapshot(&marker).unwrap();
            assert_eq!(header.template_id, SAVE_SNAPSHOT_TEMPLATE_ID);
            assert_eq!(body.node_id, 3);
            count += 1;
        }
        // 60 ms at a 5 ms interval, with scheduling slack
        assert!(count >= 6, "expected at least 6 markers, got {}", count);
        assert!(count <= 14, "expected at most 14 markers, got {}", count);
    }

    #[test]
    fn test_stop_cancels_pending_timeout() {
        let wheel = shared_wheel();
        let markers = Arc::new(MarkerQueue::new());
        let mut timer = SnapshotTimer::new(
            Arc::clone(&wheel),
            Arc::clone(&markers),
            Duration::from_secs(10),
            0
        );
        timer.start().unwrap();
        assert_eq!(wheel.lock().timeout_count(), 1);
        timer.stop();
        assert_eq!(wheel.lock().timeout_count(), 0);
    }
}
