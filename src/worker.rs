//! Stage worker threads
//!
//! A worker owns one OS thread driving a single stage poll step, a
//! sequentially-consistent running flag, and a pair of read counters that
//! reporting collaborators observe with acquire loads. Workers start at
//! most once and close at most once; the first `close` joins the thread and
//! later calls are no-ops.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::JoinHandle;

use crate::error::{ RelayError, Result };
use crate::idle::IdleStrategy;
use crate::ring::buffer::PaddedAtomicU64;

/// One poll step of a pipeline stage
///
/// `poll` returns a unitless work count for the iteration; zero means the
/// iteration found nothing to do. Retry loops inside an implementation must
/// re-check `running` so shutdown stays prompt even under backpressure;
/// a record in flight when the flag drops may be abandoned by design.
pub trait StagePoller: Send {
    /// Execute one poll step
    fn poll(&mut self, running: &AtomicBool) -> usize;

    /// Release the attached subscription, publication or journal; invoked
    /// once on the worker thread after the loop exits
    fn on_close(&mut self) {}
}

/// Monotone read counters maintained by each input worker
///
/// Single writer (the worker thread), release-ordered stores, observable by
/// any number of reporting threads.
#[derive(Debug)]
pub struct WorkerCounters {
    successful_reads: PaddedAtomicU64,
    failed_reads: PaddedAtomicU64,
}

impl WorkerCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            successful_reads: PaddedAtomicU64::new(0),
            failed_reads: PaddedAtomicU64::new(0),
        }
    }

    #[inline]
    fn record_success(&self) {
        let value = self.successful_reads.load(Ordering::Relaxed);
        self.successful_reads.store(value + 1, Ordering::Release);
    }

    #[inline]
    fn record_failure(&self) {
        let value = self.failed_reads.load(Ordering::Relaxed);
        self.failed_reads.store(value + 1, Ordering::Release);
    }

    /// Poll iterations that produced work
    pub fn successful_reads(&self) -> u64 {
        self.successful_reads.load(Ordering::Acquire)
    }

    /// Poll iterations that found nothing to do
    pub fn failed_reads(&self) -> u64 {
        self.failed_reads.load(Ordering::Acquire)
    }

    /// `failed / (failed + successful)`, zero before the first iteration
    pub fn failure_ratio(&self) -> f64 {
        let failed = self.failed_reads() as f64;
        let total = failed + (self.successful_reads() as f64);
        if total == 0.0 {
            0.0
        } else {
            failed / total
        }
    }
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Constructed,
    Running,
    Joined,
}

/// Thread wrapper driving one stage poller
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    counters: Arc<WorkerCounters>,
    poller: Option<Box<dyn StagePoller>>,
    idle: Option<IdleStrategy>,
    handle: Option<JoinHandle<()>>,
    state: WorkerState,
}

impl Worker {
    /// Create a worker in the constructed state
    pub fn new(
        name: impl Into<String>,
        poller: Box<dyn StagePoller>,
        idle: IdleStrategy,
        counters: Arc<WorkerCounters>
    ) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            counters,
            poller: Some(poller),
            idle: Some(idle),
            handle: None,
            state: WorkerState::Constructed,
        }
    }

    /// Counters shared with reporting collaborators
    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters)
    }

    /// True while the worker thread is live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the worker thread
    ///
    /// Starting a worker twice is a usage error.
    pub fn start(&mut self) -> Result<()> {
        if self.state != WorkerState::Constructed {
            return Err(RelayError::usage(format!("worker {} already started", self.name)));
        }

        self.running.store(true, Ordering::SeqCst);

        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let mut poller = self.poller.take().expect("poller present in constructed state");
        let mut idle = self.idle.take().expect("idle strategy present in constructed state");

        let handle = std::thread::Builder
            ::new()
            .name(name.clone())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let work = poller.poll(&running);
                    if work == 0 {
                        counters.record_failure();
                        idle.idle(0);
                    } else {
                        counters.record_success();
                        idle.idle(work);
                    }
                }
                poller.on_close();
                tracing::info!(
                    worker = %name,
                    failure_ratio = counters.failure_ratio(),
                    "worker stopped"
                );
            })?;

        self.handle = Some(handle);
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Stop the worker and join its thread
    ///
    /// Closing before `start` is a usage error; a second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Constructed => {
                Err(RelayError::usage(format!("worker {} closed before start", self.name)))
            }
            WorkerState::Running => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        tracing::warn!(worker = %self.name, "worker thread panicked");
                    }
                }
                self.state = WorkerState::Joined;
                Ok(())
            }
            WorkerState::Joined => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.state == WorkerState::Running {
            let _ = self.close();
        }
    }
}
