use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Optional scheduler activity counters, all updated relaxed on hot paths.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs handed to `run_jobs`.
    pub jobs_submitted: AtomicU64,
    /// Jobs that ran to completion.
    pub jobs_completed: AtomicU64,
    /// Switches from a running fiber to a ready one.
    pub fiber_switches: AtomicU64,
    /// Fibers parked on a counter.
    pub fiber_parks: AtomicU64,
    /// Worker threads that went to sleep on their gate.
    pub worker_parks: AtomicU64,
    /// Counters returned to the freelist.
    pub counters_recycled: AtomicU64,
    /// When collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            fiber_switches: AtomicU64::new(0),
            fiber_parks: AtomicU64::new(0),
            worker_parks: AtomicU64::new(0),
            counters_recycled: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            fiber_switches: self.fiber_switches.load(Ordering::Relaxed),
            fiber_parks: self.fiber_parks.load(Ordering::Relaxed),
            worker_parks: self.worker_parks.load(Ordering::Relaxed),
            counters_recycled: self.counters_recycled.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub fiber_switches: u64,
    pub fiber_parks: u64,
    pub worker_parks: u64,
    pub counters_recycled: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Completed jobs per second since creation.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs submitted but not yet completed.
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_submitted.saturating_sub(self.jobs_completed)
    }
}
