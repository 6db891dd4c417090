//! # Weft - Fiber-Based Task Scheduler
//!
//! A fiber-based task scheduler for high-throughput, low-latency fan-out /
//! fan-in workloads, in the style popularized by game engine job systems.
//! A fixed pool of worker threads multiplexes a fixed pool of user-space
//! fibers; jobs are distributed over bounded lock-free queues and
//! synchronized through decrementing counters.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful coroutines that run the task loop and can park on
//!   a counter without blocking their worker thread
//! - **MPMC queues**: bounded lock-free rings carrying tasks, free fibers,
//!   ready fibers and free counters
//! - **Counters**: fan-in synchronization points decremented per finished
//!   job
//! - **Parking gates**: futex-backed word mutexes that put idle workers
//!   into kernel wait
//!
//! All allocation happens at creation; steady-state submission and waiting
//! never touch the heap.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft::{Job, JobContext, JobSystem, JobSystemDesc};
//!
//! static HITS: AtomicUsize = AtomicUsize::new(0);
//!
//! fn record_hit(_ctx: &JobContext, amount: usize) {
//!     HITS.fetch_add(amount, Ordering::Relaxed);
//! }
//!
//! let scheduler = JobSystem::new(JobSystemDesc::default());
//!
//! let jobs = [Job::new(record_hit, 1); 64];
//! let handle = scheduler.run_jobs(&jobs);
//! scheduler.wait_for_counter(handle, 0);
//!
//! assert_eq!(HITS.load(Ordering::Relaxed), 64);
//! ```

pub mod context;
pub mod job;
pub mod job_system;
pub mod light_mutex;
pub mod mpmc;

mod counter;
mod fiber;
mod worker;

#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "trace")]
pub mod trace;

pub use context::JobContext;
pub use job::{Job, JobFn, JobHandle};
pub use job_system::{JobSystem, JobSystemDesc};

#[cfg(test)]
mod tests;
