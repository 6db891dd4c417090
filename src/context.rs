//! Scheduler access from inside a running job.

use std::cell::Cell;
use std::sync::atomic::{fence, Ordering};

use corosensei::Yielder;

use crate::fiber::{FiberId, Suspend};
use crate::job::{Job, JobHandle};
use crate::job_system::Inner;

/// Handed to every job; the scheduler as seen from inside a fiber.
///
/// The context is tied to the current fiber activation and cannot leave it.
/// Its worker index is refreshed on every resume, so it stays correct even
/// when the fiber sleeps on one thread and wakes on another.
pub struct JobContext<'a> {
    inner: &'a Inner,
    yielder: &'a Yielder<usize, Suspend>,
    worker: &'a Cell<usize>,
    fiber: FiberId,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        inner: &'a Inner,
        yielder: &'a Yielder<usize, Suspend>,
        worker: &'a Cell<usize>,
        fiber: FiberId,
    ) -> Self {
        JobContext {
            inner,
            yielder,
            worker,
            fiber,
        }
    }

    /// Submits a nested batch. Same contract as [`JobSystem::run_jobs`].
    ///
    /// [`JobSystem::run_jobs`]: crate::job_system::JobSystem::run_jobs
    pub fn run_jobs(&self, jobs: &[Job]) -> JobHandle {
        self.inner.run_jobs(jobs)
    }

    /// Waits until at most `target` jobs of the batch remain.
    ///
    /// Publishes this fiber on the counter and parks it, lending the worker
    /// thread to other fibers; the fiber resumes, possibly on a different
    /// worker, once the count crosses the target. If the batch already
    /// finished the call returns without parking.
    pub fn wait_for_counter(&self, handle: JobHandle, target: u32) {
        let counter = handle.counter();

        if counter.outstanding() > target {
            counter.begin_wait(self.fiber, target, self.inner);

            // Paired with the fence on the decrement side; see complete_one.
            fence(Ordering::SeqCst);

            let must_park = if counter.outstanding() > target {
                true
            } else {
                // The count crossed the target while we published. If the
                // withdrawal fails, a decrementer consumed the publication
                // and a wake is in flight, so parking is mandatory.
                !counter.cancel_wait(self.fiber)
            };

            if must_park {
                self.worker.set(self.yielder.suspend(Suspend::Parked));
            }
        }

        counter.finish_wait();
    }

    /// Index of the worker currently running this fiber. Valid until the
    /// next suspension point.
    pub fn worker_index(&self) -> usize {
        self.worker.get()
    }

    /// Gives one ready-to-resume fiber a turn, if there is one.
    pub fn yield_now(&self) {
        if let Some(ready) = self.inner.waiting_fibers.try_pop() {
            self.worker.set(self.yielder.suspend(Suspend::YieldTo(ready)));
        }
    }
}
