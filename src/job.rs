//! Job definitions and the completion handle returned by submission.
//!
//! A job is plain data: an entry function pointer plus one word of user
//! payload. Jobs are copied into queue slots, so they carry no allocation
//! and no destructor.

use std::ptr::NonNull;

use crate::context::JobContext;
use crate::counter::Counter;

/// Entry point of a job. The context grants access to the scheduler from
/// inside the job (nested submission, counter waits, yields); the `usize`
/// is the payload passed to [`Job::new`].
pub type JobFn = fn(&JobContext<'_>, usize);

/// A unit of work: an entry function and one word of payload.
#[derive(Clone, Copy)]
pub struct Job {
    entry: JobFn,
    param: usize,
}

impl Job {
    /// Creates a job invoking `entry` with `param`.
    pub fn new(entry: JobFn, param: usize) -> Self {
        Job { entry, param }
    }

    pub(crate) fn invoke(self, ctx: &JobContext<'_>) {
        (self.entry)(ctx, self.param)
    }
}

/// A job paired with the index of the counter it decrements on completion.
/// The index is stable for the lifetime of the scheduler, which keeps this
/// struct a third of a cache line.
#[derive(Clone, Copy)]
pub(crate) struct QueuedTask {
    pub(crate) job: Job,
    pub(crate) counter_index: u32,
}

/// Tracks completion of one submitted batch.
///
/// The handle is move-only: waiting on it consumes it, which is when the
/// underlying counter returns to the scheduler's pool. A handle that is
/// dropped without being waited on parks its counter until the scheduler
/// itself is torn down.
#[must_use = "wait on the handle to recycle its counter"]
pub struct JobHandle {
    counter: NonNull<Counter>,
}

// The handle is an opaque reference into the scheduler's counter pool;
// moving it across threads is how nested batches hand completion around.
unsafe impl Send for JobHandle {}

impl JobHandle {
    pub(crate) fn new(counter: &Counter) -> Self {
        JobHandle {
            counter: NonNull::from(counter),
        }
    }

    /// Whether every job in the batch has finished.
    pub fn is_complete(&self) -> bool {
        self.counter().outstanding() == 0
    }

    pub(crate) fn counter(&self) -> &Counter {
        // SAFETY: the counter lives in its scheduler's pool, and the pool
        // outlives every handle it issued (handles are consumed by waits,
        // which must complete before the scheduler is dropped).
        unsafe { self.counter.as_ref() }
    }
}

/// Raw-pointer wrapper so fiber closures and worker threads can capture a
/// reference to scheduler internals.
pub(crate) struct SendPtr<T>(pub(crate) *const T);

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}

unsafe impl<T> Send for SendPtr<T> {}
