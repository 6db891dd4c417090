//! Fiber slots and the task loop every fiber executes.
//!
//! Fibers are stackful coroutines (via `corosensei`) stored in an indexed
//! slot table. A fiber never switches to another fiber directly; it
//! suspends to its worker with a [`Suspend`] directive and the worker
//! performs the switch. The worker index rides the resume payload, so a
//! fiber that sleeps on one thread and wakes on another always reads the
//! index of the thread it is actually running on.

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};

use crate::context::JobContext;
use crate::job::{QueuedTask, SendPtr};
use crate::job_system::Inner;

/// Index into the scheduler's fiber slot table.
pub(crate) type FiberId = u32;

/// A fiber's coroutine: resumed with the current worker index, suspends
/// with a scheduling directive, returns at shutdown.
pub(crate) type TaskCoroutine = Coroutine<usize, Suspend, ()>;

/// What a suspending fiber asks of its worker.
pub(crate) enum Suspend {
    /// Requeue me on the open-fiber freelist and resume the carried fiber
    /// instead. The target was already popped from the ready queue by this
    /// fiber.
    YieldTo(FiberId),
    /// My id has been published to a counter; a decrementer will move it to
    /// a ready queue. Pick up a fresh fiber and keep going.
    Parked,
}

const VACANT: u32 = 0;
const STORED: u32 = 1;

/// One slot of the fiber table.
///
/// The slot state is the handshake that makes cross-thread resumption safe:
/// a fiber id can become reachable (published on a counter) moments before
/// its coroutine finishes suspending on the old thread, so a resumer spins
/// until the old worker has stored the coroutine back.
pub(crate) struct FiberSlot {
    state: AtomicU32,
    cell: UnsafeCell<Option<TaskCoroutine>>,
}

// The slot protocol hands the coroutine between threads: exactly one party
// holds a claim to an id at any time, and `state` orders the transfer.
// Everything living on a suspended fiber's stack is reachable only through
// plain-data jobs and the scheduler itself, so migrating it is sound.
unsafe impl Send for FiberSlot {}
unsafe impl Sync for FiberSlot {}

impl FiberSlot {
    pub(crate) fn new() -> Self {
        FiberSlot {
            state: AtomicU32::new(VACANT),
            cell: UnsafeCell::new(None),
        }
    }

    /// Stores a coroutine and makes it claimable.
    pub(crate) fn put(&self, fiber: TaskCoroutine) {
        unsafe { *self.cell.get() = Some(fiber) };
        self.state.store(STORED, Ordering::Release);
    }

    /// Claims the coroutine, waiting out a suspend still in progress on
    /// another thread. The wait is bounded by the tail of one context
    /// switch.
    pub(crate) fn take(&self) -> TaskCoroutine {
        while self.state.load(Ordering::Acquire) != STORED {
            std::hint::spin_loop();
        }
        self.state.store(VACANT, Ordering::Relaxed);
        unsafe { (*self.cell.get()).take().expect("fiber slot empty") }
    }
}

/// Builds one fiber: allocates its stack and wraps the task loop.
pub(crate) fn spawn_fiber(inner: SendPtr<Inner>, id: FiberId, stack_size: usize) -> TaskCoroutine {
    let stack = DefaultStack::new(stack_size).expect("fiber stack allocation failed");
    Coroutine::with_stack(stack, move |yielder, first_worker: usize| {
        // SAFETY: the scheduler owns this fiber and outlives it.
        let inner = unsafe { &*inner.0 };
        task_loop(inner, id, yielder, first_worker);
    })
}

/// The loop every fiber runs: drain the current worker's task queue,
/// yielding to ready fibers between tasks, parking the thread when idle.
fn task_loop(inner: &Inner, id: FiberId, yielder: &Yielder<usize, Suspend>, first_worker: usize) {
    let worker = Cell::new(first_worker);

    while !inner.shutdown.load(Ordering::Relaxed) {
        debug_assert!(worker.get() < inner.num_workers);

        if inner.queued_tasks[worker.get()].approx_size() == 0
            && inner.waiting_fibers.approx_size() == 0
        {
            inner.park_idle(worker.get());
        }

        while let Some(task) = next_task(inner, yielder, &worker) {
            run_task(inner, id, yielder, &worker, task);
        }
    }
}

/// The yield point. Ready-to-resume fibers take priority over fresh tasks,
/// which bounds the tail latency of fan-in waits; afterwards pop from the
/// queue of whichever worker this fiber is now on.
fn next_task(
    inner: &Inner,
    yielder: &Yielder<usize, Suspend>,
    worker: &Cell<usize>,
) -> Option<QueuedTask> {
    if inner.waiting_fibers.approx_size() != 0 {
        if let Some(ready) = inner.waiting_fibers.try_pop() {
            #[cfg(feature = "metrics")]
            inner.metrics.fiber_switches.fetch_add(1, Ordering::Relaxed);
            worker.set(yielder.suspend(Suspend::YieldTo(ready)));
        }
    }

    inner.queued_tasks[worker.get()].try_pop()
}

fn run_task(
    inner: &Inner,
    id: FiberId,
    yielder: &Yielder<usize, Suspend>,
    worker: &Cell<usize>,
    task: QueuedTask,
) {
    let counter_index = task.counter_index as usize;

    #[cfg(feature = "trace")]
    let _span = crate::trace::job_span(worker.get(), id, task.counter_index);

    let ctx = JobContext::new(inner, yielder, worker, id);
    let result = panic::catch_unwind(AssertUnwindSafe(|| task.job.invoke(&ctx)));
    if let Err(payload) = result {
        if inner.shutdown.load(Ordering::Relaxed) {
            // Teardown unwinds fibers still parked inside a job; that
            // unwind must pass through untouched.
            panic::resume_unwind(payload);
        }
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "unknown panic payload"
        };
        // A panicking job leaves its counter undecrementable; there is no
        // way to continue without hanging its waiters.
        eprintln!("job panicked: {msg}; aborting");
        std::process::abort();
    }

    inner.counters[counter_index].complete_one(inner);

    #[cfg(feature = "metrics")]
    inner.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
}
