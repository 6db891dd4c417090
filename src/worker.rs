//! Worker threads: the switch hubs that drive fibers.
//!
//! Each worker owns an index into the scheduler's queue and gate arrays.
//! It blocks on its parking gate while idle, then picks a free fiber and
//! resumes it. From then on the thread bounces between fibers as they
//! suspend with directives; control only returns to the outer loop at
//! shutdown.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use corosensei::CoroutineResult;

use crate::fiber::{FiberId, Suspend};
use crate::job_system::Inner;

pub(crate) struct WorkerParams {
    pub(crate) inner: Arc<Inner>,
    pub(crate) index: usize,
    pub(crate) core_id: Option<core_affinity::CoreId>,
}

/// Thread entry of a worker.
pub(crate) fn run(params: WorkerParams) {
    let WorkerParams {
        inner,
        index,
        core_id,
    } = params;

    // Pin to a fixed core when the scheduler was created with affinity.
    if let Some(core_id) = core_id {
        core_affinity::set_for_current(core_id);
    }

    #[cfg(feature = "trace")]
    let _flush = crate::trace::FlushGuard;

    let inner = &*inner;

    while !inner.shutdown.load(Ordering::Relaxed) {
        // Gates start locked, so a fresh worker sleeps here until the first
        // submission opens its gate.
        let gate = &inner.gates[index];
        gate.lock();
        gate.unlock();

        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let first = inner
            .open_fibers
            .try_pop()
            .expect("fiber pool exhausted: no free fiber for worker");
        drive(inner, index, first);
    }
}

/// Resumes fibers until one of them observes shutdown and returns.
fn drive(inner: &Inner, worker: usize, mut current: FiberId) {
    loop {
        let mut fiber = inner.fibers[current as usize].take();

        match fiber.resume(worker) {
            CoroutineResult::Yield(Suspend::YieldTo(next)) => {
                // Store before publishing on the freelist so a claimant
                // never sees a half-suspended coroutine.
                inner.fibers[current as usize].put(fiber);
                if inner.open_fibers.try_push(current).is_err() {
                    panic!("open fiber queue full");
                }
                current = next;
            }
            CoroutineResult::Yield(Suspend::Parked) => {
                inner.fibers[current as usize].put(fiber);
                #[cfg(feature = "metrics")]
                inner.metrics.fiber_parks.fetch_add(1, Ordering::Relaxed);
                // The parked fiber's id was published to a counter, not a
                // queue; keep this thread busy with a fresh fiber.
                current = inner
                    .open_fibers
                    .try_pop()
                    .expect("fiber pool exhausted: too many parked waits");
            }
            CoroutineResult::Return(()) => {
                inner.fibers[current as usize].put(fiber);
                return;
            }
        }
    }
}
