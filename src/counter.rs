//! Fan-in counters and the park/wake handshake.
//!
//! A counter tracks the outstanding jobs of one batch. Workers decrement it
//! as jobs finish; a fiber that wants the batch's completion publishes
//! itself on the counter and parks. Whichever side observes the threshold
//! crossing last performs the wake, and an atomic swap of the published
//! fiber guarantees exactly one resume.
//!
//! Lifetime rules:
//! - A counter is either on its scheduler's freelist (count 0, wake fields
//!   clear) or owned by exactly one batch.
//! - A counter must not return to the freelist while any decrementer is
//!   still examining its wake fields; `inflight` tracks those examinations
//!   and reclaimers spin it down to zero first.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::job_system::Inner;

/// Sentinel for "no fiber published".
pub(crate) const FIBER_NONE: u32 = u32::MAX;

/// Low 31 bits of `val` count outstanding jobs.
const COUNT_MASK: u32 = 0x7fff_ffff;
/// High bit of `val`: the waiter already returned (threshold release), so
/// the decrement that reaches zero reclaims the counter.
const DETACHED: u32 = 0x8000_0000;

/// A cache-line-sized fan-in counter.
#[repr(C, align(64))]
pub(crate) struct Counter {
    val: AtomicU32,
    wake_fiber: AtomicU32,
    wake_target: AtomicU32,
    /// Decrementers currently examining the wake fields.
    inflight: AtomicU32,
    /// Scheduler whose ready queue receives the parked fiber. Set by the
    /// parker; not necessarily the scheduler that owns this counter.
    wake_manager: AtomicPtr<Inner>,
    /// Owning scheduler; where the counter returns on reclamation.
    home: AtomicPtr<Inner>,
    index: u32,
}

const _: () = assert!(std::mem::size_of::<Counter>() == 64);

impl Counter {
    pub(crate) fn new(index: u32) -> Self {
        Counter {
            val: AtomicU32::new(0),
            wake_fiber: AtomicU32::new(FIBER_NONE),
            wake_target: AtomicU32::new(0),
            inflight: AtomicU32::new(0),
            wake_manager: AtomicPtr::new(ptr::null_mut()),
            home: AtomicPtr::new(ptr::null_mut()),
            index,
        }
    }

    pub(crate) fn set_home(&self, home: *const Inner) {
        self.home.store(home as *mut Inner, Ordering::Relaxed);
    }

    /// Number of jobs in the batch that have not finished yet.
    pub(crate) fn outstanding(&self) -> u32 {
        self.val.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Arms the counter for a fresh batch of `count` jobs. Called with the
    /// counter freshly popped from the freelist, before any job is queued.
    pub(crate) fn activate(&self, count: u32) {
        debug_assert!(count <= COUNT_MASK, "batch too large for counter");
        self.wake_fiber.store(FIBER_NONE, Ordering::Relaxed);
        self.wake_manager.store(ptr::null_mut(), Ordering::Relaxed);
        self.wake_target.store(0, Ordering::Relaxed);
        self.val.store(count, Ordering::Release);
    }

    /// Records one finished job and wakes the published fiber when the
    /// outstanding count crosses its target.
    pub(crate) fn complete_one(&self, origin: &Inner) {
        self.inflight.fetch_add(1, Ordering::Relaxed);

        let old = self.val.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old & COUNT_MASK > 0, "counter underflow");
        let new = old.wrapping_sub(1);
        let count = new & COUNT_MASK;

        // Paired with the fence in the parker's wait path: one side must
        // observe the other, or the decrement and the publication could
        // miss each other and strand the parked fiber.
        std::sync::atomic::fence(Ordering::SeqCst);

        let manager = self.wake_manager.load(Ordering::Acquire);
        if !manager.is_null() && count <= self.wake_target.load(Ordering::Relaxed) {
            let fiber = self.wake_fiber.swap(FIBER_NONE, Ordering::AcqRel);
            if fiber != FIBER_NONE {
                // SAFETY: a scheduler with a fiber parked on this counter is
                // kept alive by that fiber's pending wait.
                let wake = unsafe { &*manager };
                wake.enqueue_ready(fiber, origin);
            }
        }

        self.inflight.fetch_sub(1, Ordering::Release);

        if count == 0 && new & DETACHED != 0 {
            self.release();
        }
    }

    /// Publishes `fiber` as the parked waiter. Field order matters: a
    /// decrementer that reads a non-null manager must then see the fiber
    /// and target.
    pub(crate) fn begin_wait(&self, fiber: u32, target: u32, manager: *const Inner) {
        self.wake_target.store(target, Ordering::Relaxed);
        self.wake_fiber.store(fiber, Ordering::Release);
        self.wake_manager.store(manager as *mut Inner, Ordering::Release);
    }

    /// Withdraws a publication made by `begin_wait`. Returns `true` if the
    /// publication was still ours, i.e. no decrementer consumed it; on
    /// `false` the caller must park, because a wake is already on its way.
    pub(crate) fn cancel_wait(&self, fiber: u32) -> bool {
        if self
            .wake_fiber
            .compare_exchange(fiber, FIBER_NONE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.wake_manager.store(ptr::null_mut(), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Settles the counter after a completed wait. Reclaims it immediately
    /// when the batch is fully done; otherwise flags it detached and leaves
    /// reclamation to the decrement that reaches zero. Both sides act on
    /// the same atomic, so exactly one reclaims.
    pub(crate) fn finish_wait(&self) {
        if self.outstanding() == 0 {
            self.release();
            return;
        }
        let old = self.val.fetch_or(DETACHED, Ordering::AcqRel);
        if old & COUNT_MASK == 0 {
            self.release();
        }
    }

    /// Returns the counter to its home freelist.
    fn release(&self) {
        while self.inflight.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        self.wake_fiber.store(FIBER_NONE, Ordering::Relaxed);
        self.wake_manager.store(ptr::null_mut(), Ordering::Relaxed);
        self.wake_target.store(0, Ordering::Relaxed);
        self.val.store(0, Ordering::Relaxed);

        // SAFETY: the home pointer is stamped at startup and the owning
        // scheduler outlives all use of its counters.
        let home = unsafe { &*self.home.load(Ordering::Relaxed) };
        home.release_counter(self.index);
    }
}
