//! Futex-backed light mutex used as a worker parking gate.
//!
//! Three-state word mutex (unlocked / locked / locked with sleepers) in the
//! classic futex construction. The scheduler does not use it for mutual
//! exclusion: a worker locks and unlocks its own gate to park, and producers
//! `try_lock` + `unlock` the gate to release the sleeper. Waking uses
//! wake-all because the number of sleepers on one gate is bounded by one
//! worker plus transient producers.

use std::sync::atomic::{AtomicU32, Ordering};

use atomic_wait::{wait, wake_all};

const UNLOCKED: u32 = 0;
const LOCKED_NO_WAITING: u32 = 1;
const LOCKED_THREADS_WAITING: u32 = 2;

/// A 32-bit word mutex that sleeps in the kernel under contention.
pub struct LightMutex {
    state: AtomicU32,
}

impl LightMutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        LightMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Creates a mutex that starts out locked, so the first `lock` call
    /// blocks until some other thread unlocks it.
    pub const fn new_locked() -> Self {
        LightMutex {
            state: AtomicU32::new(LOCKED_NO_WAITING),
        }
    }

    fn compare_exchange(&self, expected: u32, desired: u32) -> u32 {
        match self
            .state
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(previous) => previous,
            Err(previous) => previous,
        }
    }

    /// Acquires the mutex without blocking. Returns `true` on success.
    pub fn try_lock(&self) -> bool {
        self.compare_exchange(UNLOCKED, LOCKED_NO_WAITING) == UNLOCKED
    }

    /// Acquires the mutex, sleeping in the kernel while it is held elsewhere.
    pub fn lock(&self) {
        let mut old = self.compare_exchange(UNLOCKED, LOCKED_NO_WAITING);
        if old == UNLOCKED {
            return;
        }

        loop {
            // Advertise a sleeper before waiting so unlock knows to wake.
            // Spurious wakeups fall through to the re-acquire CAS below.
            if old == LOCKED_THREADS_WAITING
                || self.compare_exchange(LOCKED_NO_WAITING, LOCKED_THREADS_WAITING) != UNLOCKED
            {
                wait(&self.state, LOCKED_THREADS_WAITING);
            }

            old = self.compare_exchange(UNLOCKED, LOCKED_THREADS_WAITING);
            if old == UNLOCKED {
                return;
            }
        }
    }

    /// Releases the mutex, waking every sleeper if there are any.
    ///
    /// Unlocking an already-unlocked mutex is tolerated: the state is driven
    /// back to unlocked and sleepers retry their acquire.
    pub fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::AcqRel) != LOCKED_NO_WAITING {
            self.state.store(UNLOCKED, Ordering::Release);
            wake_all(&self.state);
        }
    }
}

impl Default for LightMutex {
    fn default() -> Self {
        LightMutex::new()
    }
}
