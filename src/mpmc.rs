//! Bounded lock-free multi-producer/multi-consumer queue.
//!
//! Dmitry Vyukov's bounded MPMC queue: a power-of-two ring of slots, each
//! carrying a sequence counter that hands ownership back and forth between
//! producers and consumers. The scheduler uses one instance per worker for
//! inbound tasks, plus three shared instances for the fiber freelist, the
//! ready-fiber queue and the counter freelist.
//!
//! <http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue>

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// One ring slot. Aligned to a cache line so neighbouring slots never share
/// one; the payload must stay small enough that this is not wasteful.
#[repr(align(64))]
struct Slot<T> {
    /// Ownership baton. `sequence == pos` means the slot is free for the
    /// producer whose ticket is `pos`; `sequence == pos + 1` means it holds
    /// data for the consumer whose ticket is `pos`.
    sequence: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded lock-free MPMC queue.
///
/// Capacity is rounded up to the next power of two. `try_push`/`try_pop`
/// never block and never spin unboundedly; a full or empty queue is reported
/// immediately.
pub struct MpmcQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: u32,
    enqueue_pos: CachePadded<AtomicU32>,
    dequeue_pos: CachePadded<AtomicU32>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a queue holding at least `capacity` elements.
    ///
    /// All slot memory is allocated here; the queue never allocates again.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        assert!(
            capacity <= 1 << 30,
            "queue capacity {capacity} exceeds the 32-bit ticket space"
        );

        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicU32::new(i as u32),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        MpmcQueue {
            buffer,
            mask: (capacity - 1) as u32,
            enqueue_pos: CachePadded::new(AtomicU32::new(0)),
            dequeue_pos: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Attempts to enqueue `value`, returning it back if the queue is full.
    ///
    /// The position CAS is relaxed; ownership of the slot transfers through
    /// the acquire load and release store of its sequence counter.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            // Wrapping difference read as signed: positions are free-running
            // u32 tickets, so plain comparison would break at wraparound.
            let dif = seq.wrapping_sub(pos) as i32;

            if dif == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue an element.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let next = pos.wrapping_add(1);
            let dif = seq.wrapping_sub(next) as i32;

            if dif == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Recycle the slot for the producer one lap ahead.
                        slot.sequence
                            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued elements.
    ///
    /// Both positions are read relaxed, so the result can be momentarily
    /// stale under contention. Callers use it for is-there-work heuristics
    /// only, never for memory safety.
    pub fn approx_size(&self) -> u32 {
        let deq = self.dequeue_pos.load(Ordering::Relaxed);
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        enq.wrapping_sub(deq)
    }

    /// The rounded-up capacity of the ring.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<T>() {
            while self.try_pop().is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let queue = MpmcQueue::new(8);
        for i in 0..5 {
            queue.try_push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn rejects_when_full() {
        let queue = MpmcQueue::new(4);
        assert_eq!(queue.capacity(), 4);
        for i in 0..4 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.try_push(99), Err(99));
        assert_eq!(queue.try_pop(), Some(0));
        queue.try_push(99).unwrap();
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let queue = MpmcQueue::<u32>::new(5);
        assert_eq!(queue.capacity(), 8);
        let queue = MpmcQueue::<u32>::new(1);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn single_slot_ring() {
        let queue = MpmcQueue::new(1);
        for lap in 0..10 {
            queue.try_push(lap).unwrap();
            assert_eq!(queue.try_push(lap), Err(lap));
            assert_eq!(queue.try_pop(), Some(lap));
            assert_eq!(queue.try_pop(), None);
        }
    }

    #[test]
    fn approx_size_tracks_occupancy() {
        let queue = MpmcQueue::new(8);
        assert_eq!(queue.approx_size(), 0);
        queue.try_push(1u32).unwrap();
        queue.try_push(2u32).unwrap();
        assert_eq!(queue.approx_size(), 2);
        queue.try_pop().unwrap();
        assert_eq!(queue.approx_size(), 1);
    }

    #[test]
    fn full_queue_reports_nonzero_size() {
        let queue = MpmcQueue::new(4);
        for i in 0..4u32 {
            queue.try_push(i).unwrap();
        }
        assert_eq!(queue.approx_size(), 4);
    }

    #[test]
    fn survives_ticket_wraparound() {
        let queue = MpmcQueue::new(2);
        // Enough laps to exercise the wrapping sequence arithmetic without
        // taking 2^32 iterations; correctness is lap-invariant.
        for i in 0..100_000u32 {
            queue.try_push(i).unwrap();
            assert_eq!(queue.try_pop(), Some(i));
        }
    }

    #[test]
    fn drops_leftover_elements() {
        let queue = MpmcQueue::new(8);
        let value = Arc::new(0u64);
        for _ in 0..4 {
            queue.try_push(Arc::clone(&value)).unwrap();
        }
        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn concurrent_exactly_once_delivery() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 20_000;

        let queue = Arc::new(MpmcQueue::new(1024));
        let consumed = Arc::new(AtomicU64::new(0));
        let sum = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = p as u64 * PER_PRODUCER + i;
                    loop {
                        match queue.try_push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let total = PRODUCERS as u64 * PER_PRODUCER;
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            let sum = Arc::clone(&sum);
            handles.push(thread::spawn(move || {
                while consumed.load(Ordering::Relaxed) < total {
                    if let Some(item) = queue.try_pop() {
                        sum.fetch_add(item, Ordering::Relaxed);
                        consumed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(consumed.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }
}
