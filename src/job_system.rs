//! The scheduler: creation, submission, waiting and teardown.
//!
//! `JobSystem` owns a fixed pool of worker threads and a fixed pool of
//! fibers. All allocation happens in [`JobSystem::new`]; submitting and
//! waiting in steady state never touches the heap. Capacity exhaustion
//! (task queues, fiber pool, counter pool) is a sizing bug and panics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::counter::Counter;
use crate::fiber::{self, FiberId, FiberSlot};
use crate::job::{Job, JobHandle, QueuedTask, SendPtr};
use crate::light_mutex::LightMutex;
use crate::mpmc::MpmcQueue;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Sizing and placement parameters for a [`JobSystem`].
#[derive(Clone, Debug)]
pub struct JobSystemDesc {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Number of pre-allocated fibers. Must exceed `num_workers` by at
    /// least the expected peak of simultaneously parked waits.
    pub num_fibers: usize,
    /// Capacity of each worker's inbound task queue. Also sizes the counter
    /// pool at `num_workers * tasks_per_worker`.
    pub tasks_per_worker: usize,
    /// Stack size of each fiber, in bytes.
    pub fiber_stack_size: usize,
    /// Pin worker `i` to logical CPU `i`.
    pub affinitize: bool,
}

impl Default for JobSystemDesc {
    fn default() -> Self {
        let num_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        JobSystemDesc {
            num_workers,
            num_fibers: num_workers * 8,
            tasks_per_worker: 256,
            fiber_stack_size: 512 * 1024,
            affinitize: false,
        }
    }
}

/// Shared scheduler state. Everything workers, fibers and counters touch
/// lives here, behind one `Arc` whose address is stable for the scheduler's
/// lifetime.
pub(crate) struct Inner {
    /// Per-worker inbound task queues.
    pub(crate) queued_tasks: Box<[MpmcQueue<QueuedTask>]>,
    /// Per-worker parking gates.
    pub(crate) gates: Box<[LightMutex]>,
    /// Fibers whose awaited counter crossed its target, ready to resume.
    pub(crate) waiting_fibers: MpmcQueue<FiberId>,
    /// Freelist of fibers not bound to any worker.
    pub(crate) open_fibers: MpmcQueue<FiberId>,
    /// Freelist of counters, by index.
    pub(crate) open_counters: MpmcQueue<u32>,
    pub(crate) counters: Box<[Counter]>,
    pub(crate) fibers: Box<[FiberSlot]>,
    pub(crate) num_workers: usize,
    pub(crate) shutdown: AtomicBool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Inner {
    pub(crate) fn run_jobs(&self, jobs: &[Job]) -> JobHandle {
        let index = self
            .open_counters
            .try_pop()
            .expect("counter pool exhausted");
        let counter = &self.counters[index as usize];
        counter.activate(jobs.len() as u32);

        for (i, job) in jobs.iter().enumerate() {
            let worker = i % self.num_workers;
            let queued = QueuedTask {
                job: *job,
                counter_index: index,
            };
            if self.queued_tasks[worker].try_push(queued).is_err() {
                panic!("task queue of worker {worker} overflowed");
            }
        }

        // Release every worker whose queue received a task. The pair is
        // idempotent: it opens the gate whether or not a worker sleeps on it.
        for worker in 0..jobs.len().min(self.num_workers) {
            let gate = &self.gates[worker];
            gate.try_lock();
            gate.unlock();
        }

        #[cfg(feature = "metrics")]
        self.metrics
            .jobs_submitted
            .fetch_add(jobs.len() as u64, Ordering::Relaxed);

        JobHandle::new(counter)
    }

    /// Hands a woken fiber to the scheduler that owns it. When that is not
    /// the scheduler whose worker performed the wake, its workers may all be
    /// asleep, so their gates are nudged.
    pub(crate) fn enqueue_ready(&self, fiber: FiberId, origin: &Inner) {
        if self.waiting_fibers.try_push(fiber).is_err() {
            panic!("ready fiber queue full");
        }
        if !std::ptr::eq(self, origin) {
            for gate in self.gates.iter() {
                gate.try_lock();
                gate.unlock();
            }
        }
    }

    pub(crate) fn release_counter(&self, index: u32) {
        if self.open_counters.try_push(index).is_err() {
            panic!("counter freelist full");
        }
        #[cfg(feature = "metrics")]
        self.metrics
            .counters_recycled
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Parks the calling thread on `worker`'s gate until a producer opens
    /// it. Arms the gate first, then rechecks for work and shutdown:
    /// producers publish before unlocking, so a publication that races the
    /// recheck finds the gate armed and opens it.
    pub(crate) fn park_idle(&self, worker: usize) {
        let gate = &self.gates[worker];
        gate.try_lock();

        if self.shutdown.load(Ordering::Relaxed)
            || self.queued_tasks[worker].approx_size() != 0
            || self.waiting_fibers.approx_size() != 0
        {
            gate.unlock();
            return;
        }

        #[cfg(feature = "metrics")]
        self.metrics.worker_parks.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "trace")]
        let _span = crate::trace::park_span(worker);

        gate.lock();
        gate.unlock();
    }
}

/// A fiber-based job scheduler over a fixed worker pool.
///
/// Jobs are submitted in batches; each batch gets a counter that its jobs
/// decrement, and a [`JobHandle`] to wait on. Jobs may submit nested
/// batches and wait on them from inside a fiber without blocking their
/// worker thread.
pub struct JobSystem {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl JobSystem {
    /// Creates a scheduler: allocates every queue, counter and fiber stack,
    /// then launches the worker threads.
    ///
    /// # Panics
    ///
    /// Panics if the description is degenerate or a thread or fiber stack
    /// cannot be created.
    pub fn new(desc: JobSystemDesc) -> Self {
        let num_workers = desc.num_workers;
        let num_fibers = desc.num_fibers;
        let num_counters = num_workers * desc.tasks_per_worker;

        assert!(num_workers > 0, "need at least one worker");
        assert!(
            num_fibers > num_workers,
            "need more fibers than workers: every worker binds one and parked waits hold more"
        );
        assert!(desc.tasks_per_worker > 0, "need task queue capacity");
        assert!(num_fibers < u32::MAX as usize, "fiber count out of range");

        let inner = Arc::new(Inner {
            queued_tasks: (0..num_workers)
                .map(|_| MpmcQueue::new(desc.tasks_per_worker))
                .collect(),
            gates: (0..num_workers).map(|_| LightMutex::new_locked()).collect(),
            waiting_fibers: MpmcQueue::new(num_fibers),
            open_fibers: MpmcQueue::new(num_fibers),
            open_counters: MpmcQueue::new(num_counters),
            counters: (0..num_counters).map(|i| Counter::new(i as u32)).collect(),
            fibers: (0..num_fibers).map(|_| FiberSlot::new()).collect(),
            num_workers,
            shutdown: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        });

        let inner_ptr = SendPtr(Arc::as_ptr(&inner));

        for counter in inner.counters.iter() {
            counter.set_home(inner_ptr.0);
        }
        for index in 0..num_counters as u32 {
            inner
                .open_counters
                .try_push(index)
                .expect("counter freelist init overflow");
        }
        for id in 0..num_fibers as FiberId {
            inner.fibers[id as usize].put(fiber::spawn_fiber(
                inner_ptr,
                id,
                desc.fiber_stack_size,
            ));
            inner
                .open_fibers
                .try_push(id)
                .expect("fiber freelist init overflow");
        }

        let core_ids = if desc.affinitize {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        // Workers launch last, once every pool is populated.
        let workers = (0..num_workers)
            .map(|index| {
                let params = crate::worker::WorkerParams {
                    inner: Arc::clone(&inner),
                    index,
                    core_id: core_ids.get(index).copied(),
                };
                thread::Builder::new()
                    .name(format!("weft-worker-{index}"))
                    .spawn(move || crate::worker::run(params))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        JobSystem { inner, workers }
    }

    /// Submits a batch of jobs, one counter tracking all of them.
    ///
    /// Jobs are distributed round-robin over the worker queues and sleeping
    /// workers are released. An empty batch yields an already-complete
    /// handle.
    ///
    /// # Panics
    ///
    /// Panics when a worker queue or the counter pool is exhausted;
    /// capacities are fixed at creation and backpressure is the caller's
    /// responsibility.
    pub fn run_jobs(&self, jobs: &[Job]) -> JobHandle {
        self.inner.run_jobs(jobs)
    }

    /// Blocks the calling thread until at most `target` jobs of the batch
    /// remain, then recycles the batch's counter.
    ///
    /// This is the entry point for threads outside the scheduler; it waits
    /// by polling with exponential backoff. Jobs waiting from inside a
    /// fiber must use [`JobContext::wait_for_counter`] instead, which parks
    /// the fiber and lends the worker to other work.
    ///
    /// [`JobContext::wait_for_counter`]: crate::context::JobContext::wait_for_counter
    pub fn wait_for_counter(&self, handle: JobHandle, target: u32) {
        let counter = handle.counter();

        let mut backoff_us = 1u64;
        const MAX_BACKOFF_US: u64 = 1000;

        while counter.outstanding() > target {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }

        counter.finish_wait();
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// A snapshot of scheduler activity since creation.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stops the workers and joins them. Fibers drain the tasks already in
    /// their queues before observing the flag; fibers parked on
    /// never-completed counters are unwound with the pool.
    ///
    /// Returns `Err` with the number of worker threads that panicked.
    pub fn shutdown(mut self) -> Result<(), usize> {
        self.halt()
    }

    fn halt(&mut self) -> Result<(), usize> {
        self.inner.shutdown.store(true, Ordering::Relaxed);

        // Open every gate so sleeping workers observe the flag.
        for gate in self.inner.gates.iter() {
            gate.try_lock();
            gate.unlock();
        }

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            eprintln!("{panicked} worker thread(s) panicked");
            Err(panicked)
        } else {
            Ok(())
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.halt();
        }
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        JobSystem::new(JobSystemDesc::default())
    }
}
