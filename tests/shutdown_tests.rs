//! Teardown: idle shutdown, shutdown after unwaited work, drop semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use weft::{Job, JobContext, JobSystem, JobSystemDesc};

fn desc(num_workers: usize) -> JobSystemDesc {
    JobSystemDesc {
        num_workers,
        num_fibers: num_workers * 8,
        tasks_per_worker: 128,
        fiber_stack_size: 256 * 1024,
        affinitize: false,
    }
}

fn add_one(_ctx: &JobContext, param: usize) {
    let target = unsafe { &*(param as *const AtomicUsize) };
    target.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn shutdown_with_idle_workers() {
    let start = Instant::now();
    let scheduler = JobSystem::new(desc(4));
    scheduler.shutdown().expect("shutdown failed");
    // Workers that never saw work must terminate promptly.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn drop_without_explicit_shutdown() {
    let scheduler = JobSystem::new(desc(2));
    let hits = AtomicUsize::new(0);

    let handle = scheduler.run_jobs(&[Job::new(add_one, &hits as *const _ as usize)]);
    scheduler.wait_for_counter(handle, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    drop(scheduler);
}

#[test]
fn shutdown_after_unwaited_batch_completes() {
    let scheduler = JobSystem::new(desc(4));
    let hits = AtomicUsize::new(0);

    let jobs: Vec<Job> = (0..100)
        .map(|_| Job::new(add_one, &hits as *const _ as usize))
        .collect();
    let handle = scheduler.run_jobs(&jobs);

    // Never wait on the handle; observe completion through a side channel
    // instead, then tear down.
    drop(handle);
    while hits.load(Ordering::SeqCst) < 100 {
        thread::sleep(Duration::from_millis(1));
    }

    scheduler.shutdown().expect("shutdown failed");
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn repeated_create_destroy() {
    for _ in 0..10 {
        let scheduler = JobSystem::new(desc(2));
        let hits = AtomicUsize::new(0);
        let handle = scheduler.run_jobs(&[Job::new(add_one, &hits as *const _ as usize)]);
        scheduler.wait_for_counter(handle, 0);
        scheduler.shutdown().expect("shutdown failed");
    }
}
