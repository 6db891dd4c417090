//! Integration tests for the fiber-based scheduler.

use crate::{Job, JobContext, JobSystem, JobSystemDesc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn small_desc(num_workers: usize) -> JobSystemDesc {
    JobSystemDesc {
        num_workers,
        num_fibers: num_workers * 8,
        tasks_per_worker: 256,
        fiber_stack_size: 256 * 1024,
        affinitize: false,
    }
}

fn add_one(_ctx: &JobContext, param: usize) {
    let target = unsafe { &*(param as *const AtomicUsize) };
    target.fetch_add(1, Ordering::SeqCst);
}

fn store_42(_ctx: &JobContext, param: usize) {
    let target = unsafe { &*(param as *const AtomicUsize) };
    target.store(42, Ordering::SeqCst);
}

#[test]
fn basic_job_execution() {
    let scheduler = JobSystem::new(small_desc(2));
    let value = AtomicUsize::new(0);

    let handle = scheduler.run_jobs(&[Job::new(store_42, &value as *const _ as usize)]);
    scheduler.wait_for_counter(handle, 0);

    assert_eq!(value.load(Ordering::SeqCst), 42);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn parallel_job_execution() {
    let scheduler = JobSystem::new(small_desc(4));
    let hits = AtomicUsize::new(0);

    let jobs: Vec<Job> = (0..100)
        .map(|_| Job::new(add_one, &hits as *const _ as usize))
        .collect();
    let handle = scheduler.run_jobs(&jobs);
    scheduler.wait_for_counter(handle, 0);

    assert_eq!(hits.load(Ordering::SeqCst), 100);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn handle_reports_completion() {
    let scheduler = JobSystem::new(small_desc(2));

    fn wait_for_flag(_ctx: &JobContext, param: usize) {
        let flag = unsafe { &*(param as *const AtomicBool) };
        while !flag.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let flag = AtomicBool::new(false);
    let handle = scheduler.run_jobs(&[Job::new(wait_for_flag, &flag as *const _ as usize)]);

    assert!(!handle.is_complete());
    flag.store(true, Ordering::SeqCst);

    scheduler.wait_for_counter(handle, 0);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn worker_index_is_in_range() {
    struct Probe {
        hits: AtomicUsize,
        num_workers: usize,
    }

    fn check_index(ctx: &JobContext, param: usize) {
        let probe = unsafe { &*(param as *const Probe) };
        assert!(ctx.worker_index() < probe.num_workers);
        probe.hits.fetch_add(1, Ordering::SeqCst);
    }

    let scheduler = JobSystem::new(small_desc(4));
    let probe = Probe {
        hits: AtomicUsize::new(0),
        num_workers: scheduler.num_workers(),
    };

    let jobs: Vec<Job> = (0..64)
        .map(|_| Job::new(check_index, &probe as *const _ as usize))
        .collect();
    let handle = scheduler.run_jobs(&jobs);
    scheduler.wait_for_counter(handle, 0);

    assert_eq!(probe.hits.load(Ordering::SeqCst), 64);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn yield_with_no_ready_fibers_is_noop() {
    fn yields_a_lot(ctx: &JobContext, param: usize) {
        for _ in 0..5 {
            ctx.yield_now();
        }
        let target = unsafe { &*(param as *const AtomicUsize) };
        target.fetch_add(1, Ordering::SeqCst);
    }

    let scheduler = JobSystem::new(small_desc(2));
    let hits = AtomicUsize::new(0);

    let jobs: Vec<Job> = (0..8)
        .map(|_| Job::new(yields_a_lot, &hits as *const _ as usize))
        .collect();
    let handle = scheduler.run_jobs(&jobs);
    scheduler.wait_for_counter(handle, 0);

    assert_eq!(hits.load(Ordering::SeqCst), 8);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn nested_submission_from_inside_a_job() {
    struct Nest {
        leaves: AtomicUsize,
    }

    fn leaf(_ctx: &JobContext, param: usize) {
        let nest = unsafe { &*(param as *const Nest) };
        nest.leaves.fetch_add(1, Ordering::SeqCst);
    }

    fn parent(ctx: &JobContext, param: usize) {
        let jobs = [Job::new(leaf, param); 5];
        let handle = ctx.run_jobs(&jobs);
        ctx.wait_for_counter(handle, 0);
        // Children are done before the parent finishes.
        let nest = unsafe { &*(param as *const Nest) };
        assert!(nest.leaves.load(Ordering::SeqCst) >= 5);
    }

    let scheduler = JobSystem::new(small_desc(2));
    let nest = Nest {
        leaves: AtomicUsize::new(0),
    };

    let handle = scheduler.run_jobs(&[Job::new(parent, &nest as *const _ as usize)]);
    scheduler.wait_for_counter(handle, 0);

    assert_eq!(nest.leaves.load(Ordering::SeqCst), 5);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn sequential_batches_recycle_counters() {
    // More batches than the counter pool holds; hangs if recycling leaks.
    let scheduler = JobSystem::new(JobSystemDesc {
        num_workers: 2,
        num_fibers: 16,
        tasks_per_worker: 4,
        fiber_stack_size: 256 * 1024,
        affinitize: false,
    });
    let hits = AtomicUsize::new(0);

    let rounds = 100;
    for _ in 0..rounds {
        let handle = scheduler.run_jobs(&[Job::new(add_one, &hits as *const _ as usize)]);
        scheduler.wait_for_counter(handle, 0);
    }

    assert_eq!(hits.load(Ordering::SeqCst), rounds);
    scheduler.shutdown().expect("shutdown failed");
}
