use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use weft::{Job, JobContext, JobSystem, JobSystemDesc};

static SUM: AtomicUsize = AtomicUsize::new(0);
static NESTED_SUM: AtomicUsize = AtomicUsize::new(0);

fn accumulate(_ctx: &JobContext, amount: usize) {
    SUM.fetch_add(amount, Ordering::Relaxed);
}

fn nested_leaf(_ctx: &JobContext, amount: usize) {
    NESTED_SUM.fetch_add(amount, Ordering::Relaxed);
}

fn nested_parent(ctx: &JobContext, fanout: usize) {
    let jobs = [Job::new(nested_leaf, 1); 16];
    let handle = ctx.run_jobs(&jobs[..fanout]);
    ctx.wait_for_counter(handle, 0);
}

fn busy_work(_ctx: &JobContext, iterations: usize) {
    let mut x = 0usize;
    for i in 0..iterations {
        x = x.wrapping_add(i);
    }
    std::hint::black_box(x);
}

fn main() {
    println!("Weft - Fiber-Based Task Scheduler\n");

    // Queue capacity sized so a 1000-job batch fits even on few cores.
    let scheduler = JobSystem::new(JobSystemDesc {
        tasks_per_worker: 1024,
        ..JobSystemDesc::default()
    });
    println!(
        "Initialized scheduler with {} worker threads\n",
        scheduler.num_workers()
    );

    // Example 1: fan-out / fan-in
    println!("Example 1: Fan-out of 1000 jobs");
    let jobs: Vec<Job> = (0..1000).map(|i| Job::new(accumulate, i)).collect();
    let start = Instant::now();
    let handle = scheduler.run_jobs(&jobs);
    scheduler.wait_for_counter(handle, 0);
    let expected: usize = (0..1000).sum();
    println!(
        "  Completed in {:?}, sum {} (expected {})\n",
        start.elapsed(),
        SUM.load(Ordering::Relaxed),
        expected
    );

    // Example 2: nested batches waited on from inside a fiber
    println!("Example 2: Nested submission");
    let parents: Vec<Job> = (0..8).map(|_| Job::new(nested_parent, 16)).collect();
    let handle = scheduler.run_jobs(&parents);
    scheduler.wait_for_counter(handle, 0);
    println!(
        "  8 parents x 16 children = {} leaves ran\n",
        NESTED_SUM.load(Ordering::Relaxed)
    );

    // Example 3: throughput over repeated batches
    println!("Example 3: Throughput");
    let jobs: Vec<Job> = (0..250).map(|_| Job::new(busy_work, 100)).collect();
    let rounds = 40;
    let start = Instant::now();
    for _ in 0..rounds {
        let handle = scheduler.run_jobs(&jobs);
        scheduler.wait_for_counter(handle, 0);
    }
    let elapsed = start.elapsed();
    let total = (rounds * jobs.len()) as f64;
    println!(
        "  Executed {} jobs in {:?} ({:.0} jobs/s)\n",
        total as usize,
        elapsed,
        total / elapsed.as_secs_f64()
    );

    println!("Shutting down...");
    match scheduler.shutdown() {
        Ok(()) => println!("Done!"),
        Err(count) => eprintln!("{count} worker(s) panicked"),
    }
}
