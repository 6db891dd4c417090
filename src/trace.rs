//! Scheduling span recorder with chrome://tracing export.
//!
//! Records what each worker thread spends its time on — running jobs or
//! parked on its gate — into fixed-capacity thread-local logs. Logs never
//! grow after their first use; once full, further spans are counted as
//! dropped instead of allocated. Worker threads flush their log into a
//! global registry on exit, and `export_to_file` writes everything as JSON
//! loadable by chrome://tracing or ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

/// Spans per thread. Fixed at first use; overflow is dropped and counted.
const LOG_CAPACITY: usize = 16_384;

/// What a worker was doing during a span.
#[derive(Debug, Clone, Copy)]
pub enum SpanKind {
    /// Executing one job: the fiber that ran it and the counter it
    /// decremented.
    Job { fiber: u32, counter: u32 },
    /// Asleep on the parking gate.
    Park,
}

impl SpanKind {
    fn name(self) -> &'static str {
        match self {
            SpanKind::Job { .. } => "job",
            SpanKind::Park => "park",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    kind: SpanKind,
    worker: usize,
    start_us: u64,
    duration_us: u64,
}

struct ThreadLog {
    spans: Vec<Span>,
    dropped: u64,
}

impl ThreadLog {
    fn new() -> Self {
        ThreadLog {
            spans: Vec::with_capacity(LOG_CAPACITY),
            dropped: 0,
        }
    }

    fn push(&mut self, span: Span) {
        if self.spans.len() < LOG_CAPACITY {
            self.spans.push(span);
        } else {
            self.dropped += 1;
        }
    }
}

thread_local! {
    static THREAD_LOG: RefCell<ThreadLog> = RefCell::new(ThreadLog::new());
}

lazy_static::lazy_static! {
    /// All timestamps are microseconds since the first span of the process.
    static ref CLOCK_BASE: Instant = Instant::now();
    static ref REGISTRY: Mutex<Vec<ThreadLog>> = Mutex::new(Vec::new());
}

/// Opens a job span on the current thread. Closed when the guard drops.
pub fn job_span(worker: usize, fiber: u32, counter: u32) -> SpanGuard {
    SpanGuard::begin(SpanKind::Job { fiber, counter }, worker)
}

/// Opens a park span on the current thread. Closed when the guard drops.
pub fn park_span(worker: usize) -> SpanGuard {
    SpanGuard::begin(SpanKind::Park, worker)
}

/// Moves the current thread's log into the registry. Each worker thread
/// must flush (see [`FlushGuard`]) before the process exports.
pub fn flush_local() {
    THREAD_LOG.with(|log| {
        let mut log = log.borrow_mut();
        if !log.spans.is_empty() || log.dropped > 0 {
            let full = std::mem::replace(&mut *log, ThreadLog::new());
            REGISTRY.lock().unwrap().push(full);
        }
    });
}

/// Writes every flushed span to `path` in Chrome Tracing's object form,
/// one complete event per span with the scheduler details as args.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let registry = REGISTRY.lock().unwrap();
    let dropped: u64 = registry.iter().map(|log| log.dropped).sum();
    if dropped > 0 {
        eprintln!("trace export: {dropped} span(s) dropped by full thread logs");
    }

    write!(writer, "{{\"displayTimeUnit\":\"ms\",\"traceEvents\":[")?;
    let mut first = true;

    for log in registry.iter() {
        for span in &log.spans {
            if !first {
                write!(writer, ",")?;
            }
            first = false;

            write!(
                writer,
                "\n{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}",
                span.kind.name(),
                span.start_us,
                span.duration_us,
                span.worker
            )?;
            if let SpanKind::Job { fiber, counter } = span.kind {
                write!(writer, ",\"args\":{{\"fiber\":{fiber},\"counter\":{counter}}}")?;
            }
            write!(writer, "}}")?;
        }
    }

    write!(writer, "\n]}}\n")?;
    writer.flush()?;

    Ok(())
}

/// An open span; records itself into the thread log when dropped.
pub struct SpanGuard {
    kind: SpanKind,
    worker: usize,
    start: Instant,
}

impl SpanGuard {
    fn begin(kind: SpanKind, worker: usize) -> Self {
        SpanGuard {
            kind,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let start_us = self.start.duration_since(*CLOCK_BASE).as_micros() as u64;
        let duration_us = self.start.elapsed().as_micros() as u64;
        THREAD_LOG.with(|log| {
            log.borrow_mut().push(Span {
                kind: self.kind,
                worker: self.worker,
                start_us,
                duration_us,
            });
        });
    }
}

/// Flushes the owning thread's log when dropped; workers hold one for
/// their whole run so their spans survive thread exit.
pub struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        flush_local();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_caps_and_counts_overflow() {
        let mut log = ThreadLog::new();
        for i in 0..LOG_CAPACITY + 5 {
            log.push(Span {
                kind: SpanKind::Park,
                worker: 0,
                start_us: i as u64,
                duration_us: 1,
            });
        }
        assert_eq!(log.spans.len(), LOG_CAPACITY);
        assert_eq!(log.dropped, 5);
    }

    #[test]
    fn span_kind_names() {
        assert_eq!(SpanKind::Park.name(), "park");
        assert_eq!(SpanKind::Job { fiber: 1, counter: 2 }.name(), "job");
    }
}
