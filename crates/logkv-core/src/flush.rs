//! Flush loop — background drain of the write-back cache into the log
//!
//! A background thread wakes every `flush_interval` and, when the cache
//! holds more than `flush_threshold` records, runs one flush cycle on its
//! target. A failed cycle is logged and retried on the next tick; nothing
//! is evicted from the cache until its record is written and indexed, so
//! a failure never loses data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{LogKvError, LogKvResult};

/// Longest uninterrupted sleep, so shutdown is noticed promptly
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Something the flush loop can drain.
pub trait FlushTarget: Send + Sync + 'static {
    /// Records currently waiting in the cache.
    fn pending(&self) -> usize;

    /// Run one flush cycle; returns the number of records written.
    fn flush_cycle(&self) -> LogKvResult<usize>;
}

/// Point-in-time flush statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Records written to the log since open
    pub total_flushed: u64,
    /// Flush cycles that completed
    pub total_cycles: u64,
    /// Flush cycles that failed and will be retried
    pub failed_cycles: u64,
}

/// Running counters behind `FlushStats`.
#[derive(Debug, Default)]
pub struct FlushCounters {
    total_flushed: AtomicU64,
    total_cycles: AtomicU64,
    failed_cycles: AtomicU64,
}

impl FlushCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a flush cycle completed.
    pub fn record_cycle(&self, flushed: u64) {
        self.total_flushed.fetch_add(flushed, Ordering::Relaxed);
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a flush cycle failed.
    pub fn record_failure(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            total_flushed: self.total_flushed.load(Ordering::Relaxed),
            total_cycles: self.total_cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Run one cycle on `target`, recording the outcome in `counters`.
pub fn run_cycle<T: FlushTarget + ?Sized>(target: &T, counters: &FlushCounters) -> LogKvResult<usize> {
    let started = Instant::now();
    match target.flush_cycle() {
        Ok(flushed) => {
            counters.record_cycle(flushed as u64);
            if flushed > 0 {
                tracing::debug!(flushed, elapsed_us = started.elapsed().as_micros() as u64, "flush cycle complete");
            }
            Ok(flushed)
        }
        Err(e) => {
            counters.record_failure();
            tracing::error!(error = %e, "flush cycle failed; will retry next tick");
            Err(e)
        }
    }
}

/// Handle to a running flush loop.
/// Dropping this handle signals the thread to stop.
pub struct FlushHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushHandle {
    /// Request shutdown and wait for the background thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the flush loop on a background thread.
pub fn start_flush_loop<T: FlushTarget>(
    target: Arc<T>,
    counters: Arc<FlushCounters>,
    interval: Duration,
    threshold: usize,
) -> LogKvResult<FlushHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("logkv-flush".to_string())
        .spawn(move || flush_loop(target, counters, interval, threshold, shutdown_clone))
        .map_err(|e| LogKvError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn flush thread: {}", e),
        })?;

    Ok(FlushHandle { shutdown, thread: Some(thread) })
}

fn flush_loop<T: FlushTarget>(
    target: Arc<T>,
    counters: Arc<FlushCounters>,
    interval: Duration,
    threshold: usize,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let wake_time = Instant::now() + interval;
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= wake_time {
                break;
            }
            thread::sleep((wake_time - now).min(SHUTDOWN_POLL));
        }

        if target.pending() > threshold {
            // Errors are logged inside run_cycle and retried next tick
            let _ = run_cycle(target.as_ref(), &counters);
        }
    }
}
