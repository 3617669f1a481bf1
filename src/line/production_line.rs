//! The production line: N producer threads driving one worker into one pool.
//!
//! Start sequence: open the worker, read its working pool id, cache a weak
//! observer from the registry, cache the total frame count, reset the shared
//! cursor and counters, spawn the producers. Each producer iterates: next
//! index from the cursor → upgrade the observer → acquire a free buffer
//! (100 ms timeout, so the running flag is rechecked under backpressure) →
//! worker fill → submit. Injection-style workers collapse the acquire/fill/
//! submit into a single drive call per frame.
//!
//! Every data-path failure is absorbed: fill failures release the buffer
//! back to the free queue and bump `skipped_frames`; a failed observer
//! upgrade or a pool shutdown ends the thread. Only `start` itself can fail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, registry};
use crate::error::{AcquireError, WorkerError};
use crate::monitor::PerformanceMonitor;
use crate::worker::{STREAM_TOTAL_FRAMES, WorkerConfig, WorkerFacade};

/// Producer-side acquire timeout; bounds how long a stop can go unnoticed.
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Cursor values past this trigger the wrap-around reset.
const CURSOR_OVERFLOW_GUARD: u64 = u64::MAX - (1 << 20);

pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Shared frame-index dispenser.
///
/// `next` hands every producer thread a distinct index. In loop mode indices
/// wrap modulo the total; in bounded mode the dispenser runs dry; against the
/// stream sentinel it counts up forever.
pub(crate) struct FrameCursor {
    next: AtomicU64,
    total: u64,
    looping: bool,
    /// Serializes the overflow reset; never held across a wait.
    reset: Mutex<()>,
}

impl FrameCursor {
    pub(crate) fn new(total: u64, looping: bool) -> Self {
        Self {
            next: AtomicU64::new(0),
            total,
            looping,
            reset: Mutex::new(()),
        }
    }

    pub(crate) fn next(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let raw = self.next.fetch_add(1, Ordering::AcqRel);
        if self.total == STREAM_TOTAL_FRAMES {
            // Live source: monotonically increasing, the worker ignores it.
            return Some(raw);
        }
        if raw < self.total {
            return Some(raw);
        }
        if !self.looping {
            return None;
        }
        if raw >= CURSOR_OVERFLOW_GUARD {
            let _guard = self.reset.lock().unwrap_or_else(|e| e.into_inner());
            if self.next.load(Ordering::Acquire) >= CURSOR_OVERFLOW_GUARD {
                self.next.store(0, Ordering::Release);
            }
        }
        Some(raw % self.total)
    }
}

struct LineShared {
    running: AtomicBool,
    cursor: FrameCursor,
    produced_frames: AtomicU64,
    skipped_frames: AtomicU64,
    worker: Arc<WorkerFacade>,
    pool: Weak<BufferPool>,
    /// True for workers that inject instead of filling provided buffers.
    injection: bool,
    last_error: Mutex<Option<String>>,
    error_callback: Arc<Mutex<Option<ErrorCallback>>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl LineShared {
    fn report_error(&self, message: String) {
        warn!(%message, "production error");
        if let Some(callback) = self
            .error_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            callback(&message);
        }
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

/// Drives `thread_count` producer threads over one worker.
pub struct ProductionLine {
    looping: bool,
    thread_count: usize,
    enable_monitor: bool,
    shared: Option<Arc<LineShared>>,
    threads: Vec<JoinHandle<()>>,
    start_time: Option<Instant>,
    pool_id: u64,
    error_callback: Arc<Mutex<Option<ErrorCallback>>>,
}

impl ProductionLine {
    /// `looping` wraps the frame cursor at the source's end; `thread_count`
    /// is clamped to at least one producer.
    pub fn new(looping: bool, thread_count: usize, enable_monitor: bool) -> Self {
        Self {
            looping,
            thread_count: thread_count.max(1),
            enable_monitor,
            shared: None,
            threads: Vec::new(),
            start_time: None,
            pool_id: 0,
            error_callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the worker described by `config` and spawn the producers.
    ///
    /// Fails — without spawning anything — when the worker cannot open, when
    /// it publishes no working pool, or when the line is already running.
    pub fn start(&mut self, config: &WorkerConfig) -> anyhow::Result<()> {
        if self.is_running() {
            bail!("production line is already running");
        }

        let mut facade = WorkerFacade::new(config.worker_type);
        facade.open(config).context("open worker")?;
        let worker = Arc::new(facade);

        let pool_id = worker.output_pool_id();
        if pool_id == 0 {
            bail!("worker '{}' published no working pool", worker.worker_type());
        }
        let pool = registry().get_pool(pool_id);
        if pool.upgrade().is_none() {
            bail!("working pool {pool_id} is not registered");
        }
        let total_frames = worker.total_frames();

        let monitor = self.enable_monitor.then(|| {
            let monitor = Arc::new(PerformanceMonitor::new());
            monitor.start();
            monitor
        });

        let shared = Arc::new(LineShared {
            running: AtomicBool::new(true),
            cursor: FrameCursor::new(total_frames, self.looping),
            produced_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
            worker: Arc::clone(&worker),
            pool,
            injection: !worker.needs_external_buffer(),
            last_error: Mutex::new(None),
            error_callback: Arc::clone(&self.error_callback),
            monitor,
        });

        let mut threads = Vec::with_capacity(self.thread_count);
        for thread_id in 0..self.thread_count {
            let shared = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("frameline-prod-{thread_id}"))
                    .spawn(move || producer_loop(&shared, thread_id))
                    .context("spawn producer thread")?,
            );
        }

        info!(
            worker = worker.worker_type(),
            pool_id,
            total_frames,
            threads = self.thread_count,
            looping = self.looping,
            "production line started"
        );
        self.shared = Some(shared);
        self.threads = threads;
        self.start_time = Some(Instant::now());
        self.pool_id = pool_id;
        Ok(())
    }

    /// Stop producing: clear the running flag, shut the pool down to wake
    /// blocked acquirers, join the producers, close the worker.
    pub fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.running.store(false, Ordering::Release);
        if let Some(pool) = shared.pool.upgrade() {
            pool.shutdown();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("producer thread panicked");
            }
        }
        shared.worker.close();
        if let Some(monitor) = &shared.monitor {
            monitor.print_statistics();
            monitor.stop();
        }
        info!(
            produced = shared.produced_frames.load(Ordering::Acquire),
            skipped = shared.skipped_frames.load(Ordering::Acquire),
            "production line stopped"
        );
        // Keep counters readable after stop.
        self.shared = Some(shared);
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
            && !self.threads.is_empty()
    }

    pub fn produced_frames(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.produced_frames.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn skipped_frames(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.skipped_frames.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Mean produced frames per second since `start`.
    pub fn average_fps(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.produced_frames() as f64 / elapsed
    }

    /// Registry id of the pool consumers should read from.
    pub fn working_pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self
            .error_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.as_ref().and_then(|s| {
            s.last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    pub fn print_stats(&self) {
        info!(
            produced = self.produced_frames(),
            skipped = self.skipped_frames(),
            fps = format_args!("{:.1}", self.average_fps()),
            pool_id = self.pool_id,
            running = self.is_running(),
            "production line stats"
        );
    }
}

impl Drop for ProductionLine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn producer_loop(shared: &LineShared, thread_id: usize) {
    debug!(thread_id, injection = shared.injection, "producer up");
    loop {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let Some(index) = shared.cursor.next() else {
            debug!(thread_id, "cursor exhausted");
            break;
        };

        if shared.injection {
            drive_injection(shared, index);
            continue;
        }

        let Some(pool) = shared.pool.upgrade() else {
            debug!(thread_id, "pool gone");
            break;
        };
        let buffer = match pool.acquire_free(true, Some(ACQUIRE_TIMEOUT)) {
            Ok(buffer) => buffer,
            // Timeout: drop this index and loop to recheck the running flag.
            Err(AcquireError::TimedOut) => continue,
            Err(AcquireError::ShutDown) | Err(AcquireError::WouldBlock) => break,
        };

        if let Some(monitor) = &shared.monitor {
            monitor.begin_timing("fill");
        }
        let result = shared.worker.fill_buffer(index, Some(&buffer));
        if let Some(monitor) = &shared.monitor {
            monitor.end_timing("fill");
        }

        match result {
            Ok(()) => match pool.submit_filled(&buffer) {
                Ok(()) => {
                    shared.produced_frames.fetch_add(1, Ordering::AcqRel);
                    if let Some(monitor) = &shared.monitor {
                        monitor.record("produce");
                    }
                }
                Err(e) => {
                    shared.skipped_frames.fetch_add(1, Ordering::AcqRel);
                    shared.report_error(format!("submit of frame {index} failed: {e}"));
                }
            },
            Err(e) => {
                let _ = pool.release_free(&buffer);
                shared.skipped_frames.fetch_add(1, Ordering::AcqRel);
                shared.report_error(format!("fill of frame {index} failed: {e}"));
            }
        }
    }
    debug!(thread_id, "producer down");
}

/// Injection-style production: one drive call per frame, no pre-acquire.
fn drive_injection(shared: &LineShared, index: u64) {
    if let Some(monitor) = &shared.monitor {
        monitor.begin_timing("fill");
    }
    let result = shared.worker.fill_buffer(index, None);
    if let Some(monitor) = &shared.monitor {
        monitor.end_timing("fill");
    }
    match result {
        Ok(()) => {
            shared.produced_frames.fetch_add(1, Ordering::AcqRel);
            if let Some(monitor) = &shared.monitor {
                monitor.record("produce");
            }
        }
        // Backpressure and starvation are flow control, not faults.
        Err(WorkerError::Backpressure { .. }) | Err(WorkerError::Starved) => {
            shared.skipped_frames.fetch_add(1, Ordering::AcqRel);
        }
        Err(e) => {
            shared.skipped_frames.fetch_add(1, Ordering::AcqRel);
            shared.report_error(format!("injection of frame {index} failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn bounded_cursor_is_monotonic_and_exact() {
        let cursor = FrameCursor::new(5, false);
        let mut seen = Vec::new();
        while let Some(i) = cursor.next() {
            seen.push(i);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn looped_cursor_covers_each_index_k_times() {
        let n = 7u64;
        let k = 4u64;
        let cursor = FrameCursor::new(n, true);
        let mut counts: HashMap<u64, u64> = HashMap::new();
        for _ in 0..n * k {
            let i = cursor.next().expect("loop cursor never runs dry");
            *counts.entry(i).or_default() += 1;
        }
        for i in 0..n {
            assert_eq!(counts.get(&i), Some(&k), "index {i}");
        }
    }

    #[test]
    fn stream_cursor_counts_up_without_wrapping() {
        let cursor = FrameCursor::new(STREAM_TOTAL_FRAMES, false);
        assert_eq!(cursor.next(), Some(0));
        assert_eq!(cursor.next(), Some(1));
        assert_eq!(cursor.next(), Some(2));
    }

    #[test]
    fn empty_source_yields_nothing() {
        let cursor = FrameCursor::new(0, true);
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn overflow_guard_resets_the_cursor() {
        let cursor = FrameCursor::new(10, true);
        cursor.next.store(CURSOR_OVERFLOW_GUARD + 3, Ordering::Release);
        let value = cursor.next().expect("loop cursor never runs dry");
        assert!(value < 10);
        assert!(cursor.next.load(Ordering::Acquire) < CURSOR_OVERFLOW_GUARD);
    }

    #[test]
    fn concurrent_cursor_hands_out_disjoint_indices() {
        let cursor = Arc::new(FrameCursor::new(1000, false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cursor = Arc::clone(&cursor);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(i) = cursor.next() {
                    got.push(i);
                }
                got
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<u64>>());
    }
}
