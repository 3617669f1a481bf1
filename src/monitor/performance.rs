//! Dynamic performance metrics.
//!
//! Named counters with optional latency accumulation, registered on first
//! use. A production line records `"fill"` timings and `"produce"` counts;
//! anything else can add its own metrics without declaring them anywhere.
//! Reports go through `tracing` on a timer; nothing here sits on the data
//! path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::info;

use super::Timer;
use crate::monitor::TimerId;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MetricData {
    count: u64,
    total_time: Duration,
    timed_samples: u64,
    /// In-flight timing start; one measurement per metric at a time.
    started: Option<Instant>,
}

#[derive(Default)]
struct MonitorState {
    metrics: HashMap<String, MetricData>,
    started_at: Option<Instant>,
    /// Accumulated run time from previous start/pause spans.
    banked: Duration,
}

/// Metric counter with periodic self-reporting.
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    paused: AtomicBool,
    timer: Timer,
    report_task: Mutex<Option<TimerId>>,
    report_interval: Mutex<Duration>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            paused: AtomicBool::new(false),
            timer: Timer::new(),
            report_task: Mutex::new(None),
            report_interval: Mutex::new(DEFAULT_REPORT_INTERVAL),
        }
    }

    /// Begin counting and start the periodic report.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.started_at.is_none() {
                state.started_at = Some(Instant::now());
            }
        }
        self.paused.store(false, Ordering::Release);
        self.timer.start();
        self.arm_report_timer();
    }

    /// Stop counting and reporting. Metric values remain queryable.
    pub fn stop(&self) {
        self.disarm_report_timer();
        self.timer.stop();
        let mut state = self.lock();
        if let Some(started) = state.started_at.take() {
            state.banked += started.elapsed();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Drop every metric and restart the clock.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.metrics.clear();
        state.banked = Duration::ZERO;
        if state.started_at.is_some() {
            state.started_at = Some(Instant::now());
        }
    }

    /// Count one event for `metric`.
    pub fn record(&self, metric: &str) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.lock();
        state.metrics.entry(metric.to_string()).or_default().count += 1;
    }

    /// Start timing one operation for `metric`. A second begin before the
    /// matching end restarts the measurement.
    pub fn begin_timing(&self, metric: &str) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.lock();
        state.metrics.entry(metric.to_string()).or_default().started = Some(Instant::now());
    }

    /// Finish the in-flight timing for `metric`, counting the event and
    /// accumulating its latency.
    pub fn end_timing(&self, metric: &str) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.lock();
        if let Some(data) = state.metrics.get_mut(metric) {
            if let Some(started) = data.started.take() {
                data.total_time += started.elapsed();
                data.timed_samples += 1;
                data.count += 1;
            }
        }
    }

    pub fn count(&self, metric: &str) -> u64 {
        self.lock().metrics.get(metric).map(|m| m.count).unwrap_or(0)
    }

    /// Events per second of `metric` over the monitor's running time.
    pub fn fps(&self, metric: &str) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.count(metric) as f64 / elapsed
    }

    /// Mean latency of the timed samples of `metric`.
    pub fn average_time(&self, metric: &str) -> Duration {
        let state = self.lock();
        match state.metrics.get(metric) {
            Some(m) if m.timed_samples > 0 => m.total_time / m.timed_samples as u32,
            _ => Duration::ZERO,
        }
    }

    /// Total running time (excluding stopped spans).
    pub fn elapsed(&self) -> Duration {
        let state = self.lock();
        state.banked + state.started_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Change the report cadence; re-arms a running report timer.
    pub fn set_report_interval(self: &Arc<Self>, interval: Duration) {
        *self
            .report_interval
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = interval;
        if self.timer.is_running() {
            self.disarm_report_timer();
            self.arm_report_timer();
        }
    }

    /// Log every metric once.
    pub fn print_statistics(&self) {
        let elapsed = self.elapsed().as_secs_f64();
        let state = self.lock();
        for (name, data) in &state.metrics {
            let fps = if elapsed > f64::EPSILON {
                data.count as f64 / elapsed
            } else {
                0.0
            };
            let avg_ms = if data.timed_samples > 0 {
                data.total_time.as_secs_f64() * 1e3 / data.timed_samples as f64
            } else {
                0.0
            };
            info!(
                metric = %name,
                count = data.count,
                fps = format_args!("{fps:.1}"),
                avg_ms = format_args!("{avg_ms:.3}"),
                "performance"
            );
        }
    }

    fn arm_report_timer(self: &Arc<Self>) {
        let mut task = self.report_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let interval = *self
            .report_interval
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let weak = Arc::downgrade(self);
        *task = Some(self.timer.schedule_repeated(interval, move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.print_statistics();
            }
        }));
    }

    fn disarm_report_timer(&self) {
        if let Some(id) = self.report_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.timer.cancel(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_fps() {
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.start();
        for _ in 0..10 {
            monitor.record("produce");
        }
        assert_eq!(monitor.count("produce"), 10);
        assert_eq!(monitor.count("unknown"), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(monitor.fps("produce") > 0.0);
        monitor.stop();
    }

    #[test]
    fn timing_accumulates_latency() {
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.start();
        for _ in 0..3 {
            monitor.begin_timing("fill");
            std::thread::sleep(Duration::from_millis(5));
            monitor.end_timing("fill");
        }
        assert_eq!(monitor.count("fill"), 3);
        assert!(monitor.average_time("fill") >= Duration::from_millis(4));
        monitor.stop();
    }

    #[test]
    fn pause_suppresses_recording() {
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.start();
        monitor.pause();
        monitor.record("produce");
        assert_eq!(monitor.count("produce"), 0);
        monitor.resume();
        monitor.record("produce");
        assert_eq!(monitor.count("produce"), 1);
        monitor.stop();
    }

    #[test]
    fn reset_clears_metrics() {
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.start();
        monitor.record("produce");
        monitor.reset();
        assert_eq!(monitor.count("produce"), 0);
        monitor.stop();
    }

    #[test]
    fn unmatched_end_timing_is_harmless() {
        let monitor = Arc::new(PerformanceMonitor::new());
        monitor.start();
        monitor.end_timing("fill");
        assert_eq!(monitor.count("fill"), 0);
        monitor.stop();
    }
}
