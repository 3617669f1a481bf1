//! Deadline-heap callback timer.
//!
//! One dedicated thread sleeps on a condition variable until the earliest
//! deadline in a binary heap, runs the due callbacks outside the lock, and
//! re-arms repeating tasks. Monotonic clock throughout; wall-clock jumps do
//! not disturb schedules.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

pub type TimerId = u64;
type Callback = Box<dyn FnMut() + Send>;

struct TimerTask {
    id: TimerId,
    deadline: Instant,
    /// `Some` for repeating tasks.
    interval: Option<Duration>,
    callback: Callback,
}

// Heap ordering: earliest deadline first (BinaryHeap is a max-heap, so the
// comparison is reversed).
impl Ord for TimerTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerTask {}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerTask>,
    cancelled: HashSet<TimerId>,
}

struct TimerInner {
    queue: Mutex<TimerQueue>,
    cv: Condvar,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// Periodic and one-shot callback scheduler. Not on the data path.
pub struct Timer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// A stopped timer; call [`Timer::start`] before scheduling.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                queue: Mutex::new(TimerQueue::default()),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the dispatch thread. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("frameline-timer".to_string())
            .spawn(move || Self::dispatch_loop(&inner));
        match handle {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                warn!(error = %e, "timer thread failed to spawn");
            }
        }
    }

    /// Stop the dispatch thread and drop all pending tasks. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut queue = self.lock_queue();
            queue.heap.clear();
            queue.cancelled.clear();
        }
        self.inner.cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }

    /// Run `callback` once after `delay`.
    pub fn schedule_once(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let mut callback = Some(callback);
        self.schedule(delay, None, Box::new(move || {
            if let Some(f) = callback.take() {
                f();
            }
        }))
    }

    /// Run `callback` every `interval`, first firing one interval from now.
    pub fn schedule_repeated(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.schedule(interval, Some(interval), Box::new(callback))
    }

    /// Cancel a pending task. False when the id is unknown or already fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut queue = self.lock_queue();
        if queue.heap.iter().any(|t| t.id == id) {
            queue.cancelled.insert(id);
            drop(queue);
            self.inner.cv.notify_all();
            true
        } else {
            false
        }
    }

    /// Cancel every pending task.
    pub fn cancel_all(&self) {
        let mut queue = self.lock_queue();
        let ids: Vec<TimerId> = queue.heap.iter().map(|t| t.id).collect();
        queue.cancelled.extend(ids);
        drop(queue);
        self.inner.cv.notify_all();
    }

    /// Number of scheduled, not-yet-cancelled tasks.
    pub fn pending_count(&self) -> usize {
        let queue = self.lock_queue();
        queue
            .heap
            .iter()
            .filter(|t| !queue.cancelled.contains(&t.id))
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn schedule(&self, delay: Duration, interval: Option<Duration>, callback: Callback) -> TimerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.lock_queue();
            queue.heap.push(TimerTask {
                id,
                deadline: Instant::now() + delay,
                interval,
                callback,
            });
        }
        self.inner.cv.notify_all();
        id
    }

    fn dispatch_loop(inner: &TimerInner) {
        let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if !inner.running.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let next_deadline = queue.heap.peek().map(|task| task.deadline);
            match next_deadline {
                None => {
                    queue = inner.cv.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) if deadline > now => {
                    let (guard, _) = inner
                        .cv
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    queue = guard;
                }
                Some(_) => {
                    let Some(mut task) = queue.heap.pop() else {
                        continue;
                    };
                    if queue.cancelled.remove(&task.id) {
                        continue;
                    }
                    // Run outside the lock so callbacks may schedule/cancel.
                    drop(queue);
                    (task.callback)();
                    queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(interval) = task.interval {
                        if inner.running.load(Ordering::Acquire)
                            && !queue.cancelled.remove(&task.id)
                        {
                            task.deadline = Instant::now() + interval;
                            queue.heap.push(task);
                        }
                    }
                }
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, TimerQueue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let timer = Timer::new();
        timer.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timer.schedule_once(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    fn repeated_fires_until_cancelled() {
        let timer = Timer::new();
        timer.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = timer.schedule_repeated(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(timer.cancel(id));
        let at_cancel = hits.load(Ordering::SeqCst);
        assert!(at_cancel >= 3, "fired {at_cancel} times");
        std::thread::sleep(Duration::from_millis(50));
        assert!(hits.load(Ordering::SeqCst) <= at_cancel + 1);
    }

    #[test]
    fn cancel_unknown_id_is_false() {
        let timer = Timer::new();
        timer.start();
        assert!(!timer.cancel(42));
    }

    #[test]
    fn stop_drops_pending_tasks() {
        let timer = Timer::new();
        timer.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timer.schedule_once(Duration::from_secs(60), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.pending_count(), 1);
        timer.stop();
        assert_eq!(timer.pending_count(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // Idempotent.
        timer.stop();
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let timer = Timer::new();
        timer.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30u64, 'b'), (10, 'a'), (50, 'c')] {
            let order = Arc::clone(&order);
            timer.schedule_once(Duration::from_millis(delay), move || {
                order.lock().unwrap().push(tag);
            });
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
    }
}
