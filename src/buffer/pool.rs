//! Double-queue buffer scheduler.
//!
//! A [`BufferPool`] is a pure scheduler: it moves buffers between a free
//! queue and a filled queue under one mutex, blocks producers and consumers
//! on two condition variables, and knows nothing about where the memory came
//! from. Buffer creation and destruction belong to the allocator layer, which
//! reaches the pool's managed set through passkey-gated operations.
//!
//! ```text
//!                       acquire_free              submit_filled
//!       [Idle] ───────────────────────▶ [LockedByProducer] ───────▶ [ReadyForConsume]
//!         ▲                                       │                        │
//!         │ release_free (producer failed)        │                        │ acquire_filled
//!         └───────────────────────────────────────┘                        ▼
//!         ▲                                                       [LockedByConsumer]
//!         │                     release_filled                             │
//!         └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Capacity is unbounded on the filled side; backpressure is emergent —
//! producers block on an empty free queue. Fairness is strict FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{Buffer, BufferState};
use crate::error::{AcquireError, AcquireResult, PoolError, PoolResult};

/// Which of the pool's two queues an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Free,
    Filled,
}

/// Passkey gating the pool's allocator-only operations.
///
/// Only the allocator layer can construct one (`pub(crate)` constructor), so
/// pipeline code outside this crate observes nothing but the public
/// schedule/submit/release contract. This is the passkey idiom: possession of
/// the token is the capability.
pub struct AllocatorKey {
    _private: (),
}

impl AllocatorKey {
    pub(crate) fn new() -> Self {
        AllocatorKey { _private: () }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Authoritative membership: id → buffer. Any buffer not in here is not
    /// served by this pool.
    managed: HashMap<u32, Arc<Buffer>>,
    free: VecDeque<Arc<Buffer>>,
    filled: VecDeque<Arc<Buffer>>,
}

impl PoolInner {
    fn in_flight(&self) -> usize {
        self.managed.len() - self.free.len() - self.filled.len()
    }

    /// Membership check against the managed set, by id and object identity.
    fn member(&self, buffer: &Arc<Buffer>) -> bool {
        self.managed
            .get(&buffer.id())
            .is_some_and(|b| Arc::ptr_eq(b, buffer))
    }
}

/// Named, categorized scheduler over a set of buffers.
///
/// All public operations are safe under arbitrary producer/consumer
/// multiplicity: each one is a short critical section (queue push/pop plus at
/// most one notify). Only the two acquire operations ever block, and
/// [`BufferPool::shutdown`] unblocks them unconditionally.
pub struct BufferPool {
    name: String,
    category: String,
    /// Assigned by the registry at registration; 0 until then.
    registry_id: AtomicU64,
    inner: Mutex<PoolInner>,
    free_cv: Condvar,
    filled_cv: Condvar,
    running: AtomicBool,
}

impl BufferPool {
    /// Construct an empty pool. Requires the allocator passkey: pools come
    /// into being only through an allocator, which immediately hands
    /// ownership to the registry.
    pub(crate) fn new(_key: &AllocatorKey, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            registry_id: AtomicU64::new(0),
            inner: Mutex::new(PoolInner::default()),
            free_cv: Condvar::new(),
            filled_cv: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Registry id, 0 before registration.
    pub fn registry_id(&self) -> u64 {
        self.registry_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_registry_id(&self, id: u64) {
        self.registry_id.store(id, Ordering::Release);
    }

    // ---- producer side -------------------------------------------------

    /// Pop a buffer from the free queue for filling.
    ///
    /// With `blocking = false` an empty queue returns
    /// [`AcquireError::WouldBlock`] immediately. With `blocking = true` the
    /// call waits on the free condvar, bounded by `timeout` (`None` = wait
    /// forever). On success the buffer's state is `LockedByProducer`.
    /// After [`BufferPool::shutdown`] every acquire returns
    /// [`AcquireError::ShutDown`].
    pub fn acquire_free(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> AcquireResult<Arc<Buffer>> {
        self.acquire(QueueKind::Free, blocking, timeout)
    }

    /// Hand a filled buffer to the consumer side.
    ///
    /// Validates membership and that the buffer is `LockedByProducer`; a
    /// second submit of the same buffer is rejected with `InvalidState`.
    pub fn submit_filled(&self, buffer: &Arc<Buffer>) -> PoolResult<()> {
        let mut inner = self.lock();
        self.check_member(&inner, buffer)?;
        Self::check_state(&self.name, buffer, BufferState::LockedByProducer)?;
        buffer.set_state(BufferState::ReadyForConsume);
        inner.filled.push_back(Arc::clone(buffer));
        drop(inner);
        self.filled_cv.notify_one();
        Ok(())
    }

    /// Producer-side abort: return an unfilled buffer to the free queue.
    pub fn release_free(&self, buffer: &Arc<Buffer>) -> PoolResult<()> {
        let mut inner = self.lock();
        self.check_member(&inner, buffer)?;
        Self::check_state(&self.name, buffer, BufferState::LockedByProducer)?;
        buffer.set_state(BufferState::Idle);
        inner.free.push_back(Arc::clone(buffer));
        drop(inner);
        self.free_cv.notify_one();
        Ok(())
    }

    // ---- consumer side -------------------------------------------------

    /// Pop a buffer from the filled queue for consumption. Symmetric to
    /// [`BufferPool::acquire_free`]; on success the state is
    /// `LockedByConsumer`.
    pub fn acquire_filled(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> AcquireResult<Arc<Buffer>> {
        self.acquire(QueueKind::Filled, blocking, timeout)
    }

    /// Consumer's normal return path: back to the free queue.
    pub fn release_filled(&self, buffer: &Arc<Buffer>) -> PoolResult<()> {
        let mut inner = self.lock();
        self.check_member(&inner, buffer)?;
        Self::check_state(&self.name, buffer, BufferState::LockedByConsumer)?;
        buffer.set_state(BufferState::Idle);
        inner.free.push_back(Arc::clone(buffer));
        drop(inner);
        self.free_cv.notify_one();
        Ok(())
    }

    // ---- queries -------------------------------------------------------

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn filled_count(&self) -> usize {
        self.lock().filled.len()
    }

    /// Size of the managed set.
    pub fn total_count(&self) -> usize {
        self.lock().managed.len()
    }

    /// Buffers currently checked out by producers or consumers.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight()
    }

    /// Look a buffer up by id (framebuffer overlay paths).
    pub fn buffer_by_id(&self, id: u32) -> Option<Arc<Buffer>> {
        self.lock().managed.get(&id).cloned()
    }

    /// Size of one buffer, assuming a homogeneous pool; 0 when empty.
    pub fn buffer_size(&self) -> usize {
        self.lock().managed.values().next().map(|b| b.size()).unwrap_or(0)
    }

    /// Total bytes across the managed set.
    pub fn memory_usage(&self) -> usize {
        self.lock().managed.values().map(|b| b.size()).sum()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Log one stats line for this pool.
    pub fn print_stats(&self) {
        let inner = self.lock();
        debug!(
            pool = %self.name,
            category = %self.category,
            id = self.registry_id(),
            total = inner.managed.len(),
            free = inner.free.len(),
            filled = inner.filled.len(),
            in_flight = inner.in_flight(),
            "pool stats"
        );
    }

    /// Log one line per managed buffer.
    pub fn print_all_buffers(&self) {
        let inner = self.lock();
        for buffer in inner.managed.values() {
            debug!(
                pool = %self.name,
                id = buffer.id(),
                size = buffer.size(),
                state = ?buffer.state(),
                phys = format_args!("{:#x}", buffer.physical_address()),
                valid = buffer.is_valid(),
                "buffer"
            );
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Clear the running flag and wake every waiter on both queues.
    /// Idempotent; after shutdown all acquire variants fail fast.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(pool = %self.name, "pool shutting down");
        }
        self.free_cv.notify_all();
        self.filled_cv.notify_all();
    }

    // ---- allocator-only operations (passkey-gated) ---------------------

    /// Admit a buffer to the managed set and the requested queue.
    pub(crate) fn add_buffer(
        &self,
        _key: &AllocatorKey,
        buffer: Arc<Buffer>,
        queue: QueueKind,
    ) -> PoolResult<()> {
        let mut inner = self.lock();
        if inner.managed.contains_key(&buffer.id()) {
            warn!(pool = %self.name, id = buffer.id(), "buffer already managed");
            return Err(PoolError::AlreadyManaged {
                id: buffer.id(),
                pool: self.name.clone(),
            });
        }
        inner.managed.insert(buffer.id(), Arc::clone(&buffer));
        match queue {
            QueueKind::Free => {
                buffer.set_state(BufferState::Idle);
                inner.free.push_back(buffer);
                drop(inner);
                self.free_cv.notify_one();
            }
            QueueKind::Filled => {
                buffer.set_state(BufferState::ReadyForConsume);
                inner.filled.push_back(buffer);
                drop(inner);
                self.filled_cv.notify_one();
            }
        }
        Ok(())
    }

    /// Evict an idle buffer from the free queue and the managed set.
    /// Fails for buffers that are filled or checked out.
    pub(crate) fn remove_buffer(
        &self,
        _key: &AllocatorKey,
        buffer: &Arc<Buffer>,
    ) -> PoolResult<()> {
        let mut inner = self.lock();
        self.check_member(&inner, buffer)?;
        if buffer.state() != BufferState::Idle {
            return Err(PoolError::NotIdle { id: buffer.id() });
        }
        let Some(pos) = inner.free.iter().position(|b| Arc::ptr_eq(b, buffer)) else {
            // State says Idle but the buffer is not in the free queue: the
            // advisory state lost a race. Queue membership is authoritative.
            return Err(PoolError::NotIdle { id: buffer.id() });
        };
        inner.free.remove(pos);
        inner.managed.remove(&buffer.id());
        Ok(())
    }

    /// Pop one idle buffer out of the free queue *and* the managed set.
    /// Same contract as [`BufferPool::remove_buffer`] applied to the oldest
    /// idle buffer; injection-style allocators use it to reclaim consumed
    /// wrappers. `None` when the free queue is empty.
    pub(crate) fn take_idle(&self, _key: &AllocatorKey) -> Option<Arc<Buffer>> {
        let mut inner = self.lock();
        let buffer = inner.free.pop_front()?;
        inner.managed.remove(&buffer.id());
        Some(buffer)
    }

    /// Drop every reference the pool still holds, managed set and queues
    /// alike. Error-unwind and teardown path only, after the allocator has
    /// already destroyed (or decided to leak) the underlying buffers.
    pub(crate) fn clear_managed(&self, _key: &AllocatorKey) {
        let mut inner = self.lock();
        inner.managed.clear();
        inner.free.clear();
        inner.filled.clear();
    }

    /// Block until no buffer is checked out, bounded by `timeout`.
    /// Returns false when the deadline passes first.
    ///
    /// Waits in short slices: check-ins come back through either condvar
    /// (`release_*` signal the free side, `submit_filled` the filled side),
    /// so a single long wait on one of them could sleep through the moment
    /// of quiescence.
    pub(crate) fn wait_quiescent(&self, _key: &AllocatorKey, timeout: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.in_flight() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .free_cv
                .wait_timeout(inner, SLICE.min(deadline - now))
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
        true
    }

    /// Pull every queued buffer out of the pool for destruction. Buffers
    /// still checked out stay in the managed set; the caller decides whether
    /// to wait, leak, or log them.
    pub(crate) fn drain_for_destroy(&self, _key: &AllocatorKey) -> Vec<Arc<Buffer>> {
        let mut inner = self.lock();
        let mut drained = Vec::with_capacity(inner.free.len() + inner.filled.len());
        while let Some(buffer) = inner.free.pop_front() {
            inner.managed.remove(&buffer.id());
            drained.push(buffer);
        }
        while let Some(buffer) = inner.filled.pop_front() {
            inner.managed.remove(&buffer.id());
            drained.push(buffer);
        }
        drained
    }

    // ---- internals -----------------------------------------------------

    fn acquire(
        &self,
        queue: QueueKind,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> AcquireResult<Arc<Buffer>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(AcquireError::ShutDown);
            }
            let popped = match queue {
                QueueKind::Free => inner.free.pop_front(),
                QueueKind::Filled => inner.filled.pop_front(),
            };
            if let Some(buffer) = popped {
                debug_assert_eq!(
                    buffer.state(),
                    match queue {
                        QueueKind::Free => BufferState::Idle,
                        QueueKind::Filled => BufferState::ReadyForConsume,
                    }
                );
                buffer.set_state(match queue {
                    QueueKind::Free => BufferState::LockedByProducer,
                    QueueKind::Filled => BufferState::LockedByConsumer,
                });
                return Ok(buffer);
            }
            if !blocking {
                return Err(AcquireError::WouldBlock);
            }
            let cv = match queue {
                QueueKind::Free => &self.free_cv,
                QueueKind::Filled => &self.filled_cv,
            };
            inner = match deadline {
                None => cv.wait(inner).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AcquireError::TimedOut);
                    }
                    let (guard, _) = cv
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard
                }
            };
        }
    }

    fn check_member(&self, inner: &PoolInner, buffer: &Arc<Buffer>) -> PoolResult<()> {
        if !inner.member(buffer) {
            error!(pool = %self.name, id = buffer.id(), "buffer does not belong to this pool");
            return Err(PoolError::NotManaged {
                id: buffer.id(),
                pool: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_state(
        pool: &str,
        buffer: &Arc<Buffer>,
        expected: BufferState,
    ) -> PoolResult<()> {
        let actual = buffer.state();
        if actual != expected {
            error!(
                pool,
                id = buffer.id(),
                ?expected,
                ?actual,
                "illegal buffer state transition"
            );
            return Err(PoolError::InvalidState {
                id: buffer.id(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Recover from poisoning: the queues are always left structurally
        // consistent at every await-free critical section boundary.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("registry_id", &self.registry_id())
            .field("total", &inner.managed.len())
            .field("free", &inner.free.len())
            .field("filled", &inner.filled.len())
            .field("running", &self.is_running())
            .finish()
    }
}
