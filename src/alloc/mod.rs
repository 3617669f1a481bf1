//! Allocator hierarchy: the only components that create, admit, and destroy
//! buffers.
//!
//! Every allocator owns the lifecycle of the buffers it makes and of the
//! pools it creates. Pools are handed to the registry at creation (the
//! registry becomes the sole strong owner); the allocator keeps nothing but
//! ids and rediscovers its pools through the registry when it is dropped.
//! That teardown path is the subtle part:
//!
//! 1. query the registry for every pool attributed to this allocator,
//! 2. pin each pool with a temporary strong reference,
//! 3. wake waiters and wait for quiescence (no buffer checked out),
//! 4. destroy the drained buffers,
//! 5. unregister — the registry's strong reference drops and the pool dies.
//!
//! The common contract lives in [`BufferAllocator`]'s provided methods; the
//! concrete variants implement only buffer creation and destruction:
//!
//! - [`NormalAllocator`] — aligned heap memory, ownership `Owned`.
//! - [`DecoderFrameAllocator`] — wraps decoder-owned frames, ownership
//!   `External`, releases the decoder frame on destruction.
//! - [`FramebufferAllocator`] — wraps pre-mapped device memory, ownership
//!   `External`, never frees.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::buffer::{AllocatorKey, Buffer, BufferPool, QueueKind, registry};
use crate::decode::DecodedFrame;
use crate::error::{AllocError, AllocResult};

mod decoder;
mod facade;
mod factory;
mod framebuffer;
mod normal;

pub use decoder::DecoderFrameAllocator;
pub use facade::AllocatorFacade;
pub use factory::create as create_allocator;
pub use framebuffer::{FramebufferAllocator, SurfaceDescriptor};
pub use normal::NormalAllocator;

/// How long `destroy_pool` waits for checked-out buffers before declaring
/// them leaked.
const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-wide allocator id source, starting at 1 (0 is reserved as
/// "invalid" by the registry).
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Concrete allocator variants, for factory dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// Aligned heap allocations.
    Normal,
    /// Wrapper around decoder-owned frames.
    DecoderFrame,
    /// Wrapper around pre-mapped device memory.
    Framebuffer,
}

/// Identity and bookkeeping shared by every concrete allocator.
pub struct AllocatorCore {
    id: u64,
    /// Buffer ids are unique per allocator across all of its pools.
    next_buffer_id: AtomicU32,
    /// Ids of the pools this allocator created, in creation order. The
    /// registry's allocator index is the authoritative copy; this is the
    /// local record used for `managed_pool_id`.
    pool_ids: Mutex<Vec<u64>>,
}

impl AllocatorCore {
    pub fn new() -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            next_buffer_id: AtomicU32::new(0),
            pool_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn take_buffer_id(&self) -> u32 {
        self.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record_pool(&self, pool_id: u64) {
        self.pool_ids.lock().unwrap_or_else(|e| e.into_inner()).push(pool_id);
    }

    fn first_pool(&self) -> u64 {
        self.pool_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .copied()
            .unwrap_or(0)
    }
}

impl Default for AllocatorCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Upgrade a pool observer for the duration of one allocator operation.
fn upgrade(pool_id: u64) -> AllocResult<Arc<BufferPool>> {
    let weak: Weak<BufferPool> = registry().get_pool(pool_id);
    weak.upgrade().ok_or(AllocError::PoolGone(pool_id))
}

/// The common allocator contract.
///
/// Concrete variants implement [`create_buffer`](Self::create_buffer) and
/// [`deallocate_buffer`](Self::deallocate_buffer); everything else is
/// provided. The provided methods are the only code path that touches the
/// pool's privileged operations.
pub trait BufferAllocator: Send + Sync {
    /// Shared identity/bookkeeping. Concrete types embed an
    /// [`AllocatorCore`] and return it here.
    fn core(&self) -> &AllocatorCore;

    /// Which variant this is.
    fn kind(&self) -> AllocatorKind;

    /// Create one buffer of `size` bytes with the given pool-local id.
    fn create_buffer(&self, id: u32, size: usize) -> AllocResult<Buffer>;

    /// Variant-specific cleanup for one buffer (side-table removal, decoder
    /// release). Owned memory itself is freed by the buffer's drop once the
    /// last reference goes away.
    fn deallocate_buffer(&self, buffer: &Arc<Buffer>);

    /// Globally unique id of this allocator instance.
    fn allocator_id(&self) -> u64 {
        self.core().id()
    }

    /// Id of the first pool this allocator created; 0 when none exists.
    fn managed_pool_id(&self) -> u64 {
        self.core().first_pool()
    }

    /// Create a pool pre-populated with `count` buffers of `size` bytes in
    /// its free queue, register it, and return its registry id.
    ///
    /// On any buffer-creation failure every previously created buffer is
    /// destroyed and the error is returned; nothing is registered.
    fn allocate_pool_with_buffers(
        &self,
        count: usize,
        size: usize,
        name: &str,
        category: &str,
    ) -> AllocResult<u64> {
        let key = AllocatorKey::new();
        let pool = Arc::new(BufferPool::new(&key, name, category));

        let mut created: Vec<Arc<Buffer>> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.create_buffer(self.core().take_buffer_id(), size) {
                Ok(buffer) => created.push(Arc::new(buffer)),
                Err(e) => {
                    error!(
                        allocator = self.allocator_id(),
                        pool = name,
                        created = created.len(),
                        requested = count,
                        "buffer creation failed; unwinding pool"
                    );
                    for buffer in &created {
                        self.deallocate_buffer(buffer);
                    }
                    pool.clear_managed(&key);
                    return Err(e);
                }
            }
        }
        for buffer in created {
            pool.add_buffer(&key, buffer, QueueKind::Free)?;
        }

        let pool_id = registry().register_pool(pool, self.allocator_id())?;
        self.core().record_pool(pool_id);
        debug!(
            allocator = self.allocator_id(),
            pool_id,
            name,
            count,
            size,
            "pool allocated"
        );
        Ok(pool_id)
    }

    /// Create one fresh buffer and insert it into the given queue of an
    /// existing pool (dynamic growth).
    fn inject_buffer_to_pool(
        &self,
        pool_id: u64,
        size: usize,
        queue: QueueKind,
    ) -> AllocResult<Arc<Buffer>> {
        let pool = upgrade(pool_id)?;
        let key = AllocatorKey::new();
        let buffer = Arc::new(self.create_buffer(self.core().take_buffer_id(), size)?);
        pool.add_buffer(&key, Arc::clone(&buffer), queue)?;
        Ok(buffer)
    }

    /// Wrap pre-existing memory in a new `External` buffer and insert it into
    /// the given queue. Hardware-decoder and device-memory paths.
    fn inject_external_buffer_to_pool(
        &self,
        pool_id: u64,
        virt: *mut u8,
        phys: u64,
        size: usize,
        queue: QueueKind,
    ) -> AllocResult<Arc<Buffer>> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let pool = upgrade(pool_id)?;
        let key = AllocatorKey::new();
        let buffer = Arc::new(Buffer::with_external_memory(
            self.core().take_buffer_id(),
            virt,
            phys,
            size,
        ));
        pool.add_buffer(&key, Arc::clone(&buffer), queue)?;
        Ok(buffer)
    }

    /// Wrap one decoder frame into a buffer on the pool's filled queue.
    /// Implemented by the decoder-frame allocator only.
    fn inject_decoder_frame(
        &self,
        _pool_id: u64,
        _frame: DecodedFrame,
    ) -> AllocResult<Arc<Buffer>> {
        Err(AllocError::Unsupported(
            "only the decoder-frame allocator injects decoder frames",
        ))
    }

    /// Evict an idle buffer from a pool and destroy it (dynamic shrink).
    /// Fails while the buffer is filled or checked out.
    fn remove_buffer_from_pool(
        &self,
        pool_id: u64,
        buffer: &Arc<Buffer>,
    ) -> AllocResult<()> {
        let pool = upgrade(pool_id)?;
        let key = AllocatorKey::new();
        pool.remove_buffer(&key, buffer)?;
        self.deallocate_buffer(buffer);
        Ok(())
    }

    /// Destroy every buffer sitting idle in the pool's free queue.
    ///
    /// Injection-style producers call this before each inject: a consumed
    /// wrapper that came back to the free queue has served its purpose, and
    /// destroying it releases the decoder frame behind it. This is what caps
    /// a streaming worker's outstanding frames at consumption depth.
    fn reclaim_idle_buffers(&self, pool_id: u64) -> AllocResult<usize> {
        let pool = upgrade(pool_id)?;
        let key = AllocatorKey::new();
        let mut reclaimed = 0;
        while let Some(buffer) = pool.take_idle(&key) {
            self.deallocate_buffer(&buffer);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Tear down every pool this allocator created: shutdown, quiescence
    /// wait, buffer destruction, unregistration.
    ///
    /// Returns `true` when every pool was fully drained. A pool whose
    /// consumers still hold buffers past the quiescence timeout is logged,
    /// its idle buffers are destroyed, the checked-out remainder is leaked to
    /// its holders (their references keep the memory alive), and the result
    /// is `false`. Idempotent: a second call finds nothing to do.
    fn destroy_pool(&self) -> bool {
        let key = AllocatorKey::new();
        let reg = registry();
        let mut fully_drained = true;

        for pool_id in reg.pools_by_allocator(&key, self.allocator_id()) {
            let Some(pool) = reg.pool_for_cleanup(&key, pool_id) else {
                continue;
            };
            pool.shutdown();
            if !pool.wait_quiescent(&key, QUIESCENCE_TIMEOUT) {
                error!(
                    pool_id,
                    pool = pool.name(),
                    in_flight = pool.in_flight_count(),
                    "teardown proceeding with buffers still checked out; they will leak"
                );
                fully_drained = false;
            }
            let drained = pool.drain_for_destroy(&key);
            for buffer in &drained {
                self.deallocate_buffer(buffer);
            }
            let leaked = pool.total_count();
            if leaked > 0 {
                warn!(pool_id, leaked, "leaked in-flight buffers at pool teardown");
                fully_drained = false;
            }
            pool.clear_managed(&key);
            reg.unregister_pool(&key, pool_id);
            debug!(
                allocator = self.allocator_id(),
                pool_id,
                destroyed = drained.len(),
                "pool destroyed"
            );
        }
        fully_drained
    }
}
