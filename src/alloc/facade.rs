//! Allocator facade.
//!
//! Owns one concrete allocator behind the [`BufferAllocator`] trait so that
//! workers can pick a strategy by [`AllocatorKind`] without naming a type.
//! Dropping the facade drops the allocator, which tears down its pools.

use std::sync::Arc;

use super::{AllocatorKind, BufferAllocator, FramebufferAllocator, SurfaceDescriptor, factory};
use crate::buffer::{Buffer, QueueKind};
use crate::decode::DecodedFrame;
use crate::error::AllocResult;

pub struct AllocatorFacade {
    inner: Box<dyn BufferAllocator>,
    kind: AllocatorKind,
}

impl AllocatorFacade {
    pub fn new(kind: AllocatorKind) -> Self {
        Self {
            inner: factory::create(kind),
            kind,
        }
    }

    /// Facade over a framebuffer allocator with the given surfaces.
    pub fn with_surfaces(surfaces: Vec<SurfaceDescriptor>) -> Self {
        Self {
            inner: Box::new(FramebufferAllocator::new(surfaces)),
            kind: AllocatorKind::Framebuffer,
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    pub fn allocator_id(&self) -> u64 {
        self.inner.allocator_id()
    }

    pub fn managed_pool_id(&self) -> u64 {
        self.inner.managed_pool_id()
    }

    pub fn allocate_pool_with_buffers(
        &self,
        count: usize,
        size: usize,
        name: &str,
        category: &str,
    ) -> AllocResult<u64> {
        self.inner.allocate_pool_with_buffers(count, size, name, category)
    }

    pub fn inject_buffer_to_pool(
        &self,
        pool_id: u64,
        size: usize,
        queue: QueueKind,
    ) -> AllocResult<Arc<Buffer>> {
        self.inner.inject_buffer_to_pool(pool_id, size, queue)
    }

    pub fn inject_external_buffer_to_pool(
        &self,
        pool_id: u64,
        virt: *mut u8,
        phys: u64,
        size: usize,
        queue: QueueKind,
    ) -> AllocResult<Arc<Buffer>> {
        self.inner
            .inject_external_buffer_to_pool(pool_id, virt, phys, size, queue)
    }

    pub fn inject_decoder_frame(
        &self,
        pool_id: u64,
        frame: DecodedFrame,
    ) -> AllocResult<Arc<Buffer>> {
        self.inner.inject_decoder_frame(pool_id, frame)
    }

    pub fn remove_buffer_from_pool(
        &self,
        pool_id: u64,
        buffer: &Arc<Buffer>,
    ) -> AllocResult<()> {
        self.inner.remove_buffer_from_pool(pool_id, buffer)
    }

    pub fn reclaim_idle_buffers(&self, pool_id: u64) -> AllocResult<usize> {
        self.inner.reclaim_idle_buffers(pool_id)
    }

    pub fn destroy_pool(&self) -> bool {
        self.inner.destroy_pool()
    }
}

impl std::fmt::Debug for AllocatorFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorFacade")
            .field("kind", &self.kind)
            .field("allocator_id", &self.allocator_id())
            .finish()
    }
}
