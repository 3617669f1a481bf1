//! Framebuffer (device memory) allocator.
//!
//! Wraps memory that a display device already mapped — one descriptor per
//! hardware surface. Nothing is allocated and nothing is ever freed here;
//! unmapping is the device's responsibility.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{AllocatorCore, AllocatorKind, BufferAllocator};
use crate::buffer::{AllocatorKey, Buffer, BufferPool, QueueKind, registry};
use crate::error::{AllocError, AllocResult};

/// One pre-mapped device surface.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDescriptor {
    /// CPU mapping of the surface; may be null for DMA-only planes.
    pub virt: *mut u8,
    /// Physical address for the display engine; 0 = unknown.
    pub phys: u64,
    /// Surface size in bytes.
    pub size: usize,
}

impl SurfaceDescriptor {
    /// DMA-BUF export of this surface. Not implemented — cross-host and
    /// cross-process buffer transport is out of scope; the descriptor only
    /// reserves the seam.
    pub fn dma_buf_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }
}

// SAFETY: descriptors point at device memory mapped for the life of the
// process by whoever constructed them; the addresses are never dereferenced
// by the allocator itself.
unsafe impl Send for SurfaceDescriptor {}
unsafe impl Sync for SurfaceDescriptor {}

/// Allocator over a fixed list of device surfaces.
///
/// `allocate_pool_with_buffers` ignores its count/size arguments in favour of
/// the descriptor list: buffer id N wraps descriptor N, which keeps the
/// buffer id equal to the display-side overlay index.
pub struct FramebufferAllocator {
    core: AllocatorCore,
    surfaces: Vec<SurfaceDescriptor>,
}

impl FramebufferAllocator {
    pub fn new(surfaces: Vec<SurfaceDescriptor>) -> Self {
        Self {
            core: AllocatorCore::new(),
            surfaces,
        }
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }
}

impl BufferAllocator for FramebufferAllocator {
    fn core(&self) -> &AllocatorCore {
        &self.core
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Framebuffer
    }

    /// Builds one buffer per surface descriptor; `count` and `size` are
    /// ignored.
    fn allocate_pool_with_buffers(
        &self,
        _count: usize,
        _size: usize,
        name: &str,
        category: &str,
    ) -> AllocResult<u64> {
        if self.surfaces.is_empty() {
            return Err(AllocError::Unsupported(
                "framebuffer allocator has no surface descriptors",
            ));
        }
        let key = AllocatorKey::new();
        let pool = Arc::new(BufferPool::new(&key, name, category));
        for (index, _) in self.surfaces.iter().enumerate() {
            let buffer = Arc::new(self.create_buffer(index as u32, 0)?);
            pool.add_buffer(&key, buffer, QueueKind::Free)?;
        }
        let pool_id = registry().register_pool(pool, self.allocator_id())?;
        self.core().record_pool(pool_id);
        debug!(pool_id, surfaces = self.surfaces.len(), name, "framebuffer pool allocated");
        Ok(pool_id)
    }

    /// Buffer id doubles as the descriptor index; `size` is taken from the
    /// descriptor.
    fn create_buffer(&self, id: u32, _size: usize) -> AllocResult<Buffer> {
        let descriptor = self
            .surfaces
            .get(id as usize)
            .ok_or(AllocError::NoDescriptor { index: id as usize })?;
        if descriptor.size == 0 {
            return Err(AllocError::ZeroSize);
        }
        Ok(Buffer::with_external_memory(
            id,
            descriptor.virt,
            descriptor.phys,
            descriptor.size,
        ))
    }

    fn deallocate_buffer(&self, buffer: &Arc<Buffer>) {
        // Device memory is never freed here; only the metadata goes away.
        trace!(id = buffer.id(), "framebuffer surface wrapper destroyed");
    }
}

impl Drop for FramebufferAllocator {
    fn drop(&mut self) {
        self.destroy_pool();
    }
}
