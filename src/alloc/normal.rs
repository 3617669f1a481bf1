//! Aligned heap allocator.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::trace;

use super::{AllocatorCore, AllocatorKind, BufferAllocator};
use crate::buffer::Buffer;
use crate::error::{AllocError, AllocResult};

/// Default allocation alignment: one cache line, which also satisfies the
/// vector-unit alignment of every SoC this pipeline targets.
const DEFAULT_ALIGNMENT: usize = 64;

/// Heap allocator for CPU-filled buffers.
///
/// Memory carries no physical address (DMA engines cannot reach ordinary
/// heap pages); pools built here serve the raw-file and software-decode
/// paths.
pub struct NormalAllocator {
    core: AllocatorCore,
    alignment: usize,
}

impl NormalAllocator {
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_ALIGNMENT)
    }

    /// Alignment must be a power of two.
    pub fn with_alignment(alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            core: AllocatorCore::new(),
            alignment,
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Default for NormalAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for NormalAllocator {
    fn core(&self) -> &AllocatorCore {
        &self.core
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Normal
    }

    fn create_buffer(&self, id: u32, size: usize) -> AllocResult<Buffer> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let layout = Layout::from_size_align(size, self.alignment)
            .map_err(|e| AllocError::Layout(e.to_string()))?;
        // SAFETY: layout has non-zero size (checked above). Zeroed so a
        // consumer that races ahead of its producer reads black, not garbage.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(AllocError::OutOfMemory { size })?;
        Ok(Buffer::with_owned_memory(id, ptr, layout, 0))
    }

    fn deallocate_buffer(&self, buffer: &Arc<Buffer>) {
        // The heap block is freed by the buffer's drop when the final
        // reference goes away; nothing allocator-side to unwind.
        trace!(id = buffer.id(), size = buffer.size(), "normal buffer destroyed");
    }
}

impl Drop for NormalAllocator {
    fn drop(&mut self) {
        self.destroy_pool();
    }
}
