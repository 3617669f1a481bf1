//! Decoder-frame allocator.
//!
//! Wraps frames owned by an external decoder into pool buffers without
//! copying. The allocator keeps each wrapped [`DecodedFrame`] alive in a side
//! table keyed by buffer id; destroying the buffer removes the entry, and
//! dropping the frame is the decoder release (unref). Pools created here
//! start empty — frames arrive by injection straight into the filled queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use super::{AllocatorCore, AllocatorKind, BufferAllocator, upgrade};
use crate::buffer::{AllocatorKey, Buffer, BufferPool, QueueKind, registry};
use crate::decode::DecodedFrame;
use crate::error::{AllocError, AllocResult};

/// Allocator for decoder-owned frames (software and hardware decode, RTSP).
pub struct DecoderFrameAllocator {
    core: AllocatorCore,
    /// buffer id → the decoder frame keeping that buffer's memory alive.
    frames: Mutex<HashMap<u32, Arc<DecodedFrame>>>,
}

impl DecoderFrameAllocator {
    pub fn new() -> Self {
        Self {
            core: AllocatorCore::new(),
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap `frame` into a new `External` buffer and push it onto the pool's
    /// **filled** queue.
    ///
    /// The buffer's virtual address is the frame's plane 0, its physical
    /// address the frame's resolved block address (0 for software frames),
    /// and its image metadata the frame's geometry. The frame itself lands in
    /// the side table and is released when the buffer is destroyed.
    pub fn inject_frame(
        &self,
        pool_id: u64,
        frame: DecodedFrame,
    ) -> AllocResult<Arc<Buffer>> {
        let size = frame.frame_size();
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let pool = upgrade(pool_id)?;
        let frame = Arc::new(frame);

        let id = self.core.take_buffer_id();
        let buffer = Buffer::with_external_memory(
            id,
            frame.plane_ptr(0) as *mut u8,
            frame.physical_address(),
            size,
        );
        buffer.set_image_metadata_from(&frame);
        buffer.attach_decoder_frame(Arc::clone(&frame));
        let buffer = Arc::new(buffer);

        self.lock_frames().insert(id, frame);
        let key = AllocatorKey::new();
        if let Err(e) = pool.add_buffer(&key, Arc::clone(&buffer), QueueKind::Filled) {
            // Undo the side-table entry; the frame is released right here.
            self.lock_frames().remove(&id);
            return Err(e.into());
        }
        trace!(pool_id, buffer = id, size, "decoder frame injected");
        Ok(buffer)
    }

    /// Number of decoder frames currently held alive by wrapped buffers.
    /// This is what bounds a streaming worker's outstanding memory.
    pub fn outstanding_frames(&self) -> usize {
        self.lock_frames().len()
    }

    fn lock_frames(&self) -> MutexGuard<'_, HashMap<u32, Arc<DecodedFrame>>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DecoderFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for DecoderFrameAllocator {
    fn core(&self) -> &AllocatorCore {
        &self.core
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::DecoderFrame
    }

    /// Pools of decoder frames start empty; `count` and `size` are ignored
    /// in favour of injection.
    fn allocate_pool_with_buffers(
        &self,
        count: usize,
        _size: usize,
        name: &str,
        category: &str,
    ) -> AllocResult<u64> {
        if count > 0 {
            debug!(count, name, "decoder-frame pools start empty; ignoring pre-fill count");
        }
        let key = AllocatorKey::new();
        let pool = Arc::new(BufferPool::new(&key, name, category));
        let pool_id = registry().register_pool(pool, self.allocator_id())?;
        self.core().record_pool(pool_id);
        Ok(pool_id)
    }

    fn create_buffer(&self, _id: u32, _size: usize) -> AllocResult<Buffer> {
        Err(AllocError::Unsupported(
            "decoder-frame buffers are created by frame injection",
        ))
    }

    fn inject_decoder_frame(
        &self,
        pool_id: u64,
        frame: DecodedFrame,
    ) -> AllocResult<Arc<Buffer>> {
        self.inject_frame(pool_id, frame)
    }

    fn deallocate_buffer(&self, buffer: &Arc<Buffer>) {
        match self.lock_frames().remove(&buffer.id()) {
            Some(frame) => {
                trace!(
                    buffer = buffer.id(),
                    size = frame.frame_size(),
                    "decoder frame released"
                );
                // Dropping `frame` here (and the buffer's own back-reference
                // when the buffer goes away) runs the decoder's release hook.
            }
            None => warn!(
                buffer = buffer.id(),
                "no side-table entry for decoder buffer; double destroy?"
            ),
        }
    }
}

impl Drop for DecoderFrameAllocator {
    fn drop(&mut self) {
        self.destroy_pool();
        let left = self.outstanding_frames();
        if left > 0 {
            warn!(frames = left, "decoder frames still outstanding at allocator drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::PixelFormat;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hw_frame(index: u64, released: &Arc<AtomicUsize>) -> DecodedFrame {
        let data = vec![index as u8; 64];
        let base = data.as_ptr();
        // Leak the Vec into the release hook to emulate decoder-owned memory.
        let hook = Arc::clone(released);
        DecodedFrame::external(
            8,
            8,
            PixelFormat::Gray8,
            base,
            64,
            [8, 0, 0, 0],
            [0; 4],
            1,
            Some(Box::new(move || {
                drop(data);
                hook.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .with_block(index as u32, 0x9000_0000 + index * 64)
    }

    #[test]
    #[serial]
    fn injected_frames_land_filled_with_metadata() {
        let alloc = DecoderFrameAllocator::new();
        let pool_id = alloc.allocate_pool_with_buffers(0, 0, "dec-inject", "Decode").unwrap();
        let released = Arc::new(AtomicUsize::new(0));

        let buffer = alloc.inject_frame(pool_id, hw_frame(1, &released)).unwrap();
        assert_eq!(buffer.physical_address(), 0x9000_0000 + 64);
        assert!(buffer.has_image_metadata());
        assert!(buffer.decoder_frame().is_some());

        let pool = registry().get_pool(pool_id).upgrade().unwrap();
        assert_eq!(pool.filled_count(), 1);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(alloc.outstanding_frames(), 1);
        drop(pool);
        drop(buffer);

        drop(alloc);
        assert_eq!(released.load(Ordering::SeqCst), 1, "decoder frame released at teardown");
    }

    #[test]
    #[serial]
    fn zero_sized_injection_fails() {
        let alloc = DecoderFrameAllocator::new();
        let pool_id = alloc.allocate_pool_with_buffers(0, 0, "dec-zero", "Decode").unwrap();
        let frame = DecodedFrame::packed(0, 0, PixelFormat::Gray8, Vec::new());
        assert!(matches!(
            alloc.inject_frame(pool_id, frame),
            Err(AllocError::ZeroSize)
        ));
    }

    #[test]
    #[serial]
    fn direct_create_is_unsupported() {
        let alloc = DecoderFrameAllocator::new();
        assert!(matches!(
            alloc.create_buffer(0, 64),
            Err(AllocError::Unsupported(_))
        ));
    }
}
