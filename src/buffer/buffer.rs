//! Per-frame buffer metadata.
//!
//! A [`Buffer`] describes exactly one frame-sized region of memory: where it
//! is (virtual and, when known, physical address), who owns it, what
//! lifecycle state it is in, and — once a producer knows the geometry — what
//! image lives in it. The memory itself may come from the heap, from a
//! memory-mapped device, or from a decoder's opaque output pool; a single
//! ownership tag lets one scheduler handle all three uniformly.
//!
//! Buffers are created by an allocator, handed to a [`super::BufferPool`] for
//! their whole scheduled lifetime, and destroyed by the same allocator during
//! teardown. They are shared as `Arc<Buffer>` and never cloned or copied;
//! identity is the `Arc` itself.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};

use crate::decode::{DecodedFrame, PixelFormat};
use crate::error::{PoolError, PoolResult};

/// Sentinel detecting use of a corrupted or stale buffer object.
const MAGIC: u32 = 0xBEEF_F123;

/// Lifecycle state of a buffer.
///
/// The state field is advisory — queue membership inside the pool is
/// authoritative — but every legal transition is checked and anything else is
/// reported as a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// In the free queue, waiting for a producer.
    Idle = 0,
    /// Checked out by a producer being filled.
    LockedByProducer = 1,
    /// In the filled queue, waiting for a consumer.
    ReadyForConsume = 2,
    /// Checked out by a consumer being read.
    LockedByConsumer = 3,
}

impl BufferState {
    fn from_u8(raw: u8) -> BufferState {
        match raw {
            0 => BufferState::Idle,
            1 => BufferState::LockedByProducer,
            2 => BufferState::ReadyForConsume,
            _ => BufferState::LockedByConsumer,
        }
    }
}

/// Who owns the memory behind a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated by this system; freed when the buffer is destroyed.
    Owned,
    /// Borrowed from a device or decoder; destruction only detaches metadata.
    External,
}

/// Backing memory of a buffer.
enum BufferMemory {
    /// Heap memory this buffer owns; freed on drop.
    Owned { ptr: NonNull<u8>, layout: Layout },
    /// Memory owned elsewhere (device mapping, decoder pool). Never freed
    /// here.
    External,
}

/// Image geometry attached to a filled buffer.
#[derive(Debug, Clone, Copy)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Per-plane stride in bytes.
    pub linesize: [i32; 4],
    /// Per-plane byte offset relative to the buffer's virtual address.
    pub plane_offset: [usize; 4],
    /// Number of active planes, 1..=4.
    pub plane_count: usize,
}

impl ImageMetadata {
    /// Metadata for a tightly-packed single-plane image.
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        let mut linesize = [0i32; 4];
        linesize[0] = (width as usize * format.bytes_per_pixel()) as i32;
        Self {
            width,
            height,
            format,
            linesize,
            plane_offset: [0; 4],
            plane_count: 1,
        }
    }
}

/// Geometry and decoder back-reference, set once the producer knows them.
#[derive(Default)]
struct ImageInfo {
    meta: Option<ImageMetadata>,
    /// For decoder-sourced buffers: keeps the decoder frame alive and lets
    /// `plane_data` follow non-contiguous plane pointers directly.
    frame: Option<Arc<DecodedFrame>>,
}

/// Metadata record plus memory region for one video frame.
///
/// # Thread safety
///
/// State and addresses are atomics; image info sits behind a short mutex.
/// Exclusive access to the *contents* of the memory region is not enforced
/// here — it follows from the pool's state machine: a producer writes only
/// while the buffer is `LockedByProducer`, a consumer reads only while it is
/// `LockedByConsumer`, and the pool's mutex orders the handoffs between them.
pub struct Buffer {
    id: u32,
    virt: AtomicPtr<u8>,
    phys: AtomicU64,
    size: usize,
    ownership: Ownership,
    state: AtomicU8,
    memory: BufferMemory,
    image: Mutex<ImageInfo>,
    magic: u32,
}

// SAFETY: the raw pointers are either owned heap memory freed only in Drop,
// or external memory whose lifetime outlives the buffer by contract.
// Content access is serialized by the pool state machine (see the type docs);
// all metadata access goes through atomics or the image mutex.
unsafe impl Send for Buffer {}
// SAFETY: as above; no &self method hands out unsynchronized mutable access.
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Buffer over freshly-allocated memory it owns. Takes possession of
    /// `ptr`, which must have been allocated with `layout`.
    pub(crate) fn with_owned_memory(id: u32, ptr: NonNull<u8>, layout: Layout, phys: u64) -> Self {
        Self {
            id,
            virt: AtomicPtr::new(ptr.as_ptr()),
            phys: AtomicU64::new(phys),
            size: layout.size(),
            ownership: Ownership::Owned,
            state: AtomicU8::new(BufferState::Idle as u8),
            memory: BufferMemory::Owned { ptr, layout },
            image: Mutex::new(ImageInfo::default()),
            magic: MAGIC,
        }
    }

    /// Buffer over memory owned elsewhere. `virt` may be null for DMA-only
    /// regions; `phys = 0` means unknown.
    pub(crate) fn with_external_memory(id: u32, virt: *mut u8, phys: u64, size: usize) -> Self {
        Self {
            id,
            virt: AtomicPtr::new(virt),
            phys: AtomicU64::new(phys),
            size,
            ownership: Ownership::External,
            state: AtomicU8::new(BufferState::Idle as u8),
            memory: BufferMemory::External,
            image: Mutex::new(ImageInfo::default()),
            magic: MAGIC,
        }
    }

    /// Unique id within the containing pool; doubles as the display-side
    /// overlay index on hardware paths.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// CPU-visible address, or null when the memory is only DMA-accessible.
    pub fn virtual_address(&self) -> *mut u8 {
        self.virt.load(Ordering::Acquire)
    }

    /// Physical address for DMA; 0 = unknown / not applicable.
    pub fn physical_address(&self) -> u64 {
        self.phys.load(Ordering::Acquire)
    }

    /// Size of the memory region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record a lazily-discovered physical address (zero-copy decode paths).
    pub fn set_physical_address(&self, phys: u64) {
        self.phys.store(phys, Ordering::Release);
    }

    /// Repoint the virtual address, e.g. at a decoder frame's plane 0 after
    /// decode. The new pointer must stay valid as long as this buffer's
    /// current backing does.
    pub fn set_virtual_address(&self, virt: *mut u8) {
        self.virt.store(virt, Ordering::Release);
    }

    /// Magic intact and a CPU mapping present.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && !self.virtual_address().is_null()
    }

    pub fn has_image_metadata(&self) -> bool {
        self.lock_image().meta.is_some()
    }

    pub fn image_metadata(&self) -> Option<ImageMetadata> {
        self.lock_image().meta
    }

    /// Attach image geometry directly (raw sources with known layout).
    pub fn set_image_metadata(&self, meta: ImageMetadata) {
        debug_assert!((1..=4).contains(&meta.plane_count));
        self.lock_image().meta = Some(meta);
    }

    /// Copy geometry from a decoded frame: dimensions, format and linesizes
    /// verbatim; plane offsets as the distance from plane 0, clamped to
    /// non-negative; plane count from the highest populated plane.
    pub fn set_image_metadata_from(&self, frame: &DecodedFrame) {
        let base = frame.plane_ptr(0) as isize;
        let mut meta = ImageMetadata {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
            linesize: [0; 4],
            plane_offset: [0; 4],
            plane_count: 1,
        };
        for plane in 0..4 {
            meta.linesize[plane] = frame.linesize(plane);
            let ptr = frame.plane_ptr(plane);
            if !ptr.is_null() {
                meta.plane_count = plane + 1;
                meta.plane_offset[plane] = (ptr as isize - base).max(0) as usize;
            }
        }
        self.lock_image().meta = Some(meta);
    }

    /// Keep a decoder frame alive for the lifetime of this buffer and route
    /// `plane_data` through its plane pointers.
    pub fn attach_decoder_frame(&self, frame: Arc<DecodedFrame>) {
        self.lock_image().frame = Some(frame);
    }

    pub fn decoder_frame(&self) -> Option<Arc<DecodedFrame>> {
        self.lock_image().frame.clone()
    }

    /// Start address of image plane `plane`.
    ///
    /// Plane 0 prefers the buffer's own virtual address (updated to the
    /// decoder's plane 0 at creation on decode paths) and falls back to the
    /// decoder frame. Planes 1..4 go through the decoder frame when one is
    /// attached, because hardware decoders return planar frames whose plane
    /// addresses are unrelated; without a frame they resolve against the
    /// recorded plane offsets. Null when no source is available or `plane`
    /// is outside `[0, 4)`.
    pub fn plane_data(&self, plane: usize) -> *const u8 {
        if plane >= 4 {
            return std::ptr::null();
        }
        let image = self.lock_image();
        if plane == 0 {
            let virt = self.virtual_address();
            if !virt.is_null() {
                return virt;
            }
            return image
                .frame
                .as_ref()
                .map(|f| f.plane_ptr(0))
                .unwrap_or(std::ptr::null());
        }
        if let Some(frame) = &image.frame {
            return frame.plane_ptr(plane);
        }
        let virt = self.virtual_address();
        if virt.is_null() {
            return std::ptr::null();
        }
        let offset = image.meta.as_ref().map(|m| m.plane_offset[plane]).unwrap_or(0);
        // SAFETY: offsets recorded via set_image_metadata* lie inside the
        // buffer's memory region.
        unsafe { virt.add(offset) }
    }

    /// Copy `src` into the buffer's memory, starting at offset 0.
    ///
    /// The caller must hold the buffer in `LockedByProducer` state; the pool
    /// hands out that state exclusively, which is what makes the write
    /// race-free.
    pub fn fill_from(&self, src: &[u8]) -> PoolResult<()> {
        let dst = self.virtual_address();
        if dst.is_null() {
            return Err(PoolError::NoVirtualAddress);
        }
        if src.len() > self.size {
            return Err(PoolError::Oversized {
                len: src.len(),
                capacity: self.size,
            });
        }
        // SAFETY: dst points at least `size` valid bytes (checked above) and
        // the producer lock gives this thread exclusive content access.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        Ok(())
    }

    /// The buffer's memory as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must be the buffer's sole content accessor — in practice,
    /// hold it in `LockedByProducer` state — and the buffer must have a
    /// CPU-visible mapping.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        debug_assert!(!self.virtual_address().is_null());
        // SAFETY: per the function contract.
        unsafe { std::slice::from_raw_parts_mut(self.virtual_address(), self.size) }
    }

    /// The buffer's memory as an immutable slice.
    ///
    /// # Safety
    ///
    /// No producer may be writing the contents — in practice, the caller
    /// holds the buffer in `LockedByConsumer` state — and the buffer must
    /// have a CPU-visible mapping.
    pub unsafe fn as_slice(&self) -> &[u8] {
        debug_assert!(!self.virtual_address().is_null());
        // SAFETY: per the function contract.
        unsafe { std::slice::from_raw_parts(self.virtual_address(), self.size) }
    }

    fn lock_image(&self) -> std::sync::MutexGuard<'_, ImageInfo> {
        // A poisoned lock means a panic mid-update; the metadata is plain
        // data, so recover the guard rather than propagate the panic.
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let BufferMemory::Owned { ptr, layout } = &self.memory {
            // SAFETY: allocated with exactly this layout in the allocator;
            // owned memory is freed nowhere else.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("virt", &self.virtual_address())
            .field("phys", &format_args!("{:#x}", self.physical_address()))
            .field("size", &self.size)
            .field("ownership", &self.ownership)
            .field("state", &self.state())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned_buffer(id: u32, size: usize) -> Buffer {
        let layout = Layout::from_size_align(size, 64).unwrap();
        // SAFETY: layout has non-zero size in every test below.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        Buffer::with_owned_memory(id, ptr, layout, 0)
    }

    #[test]
    fn new_buffer_is_idle_and_valid() {
        let buf = owned_buffer(3, 256);
        assert_eq!(buf.id(), 3);
        assert_eq!(buf.state(), BufferState::Idle);
        assert_eq!(buf.physical_address(), 0);
        assert!(buf.is_valid());
    }

    #[test]
    fn external_buffer_without_mapping_is_invalid() {
        let buf = Buffer::with_external_memory(0, std::ptr::null_mut(), 0x4000, 128);
        assert!(!buf.is_valid());
        assert_eq!(buf.physical_address(), 0x4000);
        assert_eq!(buf.ownership(), Ownership::External);
        assert!(buf.plane_data(0).is_null());
    }

    #[test]
    fn fill_round_trip() {
        let buf = owned_buffer(0, 64);
        buf.set_state(BufferState::LockedByProducer);
        buf.fill_from(&[0xAB; 64]).unwrap();
        buf.set_state(BufferState::ReadyForConsume);
        // SAFETY: single-threaded test, no concurrent writer.
        let contents = unsafe { buf.as_slice() };
        assert!(contents.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn oversized_fill_is_rejected() {
        let buf = owned_buffer(0, 16);
        let err = buf.fill_from(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, PoolError::Oversized { len: 32, capacity: 16 }));
    }

    #[test]
    fn plane_data_uses_offsets_without_decoder_frame() {
        let buf = owned_buffer(0, 64);
        let mut meta = ImageMetadata::packed(4, 8, PixelFormat::Gray8);
        meta.plane_count = 2;
        meta.plane_offset[1] = 32;
        buf.set_image_metadata(meta);

        let base = buf.plane_data(0);
        let second = buf.plane_data(1);
        assert_eq!(unsafe { second.offset_from(base) }, 32);
        assert!(buf.plane_data(4).is_null());
    }

    #[test]
    fn plane_data_prefers_decoder_frame_for_high_planes() {
        let data = vec![0u8; PixelFormat::Nv12.frame_size(8, 8)];
        let frame = Arc::new(DecodedFrame::packed(8, 8, PixelFormat::Nv12, data));
        let buf =
            Buffer::with_external_memory(0, frame.plane_ptr(0) as *mut u8, 0, frame.frame_size());
        buf.set_image_metadata_from(&frame);
        buf.attach_decoder_frame(Arc::clone(&frame));

        assert_eq!(buf.plane_data(0), frame.plane_ptr(0));
        assert_eq!(buf.plane_data(1), frame.plane_ptr(1));
        assert!(buf.plane_data(2).is_null());

        let meta = buf.image_metadata().unwrap();
        assert_eq!(meta.plane_count, 2);
        assert_eq!(meta.plane_offset[1], 64);
        assert_eq!(meta.linesize[0], 8);
    }

    #[test]
    fn metadata_strides_cover_the_row() {
        let buf = owned_buffer(0, 4 * 8 * 4);
        buf.set_image_metadata(ImageMetadata::packed(4, 8, PixelFormat::Bgra32));
        let meta = buf.image_metadata().unwrap();
        assert!(meta.linesize[0] as usize >= meta.width as usize * 4);
    }
}
