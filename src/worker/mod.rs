//! Workers: producer adapters for the different source kinds.
//!
//! A worker owns exactly one source (raw file, encoded file, RTSP stream)
//! and one **working pool**, created through its allocator facade during
//! [`Worker::open`] and published via [`Worker::output_pool_id`]. The
//! production line never creates pools; it asks the worker.
//!
//! Two producer shapes coexist behind the same trait:
//!
//! - **Fill style** (`needs_external_buffer() == true`): the caller acquires
//!   a free buffer and the worker copies frame data into it. Raw-file and
//!   software-decode workers.
//! - **Injection style** (`needs_external_buffer() == false`): the worker
//!   wraps decoder-owned memory into brand-new buffers and pushes them
//!   straight onto the filled queue; the caller drives it once per frame with
//!   `fill_buffer(index, None)` and must not pre-acquire. RTSP and
//!   hardware-decode workers.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::WorkerResult;

mod async_raw;
mod config;
mod decode_file;
mod facade;
mod factory;
mod mmap_raw;
mod rtsp;

pub use async_raw::AsyncRawFileWorker;
pub use config::{FileConfig, OutputConfig, PoolConfig, WorkerConfig, WorkerType};
pub use decode_file::DecodeFileWorker;
pub use facade::WorkerFacade;
pub use factory::WorkerFactory;
pub use mmap_raw::MmapRawFileWorker;
pub use rtsp::RtspWorker;

/// Total-frame sentinel reported by stream workers; the frame cursor never
/// wraps against it and the worker ignores the index value.
pub const STREAM_TOTAL_FRAMES: u64 = u64::MAX;

/// Producer adapter for one source kind.
///
/// `open` runs before the worker is shared; everything else takes `&self`
/// and is safe under arbitrary producer-thread multiplicity. `close` is a
/// quiescent shutdown — it stops internal threads but does not destroy the
/// working pool; that happens when the worker (and with it its allocator)
/// is dropped.
pub trait Worker: Send + Sync {
    /// Open the source using the held configuration; on success the working
    /// pool exists and [`Worker::output_pool_id`] returns a non-zero id.
    fn open(&mut self, config: &WorkerConfig) -> anyhow::Result<()>;

    /// Stop producing. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Produce frame `frame_index`.
    ///
    /// Fill-style workers require `Some(buffer)` in state `LockedByProducer`
    /// with `buffer.size() >= frame_size()`. Injection-style workers require
    /// `None` and internally inject into their pool's filled queue.
    fn fill_buffer(&self, frame_index: u64, buffer: Option<&Arc<Buffer>>)
    -> WorkerResult<()>;

    /// Short identifying name, for logs.
    fn worker_type(&self) -> &'static str;

    /// Source path or URL this worker was opened on; empty before `open`.
    fn source_path(&self) -> &str;

    /// Registry id of the working pool; 0 before `open`.
    fn output_pool_id(&self) -> u64;

    /// False for injection-style workers: the caller must not pre-acquire.
    fn needs_external_buffer(&self) -> bool {
        true
    }

    // ---- navigation ----------------------------------------------------

    /// Position the read cursor; false when unsupported or out of range.
    fn seek(&self, frame_index: u64) -> bool;

    fn seek_to_begin(&self) -> bool {
        self.seek(0)
    }

    fn seek_to_end(&self) -> bool {
        let total = self.total_frames();
        if total == STREAM_TOTAL_FRAMES {
            return false;
        }
        self.seek(total)
    }

    /// Move the cursor by a signed frame count, clamped to the valid range.
    fn skip(&self, delta: i64) -> bool {
        let current = self.current_frame_index() as i64;
        let target = (current + delta).max(0) as u64;
        self.seek(target.min(self.total_frames()))
    }

    fn current_frame_index(&self) -> u64;

    /// Total frame count, or [`STREAM_TOTAL_FRAMES`] for live sources.
    fn total_frames(&self) -> u64;

    fn has_more_frames(&self) -> bool {
        self.total_frames() == STREAM_TOTAL_FRAMES
            || self.current_frame_index() < self.total_frames()
    }

    fn is_at_end(&self) -> bool {
        !self.has_more_frames()
    }

    // ---- geometry ------------------------------------------------------

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn bytes_per_pixel(&self) -> usize;

    /// Size in bytes of one output frame.
    fn frame_size(&self) -> usize;

    /// Source size in bytes; 0 for streams.
    fn file_size(&self) -> u64;
}
