//! Encoded-file decode worker.
//!
//! Demuxes and decodes through the [`crate::decode::VideoDecoder`] contract.
//! Two modes, chosen by `decoder.enable_hardware`:
//!
//! - **Software**: the worker owns a normal-allocator pool; each fill decodes
//!   the next frame and copies it into the caller's buffer.
//! - **Zero-copy hardware**: the worker owns a decoder-frame allocator with
//!   an initially-empty pool; each drive call wraps one decoder frame —
//!   physical address and all — and injects it into the filled queue.
//!
//! Decoding is sequential by nature; a fill for a frame ahead of the cursor
//! decodes and discards the gap, a fill behind it seeks when the decoder can.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, bail};
use tracing::{debug, trace, warn};

use super::{STREAM_TOTAL_FRAMES, Worker, WorkerConfig};
use crate::alloc::{AllocatorFacade, AllocatorKind};
use crate::buffer::{Buffer, BufferState};
use crate::decode::{PixelFormat, VideoDecoder, decoder_for};
use crate::error::{PoolError, WorkerError, WorkerResult};

struct DecoderState {
    decoder: Box<dyn VideoDecoder>,
    /// Frame index the next `next_frame` call will produce.
    next_index: u64,
}

pub struct DecodeFileWorker {
    allocator: Option<AllocatorFacade>,
    state: Mutex<Option<DecoderState>>,
    zero_copy: bool,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_size: usize,
    total_frames: u64,
    /// Injection stops while the filled queue holds this many frames.
    soft_limit: usize,
    pool_id: u64,
    open_flag: AtomicBool,
    decoded_frames: AtomicU64,
    decode_errors: AtomicU64,
}

impl DecodeFileWorker {
    pub fn new() -> Self {
        Self {
            allocator: None,
            state: Mutex::new(None),
            zero_copy: false,
            path: String::new(),
            width: 0,
            height: 0,
            format: PixelFormat::Bgra32,
            frame_size: 0,
            total_frames: 0,
            soft_limit: 0,
            pool_id: 0,
            open_flag: AtomicBool::new(false),
            decoded_frames: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    pub fn decoded_frames(&self) -> u64 {
        self.decoded_frames.load(Ordering::Acquire)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<DecoderState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the decoder to `frame_index` and return that frame.
    fn decode_at(
        &self,
        state: &mut DecoderState,
        frame_index: u64,
    ) -> WorkerResult<crate::decode::DecodedFrame> {
        if frame_index < state.next_index {
            if state.decoder.seek(frame_index) {
                state.next_index = frame_index;
            } else {
                return Err(WorkerError::Decode(format!(
                    "decoder cannot seek back to frame {frame_index} (cursor at {})",
                    state.next_index
                )));
            }
        }
        while state.next_index < frame_index {
            // Demux forward, discarding frames up to the requested index.
            match state.decoder.next_frame() {
                Ok(Some(_)) => state.next_index += 1,
                Ok(None) => return Err(WorkerError::EndOfStream),
                Err(e) => {
                    self.decode_errors.fetch_add(1, Ordering::AcqRel);
                    return Err(WorkerError::Decode(e.to_string()));
                }
            }
        }
        match state.decoder.next_frame() {
            Ok(Some(frame)) => {
                state.next_index = frame_index + 1;
                self.decoded_frames.fetch_add(1, Ordering::AcqRel);
                Ok(frame)
            }
            Ok(None) => Err(WorkerError::EndOfStream),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::AcqRel);
                Err(WorkerError::Decode(e.to_string()))
            }
        }
    }
}

impl Default for DecodeFileWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for DecodeFileWorker {
    fn open(&mut self, config: &WorkerConfig) -> anyhow::Result<()> {
        let mut decoder = decoder_for(
            &config.file.path,
            config.output.width,
            config.output.height,
            &config.decoder,
        )
        .with_context(|| format!("select decoder for '{}'", config.file.path))?;
        decoder
            .open()
            .with_context(|| format!("open decoder for '{}'", config.file.path))?;

        let width = decoder.width();
        let height = decoder.height();
        let format = decoder.pixel_format();
        let frame_size = format.frame_size(width, height);
        if frame_size == 0 {
            bail!("decoder reported an empty output geometry");
        }
        let total_frames = decoder.total_frames();
        if decoder.is_live() {
            warn!(path = %config.file.path, "live source opened through the file decode worker");
        }

        self.zero_copy = config.decoder.enable_hardware;
        let allocator = if self.zero_copy {
            AllocatorFacade::new(AllocatorKind::DecoderFrame)
        } else {
            AllocatorFacade::new(AllocatorKind::Normal)
        };
        let pool_id = allocator.allocate_pool_with_buffers(
            if self.zero_copy { 0 } else { config.pool.buffer_count },
            frame_size,
            &config.pool.name,
            &config.pool.category,
        )?;

        self.path = config.file.path.clone();
        self.width = width;
        self.height = height;
        self.format = format;
        self.frame_size = frame_size;
        self.total_frames = total_frames;
        self.soft_limit = config.pool.buffer_count.max(2) * 2;
        self.pool_id = pool_id;
        self.allocator = Some(allocator);
        *self.lock_state() = Some(DecoderState {
            decoder,
            next_index: 0,
        });
        self.decoded_frames.store(0, Ordering::Release);
        self.decode_errors.store(0, Ordering::Release);
        self.open_flag.store(true, Ordering::Release);
        debug!(
            path = %self.path,
            width,
            height,
            %format,
            total_frames,
            zero_copy = self.zero_copy,
            pool_id,
            "decode worker open"
        );
        Ok(())
    }

    fn close(&self) {
        if !self.open_flag.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the decoder closes the demuxer; the pool stays up until
        // the worker (and its allocator) is dropped.
        self.lock_state().take();
    }

    fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::Acquire)
    }

    fn fill_buffer(
        &self,
        frame_index: u64,
        buffer: Option<&Arc<Buffer>>,
    ) -> WorkerResult<()> {
        if !self.is_open() {
            return Err(WorkerError::NotOpen);
        }
        if self.total_frames != STREAM_TOTAL_FRAMES && frame_index >= self.total_frames {
            return Err(WorkerError::OutOfRange {
                index: frame_index,
                total: self.total_frames,
            });
        }

        if self.zero_copy {
            if buffer.is_some() {
                return Err(WorkerError::InjectionOnly);
            }
            let allocator = self.allocator.as_ref().ok_or(WorkerError::NotOpen)?;
            let pool = crate::buffer::registry()
                .get_pool(self.pool_id)
                .upgrade()
                .ok_or(crate::error::AllocError::PoolGone(self.pool_id))?;
            // Consumed wrappers come back on the free queue; destroying them
            // releases their decoder frames.
            allocator.reclaim_idle_buffers(self.pool_id)?;
            if pool.filled_count() >= self.soft_limit {
                return Err(WorkerError::Backpressure {
                    limit: self.soft_limit,
                });
            }
            let frame = {
                let mut guard = self.lock_state();
                let state = guard.as_mut().ok_or(WorkerError::NotOpen)?;
                self.decode_at(state, frame_index)?
            };
            allocator.inject_decoder_frame(self.pool_id, frame)?;
            trace!(frame_index, "hardware frame injected");
            return Ok(());
        }

        let buffer = buffer.ok_or(WorkerError::NeedsBuffer)?;
        if buffer.size() < self.frame_size {
            return Err(WorkerError::BufferTooSmall {
                need: self.frame_size,
                have: buffer.size(),
            });
        }
        if buffer.state() != BufferState::LockedByProducer {
            return Err(PoolError::InvalidState {
                id: buffer.id(),
                expected: BufferState::LockedByProducer,
                actual: buffer.state(),
            }
            .into());
        }

        let frame = {
            let mut guard = self.lock_state();
            let state = guard.as_mut().ok_or(WorkerError::NotOpen)?;
            self.decode_at(state, frame_index)?
        };
        let bytes = frame
            .bytes()
            .ok_or_else(|| WorkerError::Decode("software decoder returned unmapped frame".into()))?;
        buffer.fill_from(bytes)?;
        buffer.set_image_metadata_from(&frame);
        trace!(frame_index, "decoded frame copied");
        Ok(())
    }

    fn worker_type(&self) -> &'static str {
        "decode_file"
    }

    fn source_path(&self) -> &str {
        &self.path
    }

    fn output_pool_id(&self) -> u64 {
        self.pool_id
    }

    fn needs_external_buffer(&self) -> bool {
        !self.zero_copy
    }

    fn seek(&self, frame_index: u64) -> bool {
        let mut guard = self.lock_state();
        let Some(state) = guard.as_mut() else {
            return false;
        };
        if state.decoder.seek(frame_index) {
            state.next_index = frame_index;
            true
        } else {
            false
        }
    }

    fn current_frame_index(&self) -> u64 {
        self.lock_state().as_ref().map(|s| s.next_index).unwrap_or(0)
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}
