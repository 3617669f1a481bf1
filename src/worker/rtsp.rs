//! RTSP stream worker.
//!
//! Network ingest and decode run on an internal thread that feeds a bounded
//! channel; the production line's drive calls (`fill_buffer(index, None)`)
//! pull one frame at a time off that channel and inject it into the working
//! pool's filled queue. The index argument is ignored — a live stream has no
//! frame addressing — and `total_frames` reports the stream sentinel so the
//! line's cursor never wraps.
//!
//! Backpressure is layered: the ingest channel's capacity bounds frames
//! waiting to be injected (the decoder's depth), the filled-queue soft limit
//! bounds frames waiting to be consumed, and reclaiming consumed wrappers
//! before each inject releases decoder frames at consumption speed. A slow
//! consumer therefore costs dropped frames, never unbounded memory.
//!
//! The ingest thread reconnects with a short backoff whenever the stream
//! errors or ends; drops and reconnects are counted, not fatal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info, trace, warn};

use super::{STREAM_TOTAL_FRAMES, Worker, WorkerConfig};
use crate::alloc::{AllocatorFacade, AllocatorKind};
use crate::buffer::{Buffer, registry};
use crate::decode::{DecodedFrame, PixelFormat, VideoDecoder, decoder_for};
use crate::error::{AllocError, WorkerError, WorkerResult};

/// How long a drive call waits for the ingest side before giving up.
const DRIVE_DEADLINE: Duration = Duration::from_millis(100);

/// Pause between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

struct IngestShared {
    running: AtomicBool,
    connected: AtomicBool,
    decoded_frames: AtomicU64,
    dropped_frames: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

pub struct RtspWorker {
    allocator: Option<AllocatorFacade>,
    url: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_size: usize,
    /// Injection pauses while the filled queue holds this many frames.
    soft_limit: usize,
    pool_id: u64,
    open_flag: AtomicBool,
    injected_frames: AtomicU64,
    shared: Arc<IngestShared>,
    frames: Mutex<Option<Receiver<DecodedFrame>>>,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl RtspWorker {
    pub fn new() -> Self {
        Self {
            allocator: None,
            url: String::new(),
            width: 0,
            height: 0,
            format: PixelFormat::Bgra32,
            frame_size: 0,
            soft_limit: 0,
            pool_id: 0,
            open_flag: AtomicBool::new(false),
            injected_frames: AtomicU64::new(0),
            shared: Arc::new(IngestShared {
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                decoded_frames: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            frames: Mutex::new(None),
            ingest: Mutex::new(None),
        }
    }

    pub fn decoded_frames(&self) -> u64 {
        self.shared.decoded_frames.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Acquire)
    }

    pub fn injected_frames(&self) -> u64 {
        self.injected_frames.load(Ordering::Acquire)
    }

    pub fn reconnects(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn print_stats(&self) {
        info!(
            url = %self.url,
            decoded = self.decoded_frames(),
            injected = self.injected_frames(),
            dropped = self.dropped_frames(),
            reconnects = self.reconnects(),
            connected = self.is_connected(),
            "rtsp worker stats"
        );
    }

    fn ingest_loop(
        mut decoder: Box<dyn VideoDecoder>,
        tx: SyncSender<DecodedFrame>,
        shared: Arc<IngestShared>,
    ) {
        while shared.running.load(Ordering::Acquire) {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    shared.decoded_frames.fetch_add(1, Ordering::AcqRel);
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Consumer side is behind; shed the frame.
                            shared.dropped_frames.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Ok(None) => {
                    shared.connected.store(false, Ordering::Release);
                    warn!("rtsp stream ended; reconnecting");
                    if !Self::reconnect(decoder.as_mut(), &shared) {
                        return;
                    }
                }
                Err(e) => {
                    shared.connected.store(false, Ordering::Release);
                    *shared.last_error.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(e.to_string());
                    warn!(error = %e, "rtsp decode error; reconnecting");
                    if !Self::reconnect(decoder.as_mut(), &shared) {
                        return;
                    }
                }
            }
        }
    }

    /// Re-open the decoder with backoff until it succeeds or the worker
    /// stops. Returns false when the worker stopped first.
    fn reconnect(decoder: &mut dyn VideoDecoder, shared: &IngestShared) -> bool {
        loop {
            if !shared.running.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(RECONNECT_BACKOFF);
            match decoder.open() {
                Ok(()) => {
                    shared.connected.store(true, Ordering::Release);
                    shared.reconnects.fetch_add(1, Ordering::AcqRel);
                    info!("rtsp reconnected");
                    return true;
                }
                Err(e) => {
                    *shared.last_error.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(e.to_string());
                }
            }
        }
    }
}

impl Default for RtspWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for RtspWorker {
    fn open(&mut self, config: &WorkerConfig) -> anyhow::Result<()> {
        let mut decoder = decoder_for(
            &config.file.path,
            config.output.width,
            config.output.height,
            &config.decoder,
        )
        .with_context(|| format!("select decoder for stream '{}'", config.file.path))?;
        decoder
            .open()
            .with_context(|| format!("connect to stream '{}'", config.file.path))?;
        if !decoder.is_live() {
            bail!(
                "'{}' is not a live source; use the decode worker for files",
                config.file.path
            );
        }

        let width = decoder.width();
        let height = decoder.height();
        let format = decoder.pixel_format();
        let frame_size = format.frame_size(width, height);
        if frame_size == 0 {
            bail!("decoder reported an empty output geometry");
        }

        let allocator = AllocatorFacade::new(AllocatorKind::DecoderFrame);
        let pool_id = allocator.allocate_pool_with_buffers(
            0,
            frame_size,
            &config.pool.name,
            &config.pool.category,
        )?;

        let depth = config.pool.buffer_count.max(1);
        let (tx, rx) = sync_channel(depth);

        self.shared.running.store(true, Ordering::Release);
        self.shared.connected.store(true, Ordering::Release);
        self.shared.decoded_frames.store(0, Ordering::Release);
        self.shared.dropped_frames.store(0, Ordering::Release);
        self.shared.reconnects.store(0, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let ingest = std::thread::Builder::new()
            .name("frameline-rtsp".to_string())
            .spawn(move || Self::ingest_loop(decoder, tx, shared))
            .context("spawn rtsp ingest thread")?;

        self.url = config.file.path.clone();
        self.width = width;
        self.height = height;
        self.format = format;
        self.frame_size = frame_size;
        self.soft_limit = depth * 2;
        self.pool_id = pool_id;
        self.allocator = Some(allocator);
        self.injected_frames.store(0, Ordering::Release);
        *self.frames.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        *self.ingest.lock().unwrap_or_else(|e| e.into_inner()) = Some(ingest);
        self.open_flag.store(true, Ordering::Release);
        debug!(url = %self.url, width, height, %format, depth, pool_id, "rtsp worker open");
        Ok(())
    }

    fn close(&self) {
        if !self.open_flag.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        // Dropping the receiver disconnects the ingest thread's sender.
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = self.ingest.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if handle.join().is_err() {
                warn!("rtsp ingest thread panicked during close");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::Acquire)
    }

    /// One drive call injects one frame; the index is ignored for a live
    /// stream.
    fn fill_buffer(
        &self,
        _frame_index: u64,
        buffer: Option<&Arc<Buffer>>,
    ) -> WorkerResult<()> {
        if !self.is_open() {
            return Err(WorkerError::NotOpen);
        }
        if buffer.is_some() {
            return Err(WorkerError::InjectionOnly);
        }
        let allocator = self.allocator.as_ref().ok_or(WorkerError::NotOpen)?;
        let pool = registry()
            .get_pool(self.pool_id)
            .upgrade()
            .ok_or(AllocError::PoolGone(self.pool_id))?;

        // Release decoder frames whose wrappers came back from the consumer.
        allocator.reclaim_idle_buffers(self.pool_id)?;

        if pool.filled_count() >= self.soft_limit {
            self.shared.dropped_frames.fetch_add(1, Ordering::AcqRel);
            return Err(WorkerError::Backpressure {
                limit: self.soft_limit,
            });
        }

        let frame = {
            let guard = self.frames.lock().unwrap_or_else(|e| e.into_inner());
            let rx = guard.as_ref().ok_or(WorkerError::NotOpen)?;
            rx.recv_timeout(DRIVE_DEADLINE)
                .map_err(|_| WorkerError::Starved)?
        };
        allocator.inject_decoder_frame(self.pool_id, frame)?;
        self.injected_frames.fetch_add(1, Ordering::AcqRel);
        trace!("rtsp frame injected");
        Ok(())
    }

    fn worker_type(&self) -> &'static str {
        "rtsp"
    }

    fn source_path(&self) -> &str {
        &self.url
    }

    fn output_pool_id(&self) -> u64 {
        self.pool_id
    }

    fn needs_external_buffer(&self) -> bool {
        false
    }

    fn seek(&self, _frame_index: u64) -> bool {
        false
    }

    fn current_frame_index(&self) -> u64 {
        self.injected_frames()
    }

    fn total_frames(&self) -> u64 {
        STREAM_TOTAL_FRAMES
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
        0
    }
}

impl Drop for RtspWorker {
    fn drop(&mut self) {
        self.close();
    }
}
