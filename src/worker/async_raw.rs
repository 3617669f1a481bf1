//! Batched positioned-read raw file worker.
//!
//! The async analogue of the mmap worker: producer threads submit read
//! requests into a fixed-depth queue and block for their completion, while a
//! small team of reader threads performs positioned reads straight into the
//! destination buffers. With several producers in flight the reads overlap,
//! which is what the fixed queue depth is for — the same shape an io_uring
//! submission ring gives, expressed with threads.
//!
//! Suited to files too large to map comfortably and to high producer
//! multiplicity.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, bail};
use tracing::{debug, trace, warn};

use super::{Worker, WorkerConfig};
use crate::alloc::{AllocatorFacade, AllocatorKind};
use crate::buffer::{Buffer, BufferState};
use crate::decode::PixelFormat;
use crate::error::{PoolError, WorkerError, WorkerResult};

/// Default outstanding-request depth; matches a mid-size io_uring.
const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Reader threads serving the request queue.
const READER_THREADS: usize = 2;

struct ReadRequest {
    offset: u64,
    len: usize,
    buffer: Arc<Buffer>,
    reply: SyncSender<std::io::Result<()>>,
}

pub struct AsyncRawFileWorker {
    allocator: AllocatorFacade,
    queue_depth: usize,
    // Source state, written once in `open`.
    path: PathBuf,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    file_size: u64,
    first_frame: u64,
    total_frames: u64,
    pool_id: u64,
    cursor: AtomicU64,
    open_flag: AtomicBool,
    // Request plumbing; the sender drops in `close`, which drains the
    // readers.
    requests: Mutex<Option<SyncSender<ReadRequest>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncRawFileWorker {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// `queue_depth` bounds the number of outstanding read requests.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            allocator: AllocatorFacade::new(AllocatorKind::Normal),
            queue_depth: queue_depth.max(1),
            path: PathBuf::new(),
            width: 0,
            height: 0,
            bits_per_pixel: 0,
            frame_size: 0,
            file_size: 0,
            first_frame: 0,
            total_frames: 0,
            pool_id: 0,
            cursor: AtomicU64::new(0),
            open_flag: AtomicBool::new(false),
            requests: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    fn reader_loop(file: File, requests: Arc<Mutex<Receiver<ReadRequest>>>) {
        loop {
            let request = {
                let rx = requests.lock().unwrap_or_else(|e| e.into_inner());
                rx.recv()
            };
            let Ok(request) = request else {
                // Sender gone: the worker closed.
                return;
            };
            // SAFETY: the submitting producer holds the buffer in
            // LockedByProducer state and blocks on the reply channel, so this
            // reader is the sole content accessor for the request's duration.
            let slice = unsafe { &mut request.buffer.as_mut_slice()[..request.len] };
            let result = file.read_exact_at(slice, request.offset);
            // A dropped reply receiver means the producer gave up; fine.
            let _ = request.reply.send(result);
        }
    }
}

impl Default for AsyncRawFileWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for AsyncRawFileWorker {
    fn open(&mut self, config: &WorkerConfig) -> anyhow::Result<()> {
        let output = &config.output;
        if output.width == 0 || output.height == 0 || output.bits_per_pixel == 0 {
            bail!("raw sources need explicit width/height/bits_per_pixel");
        }
        let frame_size = config.raw_frame_size();

        let file = File::open(&config.file.path)
            .with_context(|| format!("open raw video file '{}'", config.file.path))?;
        let file_size = file.metadata().context("stat raw video file")?.len();
        if file_size < frame_size as u64 {
            bail!(
                "file '{}' holds {} bytes, less than one {}-byte frame",
                config.file.path,
                file_size,
                frame_size
            );
        }

        let file_frames = file_size / frame_size as u64;
        let first_frame = config.file.start_frame.min(file_frames);
        let last_frame = if config.file.end_frame < 0 {
            file_frames
        } else {
            (config.file.end_frame as u64).min(file_frames)
        };
        let total_frames = last_frame.saturating_sub(first_frame);
        if total_frames == 0 {
            bail!("frame range selects nothing in a {}-frame file", file_frames);
        }

        let pool_id = self.allocator.allocate_pool_with_buffers(
            config.pool.buffer_count,
            frame_size,
            &config.pool.name,
            &config.pool.category,
        )?;

        let (tx, rx) = sync_channel::<ReadRequest>(self.queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let mut readers = Vec::with_capacity(READER_THREADS);
        for i in 0..READER_THREADS {
            let file = file.try_clone().context("clone file handle for reader")?;
            let rx = Arc::clone(&rx);
            readers.push(
                std::thread::Builder::new()
                    .name(format!("frameline-read-{i}"))
                    .spawn(move || Self::reader_loop(file, rx))
                    .context("spawn reader thread")?,
            );
        }

        self.path = PathBuf::from(&config.file.path);
        self.width = output.width;
        self.height = output.height;
        self.bits_per_pixel = output.bits_per_pixel;
        self.frame_size = frame_size;
        self.file_size = file_size;
        self.first_frame = first_frame;
        self.total_frames = total_frames;
        self.pool_id = pool_id;
        self.cursor.store(0, Ordering::Release);
        *self.requests.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.readers.lock().unwrap_or_else(|e| e.into_inner()) = readers;
        self.open_flag.store(true, Ordering::Release);
        debug!(
            path = %self.path.display(),
            frames = total_frames,
            queue_depth = self.queue_depth,
            pool_id,
            "async raw worker open"
        );
        Ok(())
    }

    fn close(&self) {
        if !self.open_flag.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender drains the readers.
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).take();
        let readers = std::mem::take(&mut *self.readers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in readers {
            if handle.join().is_err() {
                warn!("reader thread panicked during close");
            }
        }
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
        let buffer = buffer.ok_or(WorkerError::NeedsBuffer)?;
        if frame_index >= self.total_frames {
            return Err(WorkerError::OutOfRange {
                index: frame_index,
                total: self.total_frames,
            });
        }
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

        let sender = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(WorkerError::NotOpen)?;
        let (reply_tx, reply_rx) = sync_channel(1);
        sender
            .send(ReadRequest {
                offset: (self.first_frame + frame_index) * self.frame_size as u64,
                len: self.frame_size,
                buffer: Arc::clone(buffer),
                reply: reply_tx,
            })
            .map_err(|_| WorkerError::NotOpen)?;
        reply_rx.recv().map_err(|_| WorkerError::NotOpen)??;

        if let Some(format) = PixelFormat::from_bits_per_pixel(self.bits_per_pixel) {
            buffer.set_image_metadata(crate::buffer::ImageMetadata::packed(
                self.width,
                self.height,
                format,
            ));
        }
        self.cursor.fetch_max(frame_index + 1, Ordering::AcqRel);
        trace!(frame_index, "raw frame read");
        Ok(())
    }

    fn worker_type(&self) -> &'static str {
        "async_raw"
    }

    fn source_path(&self) -> &str {
        self.path.to_str().unwrap_or("")
    }

    fn output_pool_id(&self) -> u64 {
        self.pool_id
    }

    fn seek(&self, frame_index: u64) -> bool {
        if frame_index > self.total_frames {
            return false;
        }
        self.cursor.store(frame_index, Ordering::Release);
        true
    }

    fn current_frame_index(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
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
        self.bits_per_pixel as usize / 8
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }
}

impl Drop for AsyncRawFileWorker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::registry;
    use serial_test::serial;
    use std::io::Write;

    fn raw_fixture(dir: &tempfile::TempDir, frames: u64, frame_size: usize) -> PathBuf {
        let path = dir.path().join("video.raw");
        let mut file = File::create(&path).unwrap();
        for i in 0..frames {
            let mut frame = vec![i as u8; frame_size];
            frame[..8].copy_from_slice(&i.to_le_bytes());
            file.write_all(&frame).unwrap();
        }
        path
    }

    fn fixture_config(path: &std::path::Path) -> WorkerConfig {
        WorkerConfig::raw_file(path.to_str().unwrap(), 16, 4, 32)
            .with_pool_name("async-test", "Test")
    }

    #[test]
    #[serial]
    fn reads_land_in_the_right_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 8, 256);
        let mut worker = AsyncRawFileWorker::with_queue_depth(4);
        worker.open(&fixture_config(&path)).unwrap();

        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        for index in [3u64, 0, 7] {
            let buf = pool.acquire_free(false, None).unwrap();
            worker.fill_buffer(index, Some(&buf)).unwrap();
            // SAFETY: producer lock held.
            let data = unsafe { buf.as_slice() };
            assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), index);
            pool.release_free(&buf).unwrap();
        }
    }

    #[test]
    #[serial]
    fn concurrent_producers_share_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 32, 256);
        let mut worker = AsyncRawFileWorker::with_queue_depth(8);
        let mut config = fixture_config(&path);
        config.pool.buffer_count = 8;
        worker.open(&config).unwrap();
        let worker = Arc::new(worker);

        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let worker = Arc::clone(&worker);
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for i in 0..8u64 {
                    let index = t * 8 + i;
                    let buf = pool.acquire_free(true, None).unwrap();
                    worker.fill_buffer(index, Some(&buf)).unwrap();
                    // SAFETY: producer lock held.
                    let data = unsafe { buf.as_slice() };
                    assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), index);
                    pool.release_free(&buf).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    #[serial]
    fn close_is_idempotent_and_stops_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 4, 256);
        let mut worker = AsyncRawFileWorker::new();
        worker.open(&fixture_config(&path)).unwrap();

        worker.close();
        worker.close();
        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        let buf = pool.acquire_free(false, None).unwrap();
        assert!(matches!(
            worker.fill_buffer(0, Some(&buf)),
            Err(WorkerError::NotOpen)
        ));
        pool.release_free(&buf).unwrap();
    }
}
