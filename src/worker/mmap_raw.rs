//! Memory-mapped raw file worker.
//!
//! Maps the whole source file once and serves frame `i` from byte offset
//! `i × frame_size`. Raw files are a plain concatenation of frames with no
//! header, so the geometry must come from the configuration; files that look
//! like containers or elementary streams are rejected at open.
//!
//! Good for files up to about a gigabyte with random access; the kernel's
//! page cache does the read-ahead.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, bail};
use memmap2::Mmap;
use tracing::{debug, trace};

use super::{Worker, WorkerConfig};
use crate::alloc::{AllocatorFacade, AllocatorKind};
use crate::buffer::{Buffer, BufferState};
use crate::decode::PixelFormat;
use crate::error::{PoolError, WorkerError, WorkerResult};

/// Bytes sniffed from the head of the file for format detection.
const SNIFF_LEN: usize = 16;

pub struct MmapRawFileWorker {
    allocator: AllocatorFacade,
    // Source state, written once in `open`.
    map: Option<Mmap>,
    path: PathBuf,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    file_size: u64,
    /// First file frame served (config start_frame).
    first_frame: u64,
    /// Frames served, after range clamping.
    total_frames: u64,
    pool_id: u64,
    cursor: AtomicU64,
    open_flag: AtomicBool,
}

impl MmapRawFileWorker {
    pub fn new() -> Self {
        Self {
            allocator: AllocatorFacade::new(AllocatorKind::Normal),
            map: None,
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
        }
    }

    /// Reject sources that carry a container or elementary-stream header; a
    /// raw file has none, so anything recognizable is a misconfiguration.
    fn reject_non_raw(head: &[u8]) -> anyhow::Result<()> {
        if head.len() >= 8 && &head[4..8] == b"ftyp" {
            bail!("MP4/MOV container detected; use the decode worker for encoded files");
        }
        if head.starts_with(b"RIFF") {
            bail!("AVI container detected; use the decode worker for encoded files");
        }
        if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            bail!("Matroska container detected; use the decode worker for encoded files");
        }
        if head.starts_with(&[0x00, 0x00, 0x00, 0x01]) || head.starts_with(&[0x00, 0x00, 0x01]) {
            bail!("H.264/H.265 elementary stream detected; use the decode worker");
        }
        Ok(())
    }
}

impl Default for MmapRawFileWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for MmapRawFileWorker {
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

        // SAFETY: mapping a file we just opened read-only; the map lives in
        // self and outlives every slice taken from it.
        let map = unsafe { Mmap::map(&file).context("mmap raw video file")? };
        Self::reject_non_raw(&map[..SNIFF_LEN.min(map.len())])?;

        let file_frames = file_size / frame_size as u64;
        let first_frame = config.file.start_frame.min(file_frames);
        let last_frame = if config.file.end_frame < 0 {
            file_frames
        } else {
            (config.file.end_frame as u64).min(file_frames)
        };
        let total_frames = last_frame.saturating_sub(first_frame);
        if total_frames == 0 {
            bail!(
                "frame range [{}, {:?}) selects nothing in a {}-frame file",
                config.file.start_frame,
                config.file.end_frame,
                file_frames
            );
        }

        let pool_id = self.allocator.allocate_pool_with_buffers(
            config.pool.buffer_count,
            frame_size,
            &config.pool.name,
            &config.pool.category,
        )?;

        self.map = Some(map);
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
        self.open_flag.store(true, Ordering::Release);
        debug!(
            path = %self.path.display(),
            frames = total_frames,
            frame_size,
            pool_id,
            "mmap raw worker open"
        );
        Ok(())
    }

    fn close(&self) {
        self.open_flag.store(false, Ordering::Release);
        // The mapping itself drops with the worker; the pool is torn down by
        // the allocator when the worker is dropped.
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

        let map = self.map.as_ref().ok_or(WorkerError::NotOpen)?;
        let offset = (self.first_frame + frame_index) as usize * self.frame_size;
        let end = offset + self.frame_size;
        if end as u64 > self.file_size {
            return Err(WorkerError::OutOfRange {
                index: frame_index,
                total: self.total_frames,
            });
        }
        buffer.fill_from(&map[offset..end])?;
        if let Some(format) = PixelFormat::from_bits_per_pixel(self.bits_per_pixel) {
            buffer.set_image_metadata(crate::buffer::ImageMetadata::packed(
                self.width,
                self.height,
                format,
            ));
        }
        self.cursor.fetch_max(frame_index + 1, Ordering::AcqRel);
        trace!(frame_index, offset, "raw frame filled");
        Ok(())
    }

    fn worker_type(&self) -> &'static str {
        "mmap_raw"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::registry;
    use serial_test::serial;
    use std::io::Write;

    /// Raw fixture: `frames` frames of `frame_size` bytes, frame `i` filled
    /// with byte `i` and stamped with the index in its first 8 bytes.
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

    // 16x4 @ 32bpp = 256-byte frames.
    fn fixture_config(path: &std::path::Path) -> WorkerConfig {
        WorkerConfig::raw_file(path.to_str().unwrap(), 16, 4, 32).with_pool_name("mmap-test", "Test")
    }

    #[test]
    #[serial]
    fn open_fill_and_verify_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 10, 256);
        let mut worker = MmapRawFileWorker::new();
        worker.open(&fixture_config(&path)).unwrap();

        assert_eq!(worker.total_frames(), 10);
        assert_eq!(worker.frame_size(), 256);
        assert_eq!(worker.file_size(), 2560);
        assert!(worker.output_pool_id() != 0);

        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        let buf = pool.acquire_free(false, None).unwrap();
        worker.fill_buffer(7, Some(&buf)).unwrap();
        // SAFETY: producer lock held by this thread.
        let data = unsafe { buf.as_slice() };
        assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), 7);
        assert!(data[8..].iter().all(|&b| b == 7));
        assert!(buf.has_image_metadata());
        pool.release_free(&buf).unwrap();
    }

    #[test]
    #[serial]
    fn out_of_range_and_small_buffer_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 3, 256);
        let mut worker = MmapRawFileWorker::new();
        worker.open(&fixture_config(&path)).unwrap();

        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        let buf = pool.acquire_free(false, None).unwrap();
        assert!(matches!(
            worker.fill_buffer(3, Some(&buf)),
            Err(WorkerError::OutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            worker.fill_buffer(0, None),
            Err(WorkerError::NeedsBuffer)
        ));
        pool.release_free(&buf).unwrap();
    }

    #[test]
    #[serial]
    fn container_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.raw");
        let mut file = File::create(&path).unwrap();
        let mut bytes = vec![0u8; 1024];
        bytes[4..8].copy_from_slice(b"ftyp");
        file.write_all(&bytes).unwrap();

        let mut worker = MmapRawFileWorker::new();
        let err = worker.open(&fixture_config(&path)).unwrap_err();
        assert!(err.to_string().contains("container"));
    }

    #[test]
    #[serial]
    fn frame_range_clamps_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 10, 256);
        let mut config = fixture_config(&path);
        config.file.start_frame = 2;
        config.file.end_frame = 7;

        let mut worker = MmapRawFileWorker::new();
        worker.open(&config).unwrap();
        assert_eq!(worker.total_frames(), 5);

        // Index 0 now maps to file frame 2.
        let pool = registry().get_pool(worker.output_pool_id()).upgrade().unwrap();
        let buf = pool.acquire_free(false, None).unwrap();
        worker.fill_buffer(0, Some(&buf)).unwrap();
        // SAFETY: producer lock held.
        let data = unsafe { buf.as_slice() };
        assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), 2);
        pool.release_free(&buf).unwrap();
    }

    #[test]
    #[serial]
    fn navigation_math() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 10, 256);
        let mut worker = MmapRawFileWorker::new();
        worker.open(&fixture_config(&path)).unwrap();

        assert!(worker.seek(5));
        assert_eq!(worker.current_frame_index(), 5);
        assert!(worker.has_more_frames());
        assert!(worker.skip(3));
        assert_eq!(worker.current_frame_index(), 8);
        assert!(worker.skip(-20));
        assert_eq!(worker.current_frame_index(), 0);
        assert!(worker.seek_to_end());
        assert!(worker.is_at_end());
        assert!(!worker.seek(11));
    }

    #[test]
    #[serial]
    fn pool_dies_with_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_fixture(&dir, 4, 256);
        let mut worker = MmapRawFileWorker::new();
        worker.open(&fixture_config(&path)).unwrap();
        let pool_id = worker.output_pool_id();
        assert!(registry().get_pool(pool_id).upgrade().is_some());

        drop(worker);
        assert!(registry().get_pool(pool_id).upgrade().is_none());
    }
}
