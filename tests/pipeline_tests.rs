//! End-to-end production line scenarios over real files.

mod common;

use std::time::{Duration, Instant};

use frameline::buffer::registry;
use frameline::line::ProductionLine;
use frameline::worker::WorkerType;
use serial_test::serial;

use common::{FIXTURE_FRAME_SIZE, raw_config, stamped_index, write_raw_fixture};

/// Raw mmap loop: 4 buffers, 10 frames, loop on, 1 producer, 1 consumer.
/// Every consumed frame must be the source frame at `index mod 10`, in
/// order, with nothing skipped.
#[test]
#[serial]
fn raw_mmap_loop_delivers_frames_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 10, FIXTURE_FRAME_SIZE);
    let config =
        raw_config(&path, 4, "s1-loop").with_worker_type(WorkerType::MmapRaw);

    let mut line = ProductionLine::new(true, 1, false);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();

    for cycle in 0..40u64 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("producer keeps the filled queue moving");
        // SAFETY: consumer lock held; the producer submitted before we
        // acquired.
        let data = unsafe { buffer.as_slice() };
        assert_eq!(stamped_index(data), cycle % 10, "cycle {cycle}");
        assert!(data[8..].iter().all(|&b| b == (cycle % 10) as u8));
        assert!(buffer.has_image_metadata());
        pool.release_filled(&buffer).unwrap();
    }

    assert!(line.produced_frames() >= 40);
    assert_eq!(line.skipped_frames(), 0);
    assert!(line.average_fps() > 0.0);
    line.stop();
    assert!(!line.is_running());
}

/// Bounded (non-loop) run: the producers stop exactly at the last frame.
#[test]
#[serial]
fn bounded_run_produces_each_frame_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 12, FIXTURE_FRAME_SIZE);
    let config = raw_config(&path, 4, "s1-bounded").with_worker_type(WorkerType::MmapRaw);

    let mut line = ProductionLine::new(false, 1, false);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();

    let mut seen = Vec::new();
    while seen.len() < 12 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("all twelve frames arrive");
        // SAFETY: consumer lock held.
        seen.push(stamped_index(unsafe { buffer.as_slice() }));
        pool.release_filled(&buffer).unwrap();
    }
    assert_eq!(seen, (0..12).collect::<Vec<u64>>());

    // The cursor is exhausted; no thirteenth frame can appear.
    assert!(pool.acquire_filled(true, Some(Duration::from_millis(200))).is_err());
    line.stop();
    assert_eq!(line.produced_frames(), 12);
}

/// Several producers over one pool still deliver every frame, just not in a
/// guaranteed order.
#[test]
#[serial]
fn multi_producer_loop_covers_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 8, FIXTURE_FRAME_SIZE);
    let config = raw_config(&path, 6, "multi-prod").with_worker_type(WorkerType::MmapRaw);

    let mut line = ProductionLine::new(true, 3, false);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();

    let mut counts = [0u32; 8];
    for _ in 0..64 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("producers keep up");
        // SAFETY: consumer lock held.
        let index = stamped_index(unsafe { buffer.as_slice() });
        counts[index as usize] += 1;
        pool.release_filled(&buffer).unwrap();
    }
    line.stop();

    assert!(counts.iter().all(|&c| c > 0), "coverage: {counts:?}");
    assert_eq!(line.skipped_frames(), 0);
}

/// The batched-read worker feeds the same pipeline shape.
#[test]
#[serial]
fn async_raw_worker_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 10, FIXTURE_FRAME_SIZE);
    let config = raw_config(&path, 4, "async-line").with_worker_type(WorkerType::AsyncRaw);

    let mut line = ProductionLine::new(true, 2, false);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();

    let mut consumed = 0;
    while consumed < 30 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("async reads keep flowing");
        // SAFETY: consumer lock held.
        let index = stamped_index(unsafe { buffer.as_slice() });
        assert!(index < 10);
        pool.release_filled(&buffer).unwrap();
        consumed += 1;
    }
    line.stop();
    assert!(line.produced_frames() >= 30);
}

/// Software decode (synthetic source) through the line: fill-style worker
/// with decoder-provided image metadata.
#[test]
#[serial]
fn software_decode_end_to_end() {
    let mut config = frameline::worker::WorkerConfig::source("synthetic:frames=20");
    config.output.width = 16;
    config.output.height = 4;
    config.pool.name = "decode-line".into();
    config.worker_type = WorkerType::DecodeFile;

    let mut line = ProductionLine::new(false, 1, false);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();

    for expected in 0..20u64 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("decoded frames arrive");
        // SAFETY: consumer lock held.
        assert_eq!(stamped_index(unsafe { buffer.as_slice() }), expected);
        let meta = buffer.image_metadata().expect("decoder metadata");
        assert_eq!(meta.width, 16);
        assert_eq!(meta.height, 4);
        pool.release_filled(&buffer).unwrap();
    }
    line.stop();
    assert_eq!(line.produced_frames(), 20);
}

/// A stopped line joins its producers promptly even while they are blocked
/// on a full pool.
#[test]
#[serial]
fn stop_returns_promptly_under_backpressure() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 10, FIXTURE_FRAME_SIZE);
    let config = raw_config(&path, 2, "stop-fast").with_worker_type(WorkerType::MmapRaw);

    let mut line = ProductionLine::new(true, 2, false);
    line.start(&config).unwrap();
    // Nobody consumes: the free queue runs dry and the producers block.
    std::thread::sleep(Duration::from_millis(150));

    let begin = Instant::now();
    line.stop();
    assert!(
        begin.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        begin.elapsed()
    );
    // Exactly buffer_count frames could be produced before starvation.
    assert_eq!(line.produced_frames(), 2);
}

/// The monitor rides along without disturbing production.
#[test]
#[serial]
fn monitored_line_produces_normally() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw_fixture(&dir, 6, FIXTURE_FRAME_SIZE);
    let config = raw_config(&path, 4, "monitored").with_worker_type(WorkerType::MmapRaw);

    let mut line = ProductionLine::new(true, 1, true);
    line.start(&config).unwrap();
    let pool = registry().get_pool(line.working_pool_id()).upgrade().unwrap();
    for _ in 0..12 {
        let buffer = pool
            .acquire_filled(true, Some(Duration::from_secs(5)))
            .expect("frames arrive");
        pool.release_filled(&buffer).unwrap();
    }
    line.stop();
    assert!(line.produced_frames() >= 12);
}
