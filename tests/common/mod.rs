//! Shared fixtures for the integration tests.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use frameline::worker::WorkerConfig;

/// Raw video fixture: `frames` frames of `frame_size` bytes. Frame `i` is
/// filled with byte `i` and stamped with the index in its first 8 bytes, so
/// consumers can verify exactly which frame they received.
pub fn write_raw_fixture(dir: &tempfile::TempDir, frames: u64, frame_size: usize) -> PathBuf {
    let path = dir.path().join("fixture.raw");
    let mut file = File::create(&path).expect("create fixture");
    for i in 0..frames {
        let mut frame = vec![i as u8; frame_size];
        frame[..8].copy_from_slice(&i.to_le_bytes());
        file.write_all(&frame).expect("write fixture frame");
    }
    path
}

/// Recover the frame index stamped into fixture frame bytes.
pub fn stamped_index(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[..8].try_into().expect("stamp"))
}

/// Config over a fixture written by [`write_raw_fixture`] with 256-byte
/// frames (16×4 at 32 bpp).
pub fn raw_config(path: &std::path::Path, buffers: usize, name: &str) -> WorkerConfig {
    WorkerConfig::raw_file(path.to_str().expect("utf-8 path"), 16, 4, 32)
        .with_buffers(buffers)
        .with_pool_name(name, "Test")
}

pub const FIXTURE_FRAME_SIZE: usize = 256;
