//! Worker configuration.
//!
//! One nested record carries everything a worker needs to open its source:
//! the file group, the output geometry group, the decoder group, and the pool
//! shape. All fields have defaults so a config can be built up from
//! `WorkerConfig::default()` or loaded from JSON by the harness.

use serde::{Deserialize, Serialize};

use crate::decode::DecoderSettings;

/// Which worker implementation to build.
///
/// `Auto` probes the source: an `rtsp://` URL selects the RTSP worker, a
/// container extension selects the decode worker, anything else is treated as
/// raw frames. The `FRAMELINE_WORKER` environment variable overrides the
/// probe (values `mmap_raw`, `iouring_raw`/`async_raw`,
/// `ffmpeg_rtsp`/`rtsp`, `ffmpeg_video_file`/`decode_file`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    #[default]
    Auto,
    /// Memory-mapped raw frame file.
    MmapRaw,
    /// Raw frame file via batched positioned reads on reader threads.
    AsyncRaw,
    /// Live RTSP ingest plus decode.
    Rtsp,
    /// Encoded container file through a decoder.
    DecodeFile,
}

/// Source file group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Path or URL of the source.
    pub path: String,
    /// First frame to serve.
    pub start_frame: u64,
    /// Last frame to serve, exclusive; -1 = through the end.
    pub end_frame: i64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            start_frame: 0,
            end_frame: -1,
        }
    }
}

/// Output geometry group. Raw sources require all three fields; decoders fall
/// back to the stream's own geometry when a field is zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

/// Shape of the pool a worker creates in `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers to pre-allocate for fill-style workers. For injection-style
    /// workers this is the ingest depth instead (outstanding decoded frames).
    pub buffer_count: usize,
    pub name: String,
    pub category: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            name: "frameline".to_string(),
            category: "Video".to_string(),
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub file: FileConfig,
    pub output: OutputConfig,
    pub decoder: DecoderSettings,
    pub pool: PoolConfig,
    pub worker_type: WorkerType,
}

impl WorkerConfig {
    /// Config for a raw frame file with the given geometry.
    pub fn raw_file(path: impl Into<String>, width: u32, height: u32, bits_per_pixel: u32) -> Self {
        Self {
            file: FileConfig {
                path: path.into(),
                ..FileConfig::default()
            },
            output: OutputConfig {
                width,
                height,
                bits_per_pixel,
            },
            ..Self::default()
        }
    }

    /// Config for an encoded file or stream URL; geometry comes from the
    /// decoder unless overridden.
    pub fn source(path: impl Into<String>) -> Self {
        Self {
            file: FileConfig {
                path: path.into(),
                ..FileConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    pub fn with_buffers(mut self, count: usize) -> Self {
        self.pool.buffer_count = count;
        self
    }

    pub fn with_pool_name(mut self, name: impl Into<String>, category: impl Into<String>) -> Self {
        self.pool.name = name.into();
        self.pool.category = category.into();
        self
    }

    /// Raw frame size implied by the output group; 0 when under-specified.
    pub fn raw_frame_size(&self) -> usize {
        (self.output.width as usize * self.output.height as usize * self.output.bits_per_pixel as usize)
            / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_type, WorkerType::Auto);
        assert_eq!(config.file.end_frame, -1);
        assert_eq!(config.pool.buffer_count, 4);
        assert!(!config.decoder.enable_hardware);
    }

    #[test]
    fn raw_frame_size_from_geometry() {
        let config = WorkerConfig::raw_file("a.raw", 1920, 1080, 32);
        assert_eq!(config.raw_frame_size(), 1920 * 1080 * 4);
    }

    #[test]
    fn json_round_trip() {
        let config = WorkerConfig::raw_file("a.raw", 64, 32, 24)
            .with_worker_type(WorkerType::MmapRaw)
            .with_buffers(8);
        let json = serde_json::to_string(&config).unwrap();
        let back: WorkerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_type, WorkerType::MmapRaw);
        assert_eq!(back.pool.buffer_count, 8);
        assert_eq!(back.output.bits_per_pixel, 24);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let back: WorkerConfig =
            serde_json::from_str(r#"{"file": {"path": "x.raw"}, "worker_type": "mmap_raw"}"#)
                .unwrap();
        assert_eq!(back.file.path, "x.raw");
        assert_eq!(back.worker_type, WorkerType::MmapRaw);
        assert_eq!(back.pool.buffer_count, 4);
    }
}
