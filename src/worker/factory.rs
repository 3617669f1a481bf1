//! Worker factory: configuration → concrete worker.
//!
//! Selection priority: explicit type in the call or config, then the
//! `FRAMELINE_WORKER` environment variable, then a probe of the source path.

use tracing::{debug, warn};

use super::{
    AsyncRawFileWorker, DecodeFileWorker, MmapRawFileWorker, RtspWorker, Worker, WorkerConfig,
    WorkerType,
};

/// Environment variable overriding AUTO worker selection.
pub const WORKER_TYPE_ENV: &str = "FRAMELINE_WORKER";

/// Extensions treated as encoded containers by the AUTO probe.
const CONTAINER_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "flv", "h264", "h265", "ts"];

pub struct WorkerFactory;

impl WorkerFactory {
    /// Build and return the worker the config asks for (resolving `Auto`).
    pub fn create(config: &WorkerConfig) -> Box<dyn Worker> {
        Self::create_by_kind(Self::resolve(config.worker_type, config))
    }

    /// Build a worker of an explicit kind. `Auto` here falls back to the
    /// mmap worker; resolve first when a config is available.
    pub fn create_by_kind(kind: WorkerType) -> Box<dyn Worker> {
        match kind {
            WorkerType::MmapRaw | WorkerType::Auto => Box::new(MmapRawFileWorker::new()),
            WorkerType::AsyncRaw => Box::new(AsyncRawFileWorker::new()),
            WorkerType::Rtsp => Box::new(RtspWorker::new()),
            WorkerType::DecodeFile => Box::new(DecodeFileWorker::new()),
        }
    }

    /// Map a type name (env-variable vocabulary) to a worker kind.
    pub fn kind_by_name(name: &str) -> Option<WorkerType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mmap_raw" => Some(WorkerType::MmapRaw),
            "iouring_raw" | "async_raw" => Some(WorkerType::AsyncRaw),
            "ffmpeg_rtsp" | "rtsp" => Some(WorkerType::Rtsp),
            "ffmpeg_video_file" | "decode_file" => Some(WorkerType::DecodeFile),
            "auto" => Some(WorkerType::Auto),
            _ => None,
        }
    }

    pub fn type_name(kind: WorkerType) -> &'static str {
        match kind {
            WorkerType::Auto => "auto",
            WorkerType::MmapRaw => "mmap_raw",
            WorkerType::AsyncRaw => "async_raw",
            WorkerType::Rtsp => "rtsp",
            WorkerType::DecodeFile => "decode_file",
        }
    }

    /// Selection priority: explicit preference, then explicit config type,
    /// then environment override, then source probing.
    pub fn resolve(preferred: WorkerType, config: &WorkerConfig) -> WorkerType {
        if preferred != WorkerType::Auto {
            return preferred;
        }
        if config.worker_type != WorkerType::Auto {
            return config.worker_type;
        }
        if let Some(kind) = Self::kind_from_environment() {
            debug!(kind = Self::type_name(kind), "worker type from environment");
            return kind;
        }
        let kind = Self::probe(&config.file.path);
        debug!(
            kind = Self::type_name(kind),
            path = %config.file.path,
            "worker type probed"
        );
        kind
    }

    /// Positioned-read support is unconditional on the platforms this
    /// pipeline targets.
    pub fn is_async_io_available() -> bool {
        cfg!(unix)
    }

    pub fn is_mmap_available() -> bool {
        cfg!(unix)
    }

    fn kind_from_environment() -> Option<WorkerType> {
        let value = std::env::var(WORKER_TYPE_ENV).ok()?;
        match Self::kind_by_name(&value) {
            Some(kind) => Some(kind),
            None => {
                warn!(value, "unrecognized {WORKER_TYPE_ENV} value ignored");
                None
            }
        }
    }

    fn probe(path: &str) -> WorkerType {
        if path.starts_with("rtsp://") || path.starts_with("synthetic:live") {
            return WorkerType::Rtsp;
        }
        if path.starts_with("synthetic") {
            return WorkerType::DecodeFile;
        }
        let extension = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension {
            Some(ext) if CONTAINER_EXTENSIONS.contains(&ext.as_str()) => WorkerType::DecodeFile,
            _ if Self::is_mmap_available() => WorkerType::MmapRaw,
            _ => WorkerType::AsyncRaw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn name_mapping_covers_the_env_vocabulary() {
        assert_eq!(WorkerFactory::kind_by_name("mmap_raw"), Some(WorkerType::MmapRaw));
        assert_eq!(WorkerFactory::kind_by_name("iouring_raw"), Some(WorkerType::AsyncRaw));
        assert_eq!(WorkerFactory::kind_by_name("ffmpeg_rtsp"), Some(WorkerType::Rtsp));
        assert_eq!(
            WorkerFactory::kind_by_name("ffmpeg_video_file"),
            Some(WorkerType::DecodeFile)
        );
        assert_eq!(WorkerFactory::kind_by_name("nonsense"), None);
    }

    #[test]
    fn probe_recognizes_sources() {
        let config = |path: &str| WorkerConfig::source(path);
        assert_eq!(
            WorkerFactory::resolve(WorkerType::Auto, &config("rtsp://cam/stream")),
            WorkerType::Rtsp
        );
        assert_eq!(
            WorkerFactory::resolve(WorkerType::Auto, &config("movie.mp4")),
            WorkerType::DecodeFile
        );
        assert_eq!(
            WorkerFactory::resolve(WorkerType::Auto, &config("frames.raw")),
            WorkerType::MmapRaw
        );
    }

    #[test]
    fn explicit_preference_wins() {
        let config = WorkerConfig::source("movie.mp4");
        assert_eq!(
            WorkerFactory::resolve(WorkerType::AsyncRaw, &config),
            WorkerType::AsyncRaw
        );
    }

    #[test]
    #[serial]
    fn environment_overrides_the_probe() {
        let config = WorkerConfig::source("frames.raw");
        // SAFETY: test runs serially; no other thread reads the environment.
        unsafe { std::env::set_var(WORKER_TYPE_ENV, "iouring_raw") };
        let resolved = WorkerFactory::resolve(WorkerType::Auto, &config);
        // SAFETY: as above.
        unsafe { std::env::remove_var(WORKER_TYPE_ENV) };
        assert_eq!(resolved, WorkerType::AsyncRaw);
    }

    #[test]
    fn factory_builds_every_kind() {
        for kind in [
            WorkerType::MmapRaw,
            WorkerType::AsyncRaw,
            WorkerType::Rtsp,
            WorkerType::DecodeFile,
        ] {
            let worker = WorkerFactory::create_by_kind(kind);
            assert_eq!(worker.worker_type(), WorkerFactory::type_name(kind));
            assert!(!worker.is_open());
        }
    }
}
