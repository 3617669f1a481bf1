//! Worker facade.
//!
//! Offers the same operations as a concrete worker but owns one internally,
//! resolved by the factory at open time (AUTO probing needs the source path).
//! Callers — the production line above all — never name a concrete worker
//! type, so the implementation can change without touching them.

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use super::{Worker, WorkerConfig, WorkerFactory, WorkerType};
use crate::buffer::Buffer;
use crate::error::{WorkerError, WorkerResult};

pub struct WorkerFacade {
    preferred: WorkerType,
    worker: Option<Box<dyn Worker>>,
}

impl WorkerFacade {
    /// Facade with a preferred worker type; `Auto` probes at open.
    pub fn new(preferred: WorkerType) -> Self {
        Self {
            preferred,
            worker: None,
        }
    }

    /// Change the preferred type. Takes effect at the next `open`.
    pub fn set_worker_type(&mut self, preferred: WorkerType) {
        self.preferred = preferred;
    }

    /// Resolve, construct, and open the concrete worker.
    pub fn open(&mut self, config: &WorkerConfig) -> anyhow::Result<()> {
        let resolved = WorkerFactory::resolve(self.preferred, config);
        let mut worker = WorkerFactory::create_by_kind(resolved);
        worker
            .open(config)
            .with_context(|| format!("open {} worker", worker.worker_type()))?;
        debug!(worker = worker.worker_type(), "facade bound");
        self.worker = Some(worker);
        Ok(())
    }

    pub fn close(&self) {
        if let Some(worker) = &self.worker {
            worker.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_open())
    }

    pub fn fill_buffer(
        &self,
        frame_index: u64,
        buffer: Option<&Arc<Buffer>>,
    ) -> WorkerResult<()> {
        self.inner()?.fill_buffer(frame_index, buffer)
    }

    pub fn worker_type(&self) -> &'static str {
        self.worker
            .as_ref()
            .map(|w| w.worker_type())
            .unwrap_or("unbound")
    }

    pub fn source_path(&self) -> &str {
        self.worker.as_ref().map(|w| w.source_path()).unwrap_or("")
    }

    pub fn output_pool_id(&self) -> u64 {
        self.worker.as_ref().map(|w| w.output_pool_id()).unwrap_or(0)
    }

    pub fn needs_external_buffer(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| w.needs_external_buffer())
            .unwrap_or(true)
    }

    pub fn seek(&self, frame_index: u64) -> bool {
        self.worker.as_ref().is_some_and(|w| w.seek(frame_index))
    }

    pub fn seek_to_begin(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.seek_to_begin())
    }

    pub fn seek_to_end(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.seek_to_end())
    }

    pub fn skip(&self, delta: i64) -> bool {
        self.worker.as_ref().is_some_and(|w| w.skip(delta))
    }

    pub fn current_frame_index(&self) -> u64 {
        self.worker.as_ref().map(|w| w.current_frame_index()).unwrap_or(0)
    }

    pub fn total_frames(&self) -> u64 {
        self.worker.as_ref().map(|w| w.total_frames()).unwrap_or(0)
    }

    pub fn has_more_frames(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.has_more_frames())
    }

    pub fn is_at_end(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_at_end())
    }

    pub fn width(&self) -> u32 {
        self.worker.as_ref().map(|w| w.width()).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.worker.as_ref().map(|w| w.height()).unwrap_or(0)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.worker.as_ref().map(|w| w.bytes_per_pixel()).unwrap_or(0)
    }

    pub fn frame_size(&self) -> usize {
        self.worker.as_ref().map(|w| w.frame_size()).unwrap_or(0)
    }

    pub fn file_size(&self) -> u64 {
        self.worker.as_ref().map(|w| w.file_size()).unwrap_or(0)
    }

    fn inner(&self) -> WorkerResult<&dyn Worker> {
        self.worker.as_deref().ok_or(WorkerError::NotOpen)
    }
}

impl std::fmt::Debug for WorkerFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFacade")
            .field("preferred", &self.preferred)
            .field("bound", &self.worker_type())
            .finish()
    }
}
