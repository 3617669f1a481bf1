//! # frameline
//!
//! A zero-copy video frame production pipeline for embedded Linux. Frames
//! flow from a producer (raw file, encoded file, RTSP stream) into
//! pre-allocated buffers and on to a DMA-capable display consumer without
//! intermediate staging copies wherever the hardware allows it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ fill/inject ┌─────────────────────┐ acquire_filled ┌──────────┐
//! │  Worker      │────────────▶│  BufferPool         │───────────────▶│ Consumer │
//! │ (mmap/async/ │             │  free ⇄ filled      │                │ (display)│
//! │ decode/rtsp) │◀────────────│  FIFO + condvars    │◀───────────────│          │
//! └──────┬───────┘ acquire_free└─────────┬───────────┘ release_filled └──────────┘
//!        │ creates via                   │ owned by
//! ┌──────▼───────┐             ┌─────────▼───────────┐
//! │  Allocator   │────────────▶│  PoolRegistry       │
//! │ (normal/     │  registers  │  (process-global,   │
//! │ decoder/fb)  │             │  sole strong owner) │
//! └──────────────┘             └─────────────────────┘
//! ```
//!
//! The [`line::ProductionLine`] spawns the producer threads that drive a
//! worker; consumers run in their own threads and reach the pool through the
//! registry:
//!
//! ```no_run
//! use std::time::Duration;
//! use frameline::buffer::registry;
//! use frameline::line::ProductionLine;
//! use frameline::worker::WorkerConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut line = ProductionLine::new(true, 1, false);
//! line.start(&WorkerConfig::raw_file("video.raw", 1920, 1080, 32))?;
//!
//! let pool = registry()
//!     .get_pool(line.working_pool_id())
//!     .upgrade()
//!     .expect("pool is alive while the line runs");
//! for _ in 0..60 {
//!     if let Ok(frame) = pool.acquire_filled(true, Some(Duration::from_millis(100))) {
//!         // present frame.plane_data(0) / frame.physical_address() ...
//!         pool.release_filled(&frame)?;
//!     }
//! }
//! line.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Ownership model
//!
//! - Allocators create and destroy buffers; pools only schedule them.
//! - The registry holds the single strong reference to every pool; all other
//!   holders upgrade weak observers per use, so teardown can never race a
//!   consumer into a torn pool.
//! - Buffers wrap heap, device, or decoder-owned memory behind one ownership
//!   tag, which is what lets a single scheduler serve all three.
//!
//! ## Feature flags
//!
//! - `gst` — GStreamer-backed decoding for encoded files and RTSP (Linux).
//!   Without it the raw-file workers and the synthetic decoder still work.

pub mod alloc;
pub mod buffer;
pub mod decode;
pub mod error;
pub mod line;
pub mod monitor;
pub mod worker;

pub use buffer::{Buffer, BufferPool, BufferState, Ownership};
pub use error::{
    AcquireError, AcquireResult, AllocError, AllocResult, PoolError, PoolResult, WorkerError,
    WorkerResult,
};
pub use line::ProductionLine;
pub use worker::{WorkerConfig, WorkerType};
