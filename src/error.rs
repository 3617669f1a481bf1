//! Error types for the buffer plane and the production line.
//!
//! The error surface mirrors how failures are actually handled at runtime:
//!
//! - **Contract violations** (`PoolError`) are programmer errors — a buffer
//!   submitted to a pool it does not belong to, a double release. They are
//!   logged loudly at the point of detection and returned to the caller; they
//!   never unwind the pool.
//! - **Resource exhaustion** (`AcquireError`, `AllocError::OutOfMemory`) is
//!   an expected condition surfaced as a recoverable error; the production
//!   line tracks it in its skip counters.
//! - **Lifecycle races** (`AllocError::PoolGone`) mean an observer upgrade
//!   failed because the pool was unregistered. Callers treat this as an
//!   orderly shutdown signal and exit their loops.
//! - **Worker failures** (`WorkerError`) cover I/O and decode problems on the
//!   data path. The line releases the buffer back to the free queue, bumps
//!   `skipped_frames` and continues; the pipeline degrades instead of
//!   terminating.

use thiserror::Error;

use crate::buffer::BufferState;

/// Why a blocking or non-blocking acquire returned without a buffer.
///
/// Callers need to distinguish a timeout (re-check the running flag and try
/// again) from a shutdown (exit the loop), so this is not collapsed into a
/// plain `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The queue was empty and `blocking = false` was requested.
    #[error("queue empty and non-blocking acquire requested")]
    WouldBlock,

    /// The timeout elapsed before a buffer became available.
    #[error("timed out waiting for a buffer")]
    TimedOut,

    /// The pool's running flag has been cleared; all waiters were woken.
    #[error("pool is shutting down")]
    ShutDown,
}

/// Contract violations and data errors raised by [`crate::buffer::BufferPool`]
/// and [`crate::buffer::Buffer`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The buffer is not in this pool's managed set.
    #[error("buffer {id} is not managed by pool '{pool}'")]
    NotManaged { id: u32, pool: String },

    /// The buffer is already in this pool's managed set.
    #[error("buffer {id} is already managed by pool '{pool}'")]
    AlreadyManaged { id: u32, pool: String },

    /// The buffer was in the wrong lifecycle state for the requested
    /// transition (e.g. a double submit).
    #[error("buffer {id} is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        id: u32,
        expected: BufferState,
        actual: BufferState,
    },

    /// Removal was requested for a buffer that is not sitting idle in the
    /// free queue.
    #[error("buffer {id} is checked out or filled; only idle buffers can be removed")]
    NotIdle { id: u32 },

    /// A write would overrun the buffer's memory.
    #[error("write of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    Oversized { len: usize, capacity: usize },

    /// The buffer has no CPU-visible mapping (DMA-only memory).
    #[error("buffer has no CPU-visible virtual address")]
    NoVirtualAddress,
}

/// Failures in allocator operations and registry interactions.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The underlying memory allocation failed.
    #[error("allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    /// Size/alignment combination was not representable.
    #[error("invalid allocation layout: {0}")]
    Layout(String),

    /// Zero-sized buffers are never admitted to a pool.
    #[error("zero-sized buffer rejected")]
    ZeroSize,

    /// The observer upgrade failed; the pool has been unregistered.
    #[error("pool {0} is no longer registered")]
    PoolGone(u64),

    /// This allocator variant does not implement the requested operation.
    #[error("operation not supported by this allocator: {0}")]
    Unsupported(&'static str),

    /// No framebuffer surface descriptor exists at the requested index.
    #[error("no surface descriptor at index {index}")]
    NoDescriptor { index: usize },

    /// The registry refused the registration.
    #[error("pool registration rejected: {0}")]
    Registry(&'static str),

    /// A pool-level contract violation bubbled up through the allocator.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Data-path failures inside a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker has not been opened, or has been closed.
    #[error("worker is not open")]
    NotOpen,

    /// A frame index beyond the source's range was requested.
    #[error("frame index {index} out of range (total {total})")]
    OutOfRange { index: u64, total: u64 },

    /// The provided buffer cannot hold one frame.
    #[error("buffer too small: frame needs {need} bytes, buffer holds {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// This worker fills caller-provided buffers; `fill_buffer` was driven
    /// without one.
    #[error("worker fills external buffers; none was provided")]
    NeedsBuffer,

    /// This worker injects its own buffers; an external buffer was provided.
    #[error("worker injects frames; external buffer not accepted")]
    InjectionOnly,

    /// The decoder reported a failure for this frame.
    #[error("decode failed: {0}")]
    Decode(String),

    /// No frame arrived from the ingest side within the drive deadline.
    #[error("no frame available within deadline")]
    Starved,

    /// Injection was withheld because the filled queue is at its soft limit.
    #[error("filled queue at soft limit ({limit}); frame dropped")]
    Backpressure { limit: usize },

    /// The source has no more frames.
    #[error("source exhausted")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result of a blocking or non-blocking acquire.
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Result of a pool scheduling operation.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result of an allocator or registry operation.
pub type AllocResult<T> = Result<T, AllocError>;

/// Result of a worker data-path operation.
pub type WorkerResult<T> = Result<T, WorkerError>;
