//! The buffer plane: per-frame buffers, the double-queue pool scheduler, and
//! the process-wide pool registry.
//!
//! Ownership is split three ways, and the split is the design:
//!
//! - **Buffers** are created and destroyed by an allocator
//!   ([`crate::alloc`]); pools only schedule them.
//! - **Pools** are owned strongly by the [`registry`] and by nothing else;
//!   every other holder uses a [`std::sync::Weak`] observer.
//! - **The registry** is process-global and never destroys a pool on its own;
//!   only the creating allocator's teardown unregisters.

mod buffer;
mod pool;
mod registry;

pub use buffer::{Buffer, BufferState, ImageMetadata, Ownership};
pub use pool::{BufferPool, QueueKind};
pub use registry::{BufferPoolRegistry, GlobalStats, global as registry};

pub(crate) use pool::AllocatorKey;
