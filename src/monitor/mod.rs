//! Off-data-path instrumentation: a deadline-heap [`Timer`] and a dynamic
//! [`PerformanceMonitor`] built on top of it.

mod performance;
mod timer;

pub use performance::PerformanceMonitor;
pub use timer::{Timer, TimerId};
