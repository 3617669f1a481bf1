//! Production line: the N-thread driver that turns a worker plus a pool into
//! a continuous fill pipeline.

mod production_line;

pub use production_line::{ErrorCallback, ProductionLine};
