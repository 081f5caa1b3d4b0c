//! Table model
//!
//! Paths, ranges and formats shared by the read and write pipelines.

mod format;
mod path;

pub use format::*;
pub use path::*;
