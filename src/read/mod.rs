//! Table reads
//!
//! A read is driven by a [`TableReader`], which resumes the stream after
//! transient failures using the bookkeeping in [`ReadSession`]. Large static
//! tables can instead be split into row partitions and read concurrently by
//! a [`ParallelTableReader`].

mod parallel;
mod reader;
mod session;

pub use parallel::*;
pub use reader::*;
pub use session::*;
