//! Table writes
//!
//! Input is framed into rows and packed into [`WriteChunk`]s. A
//! [`ChunkedTableWriter`] uploads them one after another with per-chunk
//! retries; a [`ParallelTableWriter`] uploads them concurrently into
//! temporary tables and concatenates those into the destination.

mod chunker;
mod parallel;
mod pipeline;

pub use chunker::*;
pub use parallel::*;
pub use pipeline::*;
