//! # tablecopy - Resumable Bulk Table Transfer
//!
//! tablecopy moves large row-oriented tables to and from a remote table
//! service over streaming HTTP. Transient network failures are absorbed
//! without losing or duplicating rows and without restarting the transfer.
//!
//! ## Features
//!
//! - **Resumable Reads**: A dropped connection resumes at the next undelivered row
//! - **Multi-Range Reads**: Range boundaries are tracked through in-band control rows
//! - **Chunked Writes**: Uploads are split into chunks retried independently
//! - **Parallel Transfers**: Row partitions read concurrently, chunks written
//!   through temporary tables and concatenated in order
//! - **Cancellation**: Every wait observes a [`CancellationToken`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use tablecopy::prelude::*;
//! use futures::TryStreamExt;
//!
//! # async fn run() -> tablecopy::Result<()> {
//! let mut config = TransferConfig::default();
//! config.proxy.url = "http://proxy.example.net".into();
//! let client = TableClient::from_config(config)?;
//!
//! let stream = client
//!     .read_table(TablePath::new("//home/logs"), ReadOptions::default())
//!     .await?;
//! let rows: Vec<ReadItem> = stream.into_stream().try_collect().await?;
//! println!("Read {} rows", rows.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Writing
//!
//! ```no_run
//! use tablecopy::prelude::*;
//!
//! # async fn run(client: TableClient) -> tablecopy::Result<()> {
//! let rows = ["{id=1}", "{id=2}"];
//! let summary = client
//!     .write_rows(TablePath::new("//home/out"), rows, WriteOptions::default())
//!     .await?;
//! println!("{}", summary.summary());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod progress;
pub mod read;
pub mod retry;
pub mod service;
pub mod table;
pub mod write;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::{ReadOptions, TableClient, TableReadStream, WriteOptions};
pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use table::{Range, TableFormat, TablePath};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use tablecopy::prelude::*;
    //! ```

    pub use crate::cancel::CancellationToken;
    pub use crate::client::{ReadOptions, TableClient, TableReadStream, WriteOptions};
    pub use crate::codec::{ControlMarker, ControlRowCodec};
    pub use crate::config::TransferConfig;
    pub use crate::error::{Result, TransferError};
    pub use crate::logging::{init_tracing, LogFormat};
    pub use crate::progress::TransferProgress;
    pub use crate::read::{ReadItem, TableReader};
    pub use crate::retry::{DefaultRetryPolicy, RetryConfig, RetryPolicy};
    pub use crate::service::{
        ControlAttributes, HttpProxyClient, InMemoryTableService, TableService,
    };
    pub use crate::table::{Range, ReadLimit, TableFormat, TablePath};
    pub use crate::write::{WriteChunk, WriteSummary};
}
