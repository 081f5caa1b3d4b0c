//! Storage service interface
//!
//! Everything the transfer engine needs from the remote side goes through
//! [`TableService`]. Two implementations ship with the crate: an in-process
//! [`InMemoryTableService`] and the [`HttpProxyClient`] talking to an HTTP
//! proxy.

mod http;
mod memory;

pub use http::*;
pub use memory::*;

use crate::error::Result;
use crate::table::{TableFormat, TablePath};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Response body as a stream of buffers
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Optional features of a service deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceCapabilities {
    /// Reads announce range boundaries with `range_index` control rows
    pub range_index_reporting: bool,
}

/// Control rows requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlAttributes {
    /// Emit `row_index` control rows
    #[serde(default)]
    pub enable_row_index: bool,
    /// Emit `range_index` control rows
    #[serde(default)]
    pub enable_range_index: bool,
    /// Emit `table_index` control rows
    #[serde(default)]
    pub enable_table_index: bool,
}

impl ControlAttributes {
    /// Whether any control row is requested
    pub fn any(&self) -> bool {
        self.enable_row_index || self.enable_range_index || self.enable_table_index
    }
}

/// One read call
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Table and ranges to read
    pub path: TablePath,
    /// Wire format of the body
    pub format: TableFormat,
    /// Control rows to include in the body
    pub control_attributes: ControlAttributes,
    /// Rows may come back in any order
    pub unordered: bool,
}

/// Parameters the service returns ahead of the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseParameters {
    /// Row index of the first row in the body
    #[serde(default)]
    pub start_row_index: Option<u64>,
    /// Rows the response is expected to hold
    #[serde(default)]
    pub approximate_row_count: Option<u64>,
}

/// Read response: parameters plus the streamed body
pub struct ReadResponse {
    /// Parameters sent ahead of the body
    pub parameters: ResponseParameters,
    /// Body buffers
    pub body: ByteStream,
}

impl std::fmt::Debug for ReadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResponse")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// One write call
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    /// Destination; its `append` flag selects append or overwrite
    pub path: TablePath,
    /// Wire format of the payload
    pub format: TableFormat,
}

/// Result of the metadata probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableAttributes {
    /// Rows in the table
    pub row_count: u64,
    /// Data size before compression
    pub uncompressed_data_size: u64,
    /// Data size on disk
    pub compressed_data_size: u64,
    /// Chunks backing the table
    pub chunk_count: u64,
    /// Dynamic tables cannot be resumed or partitioned by row index
    pub dynamic: bool,
}

/// Remote table storage
#[async_trait]
pub trait TableService: Send + Sync {
    /// Features of this deployment
    fn capabilities(&self) -> ServiceCapabilities;

    /// Start a streamed read
    async fn read_table(&self, request: &ReadRequest) -> Result<ReadResponse>;

    /// Write one payload; overwrites unless `request.path.append`
    async fn write_table(&self, request: &WriteRequest, payload: Bytes) -> Result<()>;

    /// Create a table. With `ignore_existing` an existing table is kept as is;
    /// without it an existing table is a `DestinationConflict`.
    async fn create_table(&self, path: &str, ignore_existing: bool) -> Result<()>;

    /// Whether a node exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Remove a node; with `force` a missing node is not an error
    async fn remove(&self, path: &str, force: bool) -> Result<()>;

    /// Concatenate `sources` in order into `destination`
    async fn concatenate(&self, sources: &[String], destination: &TablePath) -> Result<()>;

    /// Metadata probe
    async fn get_table_attributes(&self, path: &str) -> Result<TableAttributes>;
}
