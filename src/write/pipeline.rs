//! Chunked write pipeline
//!
//! Chunks are uploaded one at a time and each is retried on its own with
//! exponential backoff. A single chunk goes straight to the destination
//! with the caller's append flag. Longer inputs are staged in a temporary
//! table, whose first chunk truncates it again on retry while later chunks
//! append, and are then concatenated into the destination in one call. A
//! failed or cancelled write leaves the destination as it was.

use super::chunker::{chunk_rows, chunk_stream, ChunkBuilder, WriteChunk};
use crate::cancel::{until_cancelled, CancellationToken};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::progress::TransferProgress;
use crate::retry::{Deadline, DefaultRetryPolicy, Retrier, RetryConfig, RetryPolicy};
use crate::service::{ByteStream, TableService, WriteRequest};
use crate::table::{TableFormat, TablePath};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use humansize::{format_size, BINARY};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a write chunks, retries and reports
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Retry failed chunks; without retries the input is sent as one chunk
    pub retries_enabled: bool,
    /// Byte bound of a chunk
    pub chunk_size: u64,
    /// Row bound of a chunk
    pub rows_chunk_size: u64,
    /// Backoff between attempts
    pub retry: RetryConfig,
    /// Which failures are retried
    pub policy: Arc<dyn RetryPolicy>,
    /// Create the destination when it does not exist
    pub force_create: bool,
    /// Directory holding temporary tables
    pub temp_directory: String,
    /// Limit for a single attempt
    pub attempt_timeout: Option<Duration>,
    /// No attempt starts after this point
    pub deadline: Option<Deadline>,
    /// Stops the write between chunks and during backoff
    pub cancel: Option<CancellationToken>,
    /// Shared counters updated per stored chunk
    pub progress: Option<Arc<TransferProgress>>,
}

impl WriterOptions {
    /// Options from a transfer configuration
    pub fn from_config(config: &TransferConfig, policy: Arc<dyn RetryPolicy>) -> Self {
        let retries = &config.write_retries;
        Self {
            retries_enabled: retries.enable,
            chunk_size: retries.chunk_size,
            rows_chunk_size: retries.rows_chunk_size,
            retry: retries.retry.clone(),
            policy,
            force_create: true,
            temp_directory: config.write_parallel.temp_directory.clone(),
            attempt_timeout: config.request_timeout(),
            deadline: config.transfer_timeout().map(Deadline::after),
            cancel: None,
            progress: None,
        }
    }

    /// Chunk builder for `format` honoring these bounds
    pub fn chunk_builder(&self, format: &TableFormat) -> ChunkBuilder {
        if self.retries_enabled {
            ChunkBuilder::new(format, self.chunk_size, self.rows_chunk_size)
        } else {
            ChunkBuilder::new(format, u64::MAX, u64::MAX)
        }
    }

    /// Retry loop for one chunk
    pub fn retrier(&self) -> Retrier {
        let config = if self.retries_enabled {
            self.retry.clone()
        } else {
            RetryConfig::no_retry()
        };
        Retrier::new(config, Arc::clone(&self.policy))
            .with_attempt_timeout(self.attempt_timeout)
            .with_deadline(self.deadline)
            .with_cancel(self.cancel.clone())
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), Arc::new(DefaultRetryPolicy::default()))
    }
}

/// Outcome of a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    /// Chunks stored
    pub chunks: u64,
    /// Rows stored
    pub rows: u64,
    /// Payload bytes stored
    pub bytes: u64,
    /// Failed attempts that were retried
    pub retries: u64,
    /// Wall time of the write
    pub duration: Duration,
}

impl WriteSummary {
    pub(crate) fn record(&mut self, chunk: &WriteChunk, retries: u32) {
        self.chunks += 1;
        self.rows += chunk.row_count;
        self.bytes += chunk.payload.len() as u64;
        self.retries += u64::from(retries);
    }

    /// Human readable one-liner
    pub fn summary(&self) -> String {
        format!(
            "{} rows, {} in {} chunks ({} retries, {:.2}s)",
            self.rows,
            format_size(self.bytes, BINARY),
            self.chunks,
            self.retries,
            self.duration.as_secs_f64()
        )
    }
}

/// Write one chunk with retries. Returns the retries spent.
pub async fn write_chunk(
    service: &dyn TableService,
    request: &WriteRequest,
    chunk: &WriteChunk,
    retrier: &Retrier,
) -> Result<u32> {
    let context = format!("write {} chunk {}", request.path.path, chunk.sequence);
    tracing::debug!(
        "Writing chunk {} ({} rows, {}) to {}",
        chunk.sequence,
        chunk.row_count,
        format_size(chunk.payload.len() as u64, BINARY),
        request.path.path
    );
    let ((), retries) = retrier
        .run(&context, || service.write_table(request, chunk.payload.clone()))
        .await?;
    Ok(retries)
}

/// Fresh temporary table name under `directory`
pub(crate) fn temp_table_path(directory: &str) -> String {
    format!(
        "{}/{:016x}",
        directory.trim_end_matches('/'),
        rand::random::<u64>()
    )
}

/// Create a temporary table with retries.
///
/// Temporary names are unique, so a conflict on a retried attempt can only
/// come from an earlier attempt whose response was lost.
pub(crate) async fn create_temp_table(
    service: &dyn TableService,
    path: &str,
    retrier: &Retrier,
) -> Result<()> {
    let mut attempt = 0u32;
    retrier
        .run(&format!("create {}", path), || {
            let retried = attempt > 0;
            attempt += 1;
            async move {
                match service.create_table(path, false).await {
                    Err(TransferError::DestinationConflict { .. }) if retried => {
                        tracing::debug!("{} was created by an earlier attempt", path);
                        Ok(())
                    }
                    other => other,
                }
            }
        })
        .await?;
    Ok(())
}

/// Create `path` unless it already exists
pub(crate) async fn prepare_destination(
    service: &dyn TableService,
    path: &str,
    retrier: &Retrier,
) -> Result<()> {
    let (exists, _) = retrier
        .run(&format!("check {}", path), || service.exists(path))
        .await?;
    if !exists {
        tracing::debug!("Creating destination {}", path);
        retrier
            .run(&format!("create {}", path), || service.create_table(path, true))
            .await?;
    }
    Ok(())
}

/// Normalize a write destination; ranges make no sense for writes
pub(crate) fn write_destination(path: TablePath) -> Result<TablePath> {
    let path = path.normalized()?;
    if !path.ranges.is_empty() {
        return Err(TransferError::config(format!(
            "cannot write to {} with row ranges",
            path.path
        )));
    }
    Ok(path)
}

/// Sequential chunked writer
pub struct ChunkedTableWriter {
    service: Arc<dyn TableService>,
    destination: TablePath,
    format: TableFormat,
    options: WriterOptions,
}

impl std::fmt::Debug for ChunkedTableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTableWriter")
            .field("destination", &self.destination)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ChunkedTableWriter {
    /// Prepare a write to `destination`
    pub fn new(
        service: Arc<dyn TableService>,
        destination: TablePath,
        format: TableFormat,
        options: WriterOptions,
    ) -> Result<Self> {
        Ok(Self {
            service,
            destination: write_destination(destination)?,
            format,
            options,
        })
    }

    /// Frame, chunk and upload a byte stream
    pub async fn write_stream(&self, input: ByteStream) -> Result<WriteSummary> {
        let chunks = chunk_stream(input, self.options.chunk_builder(&self.format));
        self.write_chunks(chunks).await
    }

    /// Upload a list of row bodies
    pub async fn write_rows<I>(&self, rows: I) -> Result<WriteSummary>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let chunks = chunk_rows(rows, self.options.chunk_builder(&self.format))?;
        self.write_chunks(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
            .await
    }

    /// Upload already built chunks in order
    pub async fn write_chunks(
        &self,
        mut chunks: BoxStream<'static, Result<WriteChunk>>,
    ) -> Result<WriteSummary> {
        let started = Instant::now();
        let cancel = self.options.cancel.as_ref();
        let retrier = self.options.retrier();
        let mut summary = WriteSummary::default();

        let Some(first) = until_cancelled(cancel, chunks.try_next()).await? else {
            self.prepare(&retrier).await?;
            if !self.destination.append {
                let empty = WriteChunk {
                    sequence: 0,
                    payload: Bytes::new(),
                    row_count: 0,
                };
                summary.retries += u64::from(self.write_one(&self.destination, &empty, true, &retrier).await?);
            }
            return Ok(self.finish(summary, started));
        };

        match until_cancelled(cancel, chunks.try_next()).await? {
            None => {
                self.prepare(&retrier).await?;
                let retries = self.write_one(&self.destination, &first, true, &retrier).await?;
                summary.record(&first, retries);
            }
            Some(second) => {
                let temp = temp_table_path(&self.options.temp_directory);
                let result = self
                    .write_staged(&temp, [first, second], chunks, &retrier, &mut summary)
                    .await;
                if let Err(e) = self.service.remove(&temp, true).await {
                    tracing::warn!("Failed to remove temporary table {}: {}", temp, e);
                }
                result?;
            }
        }
        Ok(self.finish(summary, started))
    }

    async fn prepare(&self, retrier: &Retrier) -> Result<()> {
        if self.options.force_create {
            prepare_destination(self.service.as_ref(), &self.destination.path, retrier).await?;
        }
        Ok(())
    }

    /// Store every chunk in `temp`, then move them into the destination
    async fn write_staged(
        &self,
        temp: &str,
        head: [WriteChunk; 2],
        mut rest: BoxStream<'static, Result<WriteChunk>>,
        retrier: &Retrier,
        summary: &mut WriteSummary,
    ) -> Result<()> {
        let cancel = self.options.cancel.as_ref();
        create_temp_table(self.service.as_ref(), temp, retrier).await?;
        let staging = TablePath::new(temp);
        tracing::debug!("Staging {} in {}", self.destination.path, temp);

        for chunk in head {
            let retries = self.write_one(&staging, &chunk, summary.chunks == 0, retrier).await?;
            summary.record(&chunk, retries);
        }
        while let Some(chunk) = until_cancelled(cancel, rest.try_next()).await? {
            let retries = self.write_one(&staging, &chunk, false, retrier).await?;
            summary.record(&chunk, retries);
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(TransferError::Cancelled);
        }
        self.prepare(retrier).await?;
        let sources = [temp.to_string()];
        retrier
            .run(&format!("concatenate into {}", self.destination.path), || {
                self.service.concatenate(&sources, &self.destination)
            })
            .await?;
        Ok(())
    }

    async fn write_one(
        &self,
        target: &TablePath,
        chunk: &WriteChunk,
        first: bool,
        retrier: &Retrier,
    ) -> Result<u32> {
        let request = WriteRequest {
            path: target.clone().with_append(target.append || !first),
            format: self.format,
        };
        let retries = write_chunk(self.service.as_ref(), &request, chunk, retrier).await?;
        if let Some(progress) = &self.options.progress {
            progress.add_chunk();
            progress.add_rows(chunk.row_count, chunk.payload.len() as u64);
            progress.add_retries(u64::from(retries));
        }
        Ok(retries)
    }

    fn finish(&self, mut summary: WriteSummary, started: Instant) -> WriteSummary {
        summary.duration = started.elapsed();
        tracing::info!("Wrote {}: {}", self.destination.path, summary.summary());
        summary
    }
}
