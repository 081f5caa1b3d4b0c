//! Parallel writes through temporary tables
//!
//! Every chunk is uploaded by its own worker into a fresh temporary table.
//! Once all chunks are stored the temporaries are concatenated into the
//! destination in chunk order with a single call, so the destination is
//! never left holding part of the input. On failure or cancellation the
//! workers are aborted and every temporary is removed.

use super::chunker::{chunk_rows, chunk_stream, WriteChunk};
use super::pipeline::{
    create_temp_table, prepare_destination, temp_table_path, write_chunk, write_destination,
    WriterOptions, WriteSummary,
};
use crate::cancel::{until_cancelled, CancellationToken};
use crate::error::{Result, TransferError};
use crate::retry::Retrier;
use crate::service::{ByteStream, TableService, WriteRequest};
use crate::table::{TableFormat, TablePath};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Chunk stored in its temporary table
#[derive(Debug)]
struct StoredChunk {
    chunk: WriteChunk,
    retries: u32,
}

/// Writes chunks concurrently and concatenates them into the destination
pub struct ParallelTableWriter {
    service: Arc<dyn TableService>,
    destination: TablePath,
    format: TableFormat,
    options: WriterOptions,
    max_workers: usize,
}

impl std::fmt::Debug for ParallelTableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTableWriter")
            .field("destination", &self.destination)
            .field("max_workers", &self.max_workers)
            .field("temp_directory", &self.options.temp_directory)
            .finish_non_exhaustive()
    }
}

impl ParallelTableWriter {
    /// Prepare a parallel write to `destination`
    pub fn new(
        service: Arc<dyn TableService>,
        destination: TablePath,
        format: TableFormat,
        options: WriterOptions,
        max_workers: usize,
    ) -> Result<Self> {
        Ok(Self {
            service,
            destination: write_destination(destination)?,
            format,
            options,
            max_workers: max_workers.max(1),
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

    /// Upload chunks into temporaries, then concatenate them in order
    pub async fn write_chunks(
        &self,
        chunks: BoxStream<'static, Result<WriteChunk>>,
    ) -> Result<WriteSummary> {
        let started = Instant::now();
        let retrier = self.options.retrier();
        let mut temps = BTreeMap::new();

        let stored = match self.store_chunks(chunks, &retrier, &mut temps).await {
            Ok(stored) => stored,
            Err(error) => {
                self.remove_temps(&temps).await;
                return Err(error);
            }
        };

        let result = self.commit(&temps, &retrier).await;
        self.remove_temps(&temps).await;
        result?;

        let mut summary = WriteSummary::default();
        for item in stored.values() {
            summary.record(&item.chunk, item.retries);
        }
        summary.duration = started.elapsed();
        tracing::info!(
            "Wrote {} through {} temporary tables: {}",
            self.destination.path,
            temps.len(),
            summary.summary()
        );
        Ok(summary)
    }

    /// Run the workers. Every temporary name handed out is recorded in
    /// `temps` before its worker starts, so cleanup sees all of them.
    async fn store_chunks(
        &self,
        mut chunks: BoxStream<'static, Result<WriteChunk>>,
        retrier: &Retrier,
        temps: &mut BTreeMap<u64, String>,
    ) -> Result<BTreeMap<u64, StoredChunk>> {
        let cancel = self.options.cancel.as_ref();
        let mut tasks: JoinSet<(u64, Result<StoredChunk>)> = JoinSet::new();
        let mut stored = BTreeMap::new();
        let mut input_done = false;

        let outcome: Result<()> = async {
            loop {
                while !input_done && tasks.len() < self.max_workers {
                    match until_cancelled(cancel, chunks.try_next()).await? {
                        Some(chunk) => {
                            let temp = temp_table_path(&self.options.temp_directory);
                            temps.insert(chunk.sequence, temp.clone());
                            tasks.spawn(self.worker(temp, chunk, retrier.clone()));
                        }
                        None => input_done = true,
                    }
                }

                let Some(joined) = join_next(&mut tasks, cancel).await? else {
                    return Ok(());
                };
                let (sequence, result) = joined.map_err(|e| {
                    TransferError::protocol(format!("write worker panicked: {}", e))
                })?;
                match result {
                    Ok(chunk) => {
                        if let Some(progress) = &self.options.progress {
                            progress.add_chunk();
                            progress.add_rows(chunk.chunk.row_count, chunk.chunk.payload.len() as u64);
                            progress.add_retries(u64::from(chunk.retries));
                        }
                        stored.insert(sequence, chunk);
                    }
                    Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                    Err(error) => {
                        tracing::warn!(
                            "Chunk {} of {} failed: {}. Aborting {} workers",
                            sequence,
                            self.destination.path,
                            error,
                            tasks.len()
                        );
                        return Err(TransferError::PartialWorkerFailure {
                            partition: sequence as usize,
                            completed: stored.len(),
                            total: temps.len(),
                            source: Box::new(error),
                        });
                    }
                }
            }
        }
        .await;

        if let Err(error) = outcome {
            // Wait for aborted workers so none creates a table after cleanup
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(error);
        }
        Ok(stored)
    }

    fn worker(
        &self,
        temp: String,
        chunk: WriteChunk,
        retrier: Retrier,
    ) -> impl std::future::Future<Output = (u64, Result<StoredChunk>)> + Send + 'static {
        let service = Arc::clone(&self.service);
        let format = self.format;
        async move {
            let sequence = chunk.sequence;
            let result = async {
                create_temp_table(service.as_ref(), &temp, &retrier).await?;
                let request = WriteRequest {
                    path: TablePath::new(temp.as_str()),
                    format,
                };
                let retries = write_chunk(service.as_ref(), &request, &chunk, &retrier).await?;
                Ok(retries)
            }
            .await;
            (sequence, result.map(|retries| StoredChunk { chunk, retries }))
        }
    }

    /// Prepare the destination and concatenate the temporaries into it
    async fn commit(&self, temps: &BTreeMap<u64, String>, retrier: &Retrier) -> Result<()> {
        let cancel = self.options.cancel.as_ref();
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(TransferError::Cancelled);
        }

        let destination = &self.destination.path;
        if self.options.force_create {
            prepare_destination(self.service.as_ref(), destination, retrier).await?;
        }

        let sources: Vec<String> = temps.values().cloned().collect();
        tracing::debug!("Concatenating {} temporary tables into {}", sources.len(), destination);
        retrier
            .run(&format!("concatenate into {}", destination), || {
                self.service.concatenate(&sources, &self.destination)
            })
            .await?;
        Ok(())
    }

    async fn remove_temps(&self, temps: &BTreeMap<u64, String>) {
        for temp in temps.values() {
            if let Err(e) = self.service.remove(temp, true).await {
                tracing::warn!("Failed to remove temporary table {}: {}", temp, e);
            }
        }
    }
}

async fn join_next<T: 'static>(
    tasks: &mut JoinSet<T>,
    cancel: Option<&CancellationToken>,
) -> Result<Option<std::result::Result<T, tokio::task::JoinError>>> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Cancelled),
            joined = tasks.join_next() => Ok(joined),
        },
        None => Ok(tasks.join_next().await),
    }
}
