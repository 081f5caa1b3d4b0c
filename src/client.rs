//! High level table client
//!
//! [`TableClient`] picks the transfer path for each call: a single resumable
//! reader or the parallel coordinator for reads, and the sequential chunk
//! pipeline or the temporary-table coordinator for writes.

use crate::cancel::CancellationToken;
use crate::codec::ControlRowCodec;
use crate::config::TransferConfig;
use crate::error::Result;
use crate::progress::TransferProgress;
use crate::read::{
    parallel_fallback, request_fallback, rows_per_worker, slice_row_ranges, ParallelReadOptions,
    ParallelTableReader, ReadItem, ReadSession, ReaderOptions, TableReader,
};
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::service::{
    ByteStream, ControlAttributes, HttpProxyClient, ReadRequest, TableAttributes, TableService,
};
use crate::table::{TableFormat, TablePath};
use crate::write::{ChunkedTableWriter, ParallelTableWriter, WriteSummary, WriterOptions};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

/// Per-call read settings
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Wire format of the rows
    pub format: TableFormat,
    /// Control rows to deliver along with the data
    pub control_attributes: ControlAttributes,
    /// Rows may be delivered out of order
    pub unordered: bool,
    /// Stops the read
    pub cancel: Option<CancellationToken>,
    /// Shared counters
    pub progress: Option<Arc<TransferProgress>>,
}

/// Per-call write settings
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Wire format of the input
    pub format: TableFormat,
    /// Create the destination if it does not exist
    pub force_create: bool,
    /// Stops the write
    pub cancel: Option<CancellationToken>,
    /// Shared counters
    pub progress: Option<Arc<TransferProgress>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            format: TableFormat::default(),
            force_create: true,
            cancel: None,
            progress: None,
        }
    }
}

enum ReadSource {
    Single(Box<TableReader>),
    Parallel(Box<ParallelTableReader>),
}

/// Items of a read, whichever path serves it
pub struct TableReadStream {
    source: ReadSource,
    codec: ControlRowCodec,
}

impl std::fmt::Debug for TableReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReadStream")
            .field("parallel", &self.is_parallel())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl TableReadStream {
    /// Whether partitions are read concurrently
    pub fn is_parallel(&self) -> bool {
        matches!(self.source, ReadSource::Parallel(_))
    }

    /// Next row or control marker; `None` once the read is complete
    pub async fn next_item(&mut self) -> Result<Option<ReadItem>> {
        match &mut self.source {
            ReadSource::Single(reader) => reader.next_item().await,
            ReadSource::Parallel(reader) => Ok(reader.next_item().await?.map(|tagged| tagged.item)),
        }
    }

    /// Stream of items; ends after the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<ReadItem>> {
        match self.source {
            ReadSource::Single(reader) => reader.into_stream(),
            ReadSource::Parallel(reader) => reader.into_stream().map_ok(|tagged| tagged.item).boxed(),
        }
    }

    /// Stream of wire bytes in the read format
    pub fn into_byte_stream(self) -> BoxStream<'static, Result<Bytes>> {
        let codec = self.codec;
        self.into_stream()
            .and_then(move |item| async move { item.into_bytes(codec) })
            .boxed()
    }
}

/// Entry point for table transfers
#[derive(Clone)]
pub struct TableClient {
    service: Arc<dyn TableService>,
    config: TransferConfig,
    policy: Arc<dyn RetryPolicy>,
}

impl std::fmt::Debug for TableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableClient")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TableClient {
    /// Client over an existing service
    pub fn new(service: Arc<dyn TableService>, config: TransferConfig) -> Self {
        let policy = Arc::new(DefaultRetryPolicy::new(config.retriable_codes()));
        Self {
            service,
            config,
            policy,
        }
    }

    /// Client talking to the HTTP proxy named in the configuration
    pub fn from_config(config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let service = HttpProxyClient::from_config(&config.proxy)?;
        Ok(Self::new(Arc::new(service), config))
    }

    /// Replace the retry classification
    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Underlying service
    pub fn service(&self) -> &Arc<dyn TableService> {
        &self.service
    }

    /// Transfer configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start reading a table.
    ///
    /// Settings that cannot work are rejected before any request. With
    /// read retries or parallel reads enabled the table metadata is probed
    /// first: dynamic tables are read without retries, and static tables
    /// are partitioned when parallel reads are on.
    pub async fn read_table(&self, path: TablePath, options: ReadOptions) -> Result<TableReadStream> {
        let request = ReadRequest {
            path,
            format: options.format,
            control_attributes: options.control_attributes,
            unordered: options.unordered,
        };
        let mut reader_options = ReaderOptions::from_config(&self.config, Arc::clone(&self.policy));
        reader_options.cancel = options.cancel;
        reader_options.progress = options.progress;
        let parallel = self.config.read_parallel.enable;

        // Fail fast on settings no response can fix. A read that may still
        // be partitioned only needs a valid path: every partition holds a
        // single range and the coordinator handles the unordered flag.
        let may_partition = parallel && request_fallback(&request).is_none();
        if may_partition {
            request.path.clone().normalized()?;
        } else {
            ReadSession::new(
                request.clone(),
                reader_options.retries_enabled,
                reader_options.allow_multiple_ranges,
                self.service.capabilities(),
            )?;
        }

        if !parallel && !reader_options.retries_enabled {
            return self.single_read(request, reader_options);
        }

        let attributes = self
            .service
            .get_table_attributes(&request.path.path)
            .await?;
        if attributes.dynamic && reader_options.retries_enabled {
            tracing::debug!("{} is dynamic, reading without retries", request.path.path);
            reader_options.retries_enabled = false;
        }
        if let Some(progress) = &reader_options.progress {
            progress.set_total_rows(attributes.row_count);
        }

        if parallel {
            match parallel_fallback(&request, &attributes) {
                None => return self.parallel_read(request, &attributes, reader_options),
                Some(reason) => tracing::warn!(
                    "Reading {} with a single reader: {}",
                    request.path.path,
                    reason
                ),
            }
        }
        self.single_read(request, reader_options)
    }

    fn single_read(&self, request: ReadRequest, options: ReaderOptions) -> Result<TableReadStream> {
        let codec = request.format.control_codec();
        let reader = TableReader::new(Arc::clone(&self.service), request, options)?;
        Ok(TableReadStream {
            source: ReadSource::Single(Box::new(reader)),
            codec,
        })
    }

    fn parallel_read(
        &self,
        request: ReadRequest,
        attributes: &TableAttributes,
        options: ReaderOptions,
    ) -> Result<TableReadStream> {
        let settings = &self.config.read_parallel;
        let request = ReadRequest {
            path: request.path.normalized()?,
            ..request
        };
        let per_worker = rows_per_worker(attributes, settings.data_size_per_thread);
        let partitions = slice_row_ranges(&request.path.ranges, attributes.row_count, per_worker)?;
        if let Some(progress) = &options.progress {
            progress.set_total_rows(partitions.iter().map(|p| p.estimated_rows).sum());
        }

        let codec = request.format.control_codec();
        let parallel = ParallelReadOptions {
            max_workers: settings.max_thread_count,
            channel_capacity: settings.channel_capacity,
            ordered: !request.unordered,
        };
        let reader = ParallelTableReader::new(
            Arc::clone(&self.service),
            request,
            partitions,
            options,
            parallel,
        );
        Ok(TableReadStream {
            source: ReadSource::Parallel(Box::new(reader)),
            codec,
        })
    }

    /// Write a byte stream to a table
    pub async fn write_table(
        &self,
        path: TablePath,
        input: ByteStream,
        options: WriteOptions,
    ) -> Result<WriteSummary> {
        let format = options.format;
        let writer_options = self.writer_options(options);
        if self.config.write_parallel.enable {
            self.parallel_writer(path, format, writer_options)?
                .write_stream(input)
                .await
        } else {
            ChunkedTableWriter::new(Arc::clone(&self.service), path, format, writer_options)?
                .write_stream(input)
                .await
        }
    }

    /// Write a list of row bodies to a table
    pub async fn write_rows<I>(&self, path: TablePath, rows: I, options: WriteOptions) -> Result<WriteSummary>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let format = options.format;
        let writer_options = self.writer_options(options);
        if self.config.write_parallel.enable {
            self.parallel_writer(path, format, writer_options)?
                .write_rows(rows)
                .await
        } else {
            ChunkedTableWriter::new(Arc::clone(&self.service), path, format, writer_options)?
                .write_rows(rows)
                .await
        }
    }

    fn writer_options(&self, options: WriteOptions) -> WriterOptions {
        WriterOptions {
            force_create: options.force_create,
            cancel: options.cancel,
            progress: options.progress,
            ..WriterOptions::from_config(&self.config, Arc::clone(&self.policy))
        }
    }

    fn parallel_writer(
        &self,
        path: TablePath,
        format: TableFormat,
        options: WriterOptions,
    ) -> Result<ParallelTableWriter> {
        ParallelTableWriter::new(
            Arc::clone(&self.service),
            path,
            format,
            options,
            self.config.write_parallel.max_thread_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ControlMarker;
    use crate::error::TransferError;
    use crate::retry::RetryConfig;
    use crate::service::{InMemoryTableService, ServiceCapabilities};
    use crate::table::Range;

    fn config() -> TransferConfig {
        let mut config = TransferConfig::default();
        config.read_retries.retry = RetryConfig::immediate(5);
        config.write_retries.retry = RetryConfig::immediate(5);
        config.write_retries.rows_chunk_size = 7;
        config.read_parallel.data_size_per_thread = 64;
        config.read_parallel.max_thread_count = 3;
        config
    }

    fn service(rows: u64) -> Arc<InMemoryTableService> {
        let service = Arc::new(InMemoryTableService::new());
        service.insert_table("//t", (0..rows).map(|i| Bytes::from(format!("{{id={}}}", i))));
        service.set_body_chunk_size(13);
        service
    }

    fn ids(items: &[ReadItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                ReadItem::Row(row) => Some(String::from_utf8_lossy(row).trim().trim_end_matches(';').to_string()),
                ReadItem::Control(_) => None,
            })
            .collect()
    }

    fn expected(range: std::ops::Range<u64>) -> Vec<String> {
        range.map(|i| format!("{{id={}}}", i)).collect()
    }

    #[tokio::test]
    async fn test_single_read_with_resets() {
        let service = service(40);
        service.reset_read_after(5);
        service.reset_read_after(9);
        let client = TableClient::new(service.clone(), config());

        let stream = client.read_table(TablePath::new("//t"), ReadOptions::default()).await.unwrap();
        assert!(!stream.is_parallel());
        let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();
        assert_eq!(ids(&items), expected(0..40));
    }

    #[tokio::test]
    async fn test_parallel_read_in_order() {
        let service = service(200);
        service.reset_read_after(3);
        let mut config = config();
        config.read_parallel.enable = true;
        let client = TableClient::new(service.clone(), config);

        let progress = Arc::new(TransferProgress::new());
        let options = ReadOptions {
            progress: Some(progress.clone()),
            ..Default::default()
        };
        let path = TablePath::new("//t").with_range(Range::rows(20, 180));
        let stream = client.read_table(path, options).await.unwrap();
        assert!(stream.is_parallel());
        let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();

        assert_eq!(ids(&items), expected(20..180));
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.rows, 160);
        assert_eq!(snapshot.total_rows, 160);
    }

    #[tokio::test]
    async fn test_parallel_falls_back_for_control_attributes() {
        let service = service(30);
        let mut config = config();
        config.read_parallel.enable = true;
        let client = TableClient::new(service, config);

        let options = ReadOptions {
            control_attributes: ControlAttributes {
                enable_row_index: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let stream = client.read_table(TablePath::new("//t"), options).await.unwrap();
        assert!(!stream.is_parallel());
        let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();
        assert_eq!(items[0], ReadItem::Control(ControlMarker::RowIndex(0)));
        assert_eq!(ids(&items), expected(0..30));
    }

    #[tokio::test]
    async fn test_unsupported_multi_range_fails_before_any_request() {
        let service = service(30);
        service.set_capabilities(ServiceCapabilities {
            range_index_reporting: false,
        });
        let mut config = config();
        config.read_retries.allow_multiple_ranges = true;
        let client = TableClient::new(service.clone(), config);

        let path = TablePath::new("//t")
            .with_range(Range::rows(0, 5))
            .with_range(Range::rows(10, 15));
        let result = client.read_table(path, ReadOptions::default()).await;
        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
        assert_eq!(service.request_count(), 0);
    }

    #[tokio::test]
    async fn test_parallel_read_of_several_ranges() {
        let service = service(100);
        service.reset_read_after(4);
        let mut config = config();
        config.read_parallel.enable = true;
        assert!(config.read_retries.enable);
        assert!(!config.read_retries.allow_multiple_ranges);
        let client = TableClient::new(service, config);

        let path = TablePath::new("//t")
            .with_range(Range::rows(0, 10))
            .with_range(Range::rows(50, 60));
        let stream = client.read_table(path, ReadOptions::default()).await.unwrap();
        assert!(stream.is_parallel());
        let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();

        let mut want = expected(0..10);
        want.extend(expected(50..60));
        assert_eq!(ids(&items), want);
    }

    #[tokio::test]
    async fn test_unordered_fallback_rejected_before_any_request() {
        let service = service(30);
        let mut config = config();
        config.read_parallel.enable = true;
        let client = TableClient::new(service.clone(), config);

        let options = ReadOptions {
            unordered: true,
            control_attributes: ControlAttributes {
                enable_row_index: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = client.read_table(TablePath::new("//t"), options).await;
        assert!(matches!(result, Err(TransferError::ConfigError(_))));
        assert_eq!(service.request_count(), 0);
    }

    #[tokio::test]
    async fn test_dynamic_table_read_without_retries() {
        let service = service(20);
        service.set_dynamic("//t", true);
        service.reset_read_after(4);
        let client = TableClient::new(service, config());

        let stream = client.read_table(TablePath::new("//t"), ReadOptions::default()).await.unwrap();
        let result: Result<Vec<ReadItem>> = stream.into_stream().try_collect().await;
        assert!(matches!(result, Err(TransferError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_unordered_parallel_read() {
        let service = service(100);
        let mut config = config();
        config.read_parallel.enable = true;
        let client = TableClient::new(service, config);

        let options = ReadOptions {
            unordered: true,
            ..Default::default()
        };
        let stream = client.read_table(TablePath::new("//t"), options).await.unwrap();
        let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();
        let mut got = ids(&items);
        got.sort();
        let mut want = expected(0..100);
        want.sort();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_unordered_single_read_with_retries_rejected() {
        let client = TableClient::new(service(10), config());
        let options = ReadOptions {
            unordered: true,
            ..Default::default()
        };
        assert!(matches!(
            client.read_table(TablePath::new("//t"), options).await,
            Err(TransferError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        for parallel in [false, true] {
            let service = Arc::new(InMemoryTableService::new());
            let mut config = config();
            config.write_parallel.enable = parallel;
            let client = TableClient::new(service.clone(), config);

            let rows: Vec<String> = expected(0..50);
            let summary = client
                .write_rows(TablePath::new("//out"), &rows, WriteOptions::default())
                .await
                .unwrap();
            assert_eq!(summary.rows, 50);
            assert_eq!(summary.chunks, 8);

            let stream = client
                .read_table(TablePath::new("//out"), ReadOptions::default())
                .await
                .unwrap();
            let items: Vec<ReadItem> = stream.into_stream().try_collect().await.unwrap();
            assert_eq!(ids(&items), rows);
        }
    }

    #[tokio::test]
    async fn test_write_stream_creates_destination() {
        let service = Arc::new(InMemoryTableService::new());
        let client = TableClient::new(service.clone(), config());
        let input: ByteStream =
            futures::stream::iter(vec![Ok(Bytes::from_static(b"{\"a\":1}\n{\"a\":2}\n"))]).boxed();
        let options = WriteOptions {
            format: TableFormat::json(),
            ..Default::default()
        };
        client.write_table(TablePath::new("//json"), input, options).await.unwrap();
        assert_eq!(service.rows("//json").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_byte_stream_round_trip() {
        let service = service(3);
        let client = TableClient::new(service, config());
        let stream = client.read_table(TablePath::new("//t"), ReadOptions::default()).await.unwrap();
        let chunks: Vec<Bytes> = stream.into_byte_stream().try_collect().await.unwrap();
        let text: String = chunks.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect();
        assert_eq!(text.split(';').filter(|s| !s.trim().is_empty()).count(), 3);
    }
}
