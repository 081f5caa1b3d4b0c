//! Parallel table reads
//!
//! A static table is split into row partitions sized from its metadata,
//! and each partition is read by its own [`TableReader`] on a tokio task.
//! Workers push into bounded channels, so a worker that runs ahead of the
//! consumer blocks instead of buffering the table in memory.
//!
//! In ordered mode at most `max_workers` partitions are in flight, always
//! starting at the partition the consumer is draining. In unordered mode
//! every worker shares one channel and each item carries its partition
//! index.

use super::reader::{ReaderOptions, TableReader};
use super::session::ReadItem;
use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};
use crate::service::{ReadRequest, ResponseParameters, TableAttributes, TableService};
use crate::table::{Range, RowIndex, TablePath};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Contiguous block of rows read by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPartition {
    /// Position in the output order
    pub index: usize,
    /// Row bounds `[lower, upper)`
    pub range: (RowIndex, RowIndex),
    /// Rows the partition is expected to hold
    pub estimated_rows: u64,
}

impl ReadPartition {
    /// Row range to request for this partition
    pub fn to_range(&self) -> Range {
        Range::rows(self.range.0, self.range.1)
    }
}

/// Number of rows one worker should read so that it fetches roughly
/// `data_size_per_thread` bytes
pub fn rows_per_worker(attributes: &TableAttributes, data_size_per_thread: u64) -> u64 {
    if attributes.row_count == 0 || attributes.uncompressed_data_size == 0 {
        return data_size_per_thread.max(1);
    }
    // rows = target / (size / count), kept exact for fractional row sizes
    let rows = u128::from(data_size_per_thread) * u128::from(attributes.row_count)
        / u128::from(attributes.uncompressed_data_size);
    u64::try_from(rows).unwrap_or(u64::MAX).max(1)
}

/// Split the requested ranges into consecutive partitions of at most
/// `rows_per_worker` rows.
///
/// A path without ranges covers the whole table. Upper limits are clamped
/// to `row_count`; exact ranges become a single one-row partition.
pub fn slice_row_ranges(
    ranges: &[Range],
    row_count: u64,
    rows_per_worker: u64,
) -> Result<Vec<ReadPartition>> {
    let step = rows_per_worker.max(1);
    let whole_table = [Range::default()];
    let ranges = if ranges.is_empty() { &whole_table[..] } else { ranges };

    let mut partitions = Vec::new();
    for range in ranges {
        range.validate()?;
        let (lower, upper) = range.row_bounds(row_count)?;
        let upper = upper.min(row_count);

        let mut start = lower;
        while start < upper {
            let end = upper.min(start.saturating_add(step));
            partitions.push(ReadPartition {
                index: partitions.len(),
                range: (start, end),
                estimated_rows: end - start,
            });
            start = end;
        }
    }
    Ok(partitions)
}

/// Why a read cannot be partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelFallback {
    /// Dynamic tables have no stable row indexes
    DynamicTable,
    /// Key limits cannot be turned into row offsets client-side
    KeyLimits,
    /// Control rows would refer to partitions instead of the table
    ControlAttributes,
}

impl fmt::Display for ParallelFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DynamicTable => write!(f, "table is dynamic"),
            Self::KeyLimits => write!(f, "ranges use key limits"),
            Self::ControlAttributes => write!(f, "control attributes were requested"),
        }
    }
}

/// Reason the read must take the single reader path, if any
pub fn parallel_fallback(
    request: &ReadRequest,
    attributes: &TableAttributes,
) -> Option<ParallelFallback> {
    if attributes.dynamic {
        Some(ParallelFallback::DynamicTable)
    } else {
        request_fallback(request)
    }
}

/// Fallback decided by the request alone, before any metadata is known
pub fn request_fallback(request: &ReadRequest) -> Option<ParallelFallback> {
    if request.path.has_key_limit_in_ranges() {
        Some(ParallelFallback::KeyLimits)
    } else if request.control_attributes.any() {
        Some(ParallelFallback::ControlAttributes)
    } else {
        None
    }
}

/// Coordinator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelReadOptions {
    /// Workers in flight at once
    pub max_workers: usize,
    /// Items buffered per channel
    pub channel_capacity: usize,
    /// Deliver partitions in order
    pub ordered: bool,
}

impl Default for ParallelReadOptions {
    fn default() -> Self {
        Self {
            max_workers: 10,
            channel_capacity: 1024,
            ordered: true,
        }
    }
}

/// Item of a parallel read with the partition it came from
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedItem {
    /// Index of the source partition
    pub partition: usize,
    /// Row or control marker
    pub item: ReadItem,
}

#[derive(Debug)]
enum WorkerEvent {
    Item(usize, ReadItem),
    Finished(usize),
    Failed(usize, TransferError),
}

async fn run_worker(mut reader: TableReader, partition: usize, sender: mpsc::Sender<WorkerEvent>) {
    loop {
        let event = match reader.next_item().await {
            Ok(Some(item)) => WorkerEvent::Item(partition, item),
            Ok(None) => WorkerEvent::Finished(partition),
            Err(error) => WorkerEvent::Failed(partition, error),
        };
        let last = !matches!(event, WorkerEvent::Item(..));
        // A closed channel means the coordinator is gone
        if sender.send(event).await.is_err() || last {
            return;
        }
    }
}

/// Reads partitions of one table concurrently
pub struct ParallelTableReader {
    service: Arc<dyn TableService>,
    request: ReadRequest,
    reader_options: ReaderOptions,
    options: ParallelReadOptions,
    partitions: Vec<ReadPartition>,
    parameters: ResponseParameters,
    tasks: JoinSet<()>,
    /// Next partition to hand to a worker
    next_launch: usize,
    completed: usize,
    /// Ordered mode: receivers of in-flight partitions, in partition order
    window: VecDeque<(usize, mpsc::Receiver<WorkerEvent>)>,
    /// Unordered mode: channel shared by all workers
    shared: Option<(mpsc::Sender<WorkerEvent>, mpsc::Receiver<WorkerEvent>)>,
    done: bool,
}

impl fmt::Debug for ParallelTableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelTableReader")
            .field("path", &self.request.path.path)
            .field("partitions", &self.partitions.len())
            .field("completed", &self.completed)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ParallelTableReader {
    /// Prepare a parallel read of `request` split into `partitions`.
    /// Workers start on the first call to [`next_item`](Self::next_item).
    pub fn new(
        service: Arc<dyn TableService>,
        request: ReadRequest,
        partitions: Vec<ReadPartition>,
        reader_options: ReaderOptions,
        options: ParallelReadOptions,
    ) -> Self {
        let parameters = ResponseParameters {
            start_row_index: Some(partitions.first().map_or(0, |p| p.range.0)),
            approximate_row_count: Some(partitions.iter().map(|p| p.estimated_rows).sum()),
        };
        let options = ParallelReadOptions {
            max_workers: options.max_workers.max(1),
            channel_capacity: options.channel_capacity.max(1),
            ..options
        };
        let shared = (!options.ordered).then(|| mpsc::channel(options.channel_capacity));

        tracing::info!(
            "Reading {} in {} partitions with up to {} workers",
            request.path.path,
            partitions.len(),
            options.max_workers
        );

        Self {
            service,
            request,
            reader_options,
            options,
            partitions,
            parameters,
            tasks: JoinSet::new(),
            next_launch: 0,
            completed: 0,
            window: VecDeque::new(),
            shared,
            done: false,
        }
    }

    /// Response parameters describing the whole read
    pub fn parameters(&self) -> ResponseParameters {
        self.parameters
    }

    /// Partitions of this read
    pub fn partitions(&self) -> &[ReadPartition] {
        &self.partitions
    }

    /// Next item; `None` once every partition is drained
    pub async fn next_item(&mut self) -> Result<Option<TaggedItem>> {
        if self.done {
            return Ok(None);
        }
        let result = if self.options.ordered {
            self.next_ordered().await
        } else {
            self.next_unordered().await
        };
        match result {
            Ok(None) => {
                self.done = true;
                tracing::debug!(
                    "Parallel read of {} finished: {} partitions",
                    self.request.path.path,
                    self.completed
                );
                Ok(None)
            }
            Err(error) => {
                self.shutdown();
                Err(error)
            }
            item => item,
        }
    }

    /// Stream of tagged items; ends after the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<TaggedItem>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_item().await {
                Ok(Some(item)) => Some((Ok(item), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed()
    }

    async fn next_ordered(&mut self) -> Result<Option<TaggedItem>> {
        loop {
            while self.window.len() < self.options.max_workers
                && self.next_launch < self.partitions.len()
            {
                let (sender, receiver) = mpsc::channel(self.options.channel_capacity);
                let partition = self.launch(sender)?;
                self.window.push_back((partition, receiver));
            }

            let cancel = self.reader_options.cancel.clone();
            let Some((partition, receiver)) = self.window.front_mut() else {
                return Ok(None);
            };
            let partition = *partition;
            let event = receive(receiver, cancel.as_ref()).await?;

            match event {
                Some(WorkerEvent::Item(partition, item)) => {
                    return Ok(Some(TaggedItem { partition, item }))
                }
                Some(WorkerEvent::Finished(_)) => {
                    self.window.pop_front();
                    self.completed += 1;
                }
                Some(WorkerEvent::Failed(partition, error)) => {
                    return Err(self.worker_failure(partition, error))
                }
                None => return Err(self.worker_lost(partition)),
            }
        }
    }

    async fn next_unordered(&mut self) -> Result<Option<TaggedItem>> {
        loop {
            let in_flight = self.next_launch - self.completed;
            if in_flight < self.options.max_workers && self.next_launch < self.partitions.len() {
                let sender = match &self.shared {
                    Some((sender, _)) => sender.clone(),
                    None => return Err(TransferError::protocol("unordered read without a channel")),
                };
                self.launch(sender)?;
                continue;
            }
            if self.completed == self.partitions.len() {
                return Ok(None);
            }

            let cancel = self.reader_options.cancel.clone();
            let Some((_, receiver)) = self.shared.as_mut() else {
                return Err(TransferError::protocol("unordered read without a channel"));
            };
            // The coordinator holds a sender, so the channel never closes here
            let event = receive(receiver, cancel.as_ref()).await?;

            match event {
                Some(WorkerEvent::Item(partition, item)) => {
                    return Ok(Some(TaggedItem { partition, item }))
                }
                Some(WorkerEvent::Finished(_)) => self.completed += 1,
                Some(WorkerEvent::Failed(partition, error)) => {
                    return Err(self.worker_failure(partition, error))
                }
                None => return Err(self.worker_lost(self.completed)),
            }
        }
    }

    /// Start a worker for the next partition
    fn launch(&mut self, sender: mpsc::Sender<WorkerEvent>) -> Result<usize> {
        let partition = self.partitions[self.next_launch];
        self.next_launch += 1;

        let request = ReadRequest {
            path: TablePath {
                path: self.request.path.path.clone(),
                ranges: vec![partition.to_range()],
                append: false,
            },
            format: self.request.format,
            control_attributes: Default::default(),
            unordered: false,
        };
        let reader = TableReader::new(
            Arc::clone(&self.service),
            request,
            self.reader_options.clone(),
        )?;

        tracing::debug!(
            "Starting worker for partition {} rows [{}, {})",
            partition.index,
            partition.range.0,
            partition.range.1
        );
        self.tasks.spawn(run_worker(reader, partition.index, sender));
        Ok(partition.index)
    }

    fn worker_failure(&mut self, partition: usize, error: TransferError) -> TransferError {
        if matches!(error, TransferError::Cancelled) {
            return error;
        }
        tracing::warn!(
            "Partition {} of {} failed: {}. Aborting {} workers",
            partition,
            self.request.path.path,
            error,
            self.tasks.len()
        );
        TransferError::PartialWorkerFailure {
            partition,
            completed: self.completed,
            total: self.partitions.len(),
            source: Box::new(error),
        }
    }

    fn worker_lost(&mut self, partition: usize) -> TransferError {
        self.worker_failure(
            partition,
            TransferError::protocol("read worker stopped without finishing its partition"),
        )
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.tasks.abort_all();
        self.window.clear();
        self.shared = None;
    }
}

async fn receive(
    receiver: &mut mpsc::Receiver<WorkerEvent>,
    cancel: Option<&CancellationToken>,
) -> Result<Option<WorkerEvent>> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Cancelled),
            event = receiver.recv() => Ok(event),
        },
        None => Ok(receiver.recv().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::retry::{DefaultRetryPolicy, RetryConfig};
    use crate::service::{ControlAttributes, InMemoryTableService};
    use crate::table::{ReadLimit, TableFormat};
    use bytes::Bytes;
    use futures::TryStreamExt;
    use proptest::prelude::*;
    use std::time::Duration;

    fn service(rows: u64) -> Arc<InMemoryTableService> {
        let service = Arc::new(InMemoryTableService::new());
        service.insert_table("//t", (0..rows).map(|i| Bytes::from(format!("{{\"id\"={}}}", i))));
        service.set_body_chunk_size(11);
        service
    }

    fn request(path: TablePath) -> ReadRequest {
        ReadRequest {
            path,
            format: TableFormat::Yson,
            control_attributes: ControlAttributes::default(),
            unordered: false,
        }
    }

    fn reader_options() -> ReaderOptions {
        ReaderOptions {
            retries_enabled: true,
            allow_multiple_ranges: false,
            retry: RetryConfig::immediate(5),
            policy: Arc::new(DefaultRetryPolicy::default()),
            attempt_timeout: Some(Duration::from_secs(5)),
            deadline: None,
            cancel: None,
            progress: None,
        }
    }

    fn id_of(item: &ReadItem) -> u64 {
        match item {
            ReadItem::Row(row) => {
                let text = String::from_utf8_lossy(row);
                let digits: String = text.chars().filter(char::is_ascii_digit).collect();
                digits.parse().unwrap()
            }
            ReadItem::Control(marker) => panic!("unexpected marker {:?}", marker),
        }
    }

    #[test]
    fn test_rows_per_worker() {
        let attributes = TableAttributes {
            row_count: 100,
            uncompressed_data_size: 1000,
            ..Default::default()
        };
        assert_eq!(rows_per_worker(&attributes, 45), 4);
        assert_eq!(rows_per_worker(&attributes, 5), 1);
        assert_eq!(rows_per_worker(&TableAttributes::default(), 64), 64);
    }

    #[test]
    fn test_rows_per_worker_fractional_row_size() {
        // 1.99 bytes per row
        let attributes = TableAttributes {
            row_count: 100,
            uncompressed_data_size: 199,
            ..Default::default()
        };
        assert_eq!(rows_per_worker(&attributes, 100), 50);

        // Rows smaller than a byte on average
        let attributes = TableAttributes {
            row_count: 1000,
            uncompressed_data_size: 250,
            ..Default::default()
        };
        assert_eq!(rows_per_worker(&attributes, 10), 40);
        assert_eq!(rows_per_worker(&attributes, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_slice_whole_table() {
        let partitions = slice_row_ranges(&[], 10, 4).unwrap();
        let bounds: Vec<_> = partitions.iter().map(|p| p.range).collect();
        assert_eq!(bounds, vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(partitions[2].index, 2);
        assert_eq!(partitions[2].estimated_rows, 2);
    }

    #[test]
    fn test_slice_ranges_in_order() {
        let ranges = [
            Range::rows(20, 25),
            Range::exact_row(3),
            Range::from_row(95),
            Range::rows(7, 7),
        ];
        let partitions = slice_row_ranges(&ranges, 100, 3).unwrap();
        let bounds: Vec<_> = partitions.iter().map(|p| p.range).collect();
        assert_eq!(bounds, vec![(20, 23), (23, 25), (3, 4), (95, 98), (98, 100)]);
    }

    #[test]
    fn test_slice_clamps_to_row_count() {
        let partitions = slice_row_ranges(&[Range::rows(5, 500), Range::exact_row(50)], 8, 10).unwrap();
        let bounds: Vec<_> = partitions.iter().map(|p| p.range).collect();
        assert_eq!(bounds, vec![(5, 8)]);
    }

    #[test]
    fn test_slice_rejects_key_limits() {
        let range = Range {
            lower_limit: Some(ReadLimit::key(vec![serde_json::json!("a")])),
            ..Default::default()
        };
        assert!(slice_row_ranges(&[range], 10, 2).is_err());
    }

    #[test]
    fn test_fallback_reasons() {
        let plain = request(TablePath::new("//t"));
        assert_eq!(parallel_fallback(&plain, &TableAttributes::default()), None);

        let dynamic = TableAttributes {
            dynamic: true,
            ..Default::default()
        };
        assert_eq!(parallel_fallback(&plain, &dynamic), Some(ParallelFallback::DynamicTable));

        let keyed = request(TablePath::new("//t").with_range(Range {
            exact: Some(ReadLimit::key(vec![serde_json::json!(1)])),
            ..Default::default()
        }));
        assert_eq!(
            parallel_fallback(&keyed, &TableAttributes::default()),
            Some(ParallelFallback::KeyLimits)
        );

        let mut controls = plain.clone();
        controls.control_attributes.enable_row_index = true;
        assert_eq!(
            parallel_fallback(&controls, &TableAttributes::default()),
            Some(ParallelFallback::ControlAttributes)
        );
        assert_eq!(request_fallback(&controls), Some(ParallelFallback::ControlAttributes));
        assert_eq!(request_fallback(&keyed), Some(ParallelFallback::KeyLimits));
        assert_eq!(request_fallback(&plain), None);
    }

    proptest! {
        #[test]
        fn prop_partitions_cover_table(row_count in 0u64..5000, per_worker in 1u64..700) {
            let partitions = slice_row_ranges(&[], row_count, per_worker).unwrap();
            let mut next = 0;
            for (i, partition) in partitions.iter().enumerate() {
                prop_assert_eq!(partition.index, i);
                prop_assert_eq!(partition.range.0, next);
                prop_assert!(partition.range.1 > partition.range.0);
                prop_assert!(partition.estimated_rows <= per_worker);
                next = partition.range.1;
            }
            prop_assert_eq!(next, row_count);
        }

        #[test]
        fn prop_partitions_follow_ranges(
            row_count in 1u64..2000,
            bounds in proptest::collection::vec((0u64..2500, 0u64..2500), 1..6),
            per_worker in 1u64..300,
        ) {
            let ranges: Vec<Range> = bounds.iter().map(|&(a, b)| Range::rows(a.min(b), a.max(b))).collect();
            let partitions = slice_row_ranges(&ranges, row_count, per_worker).unwrap();

            let want: Vec<u64> = bounds
                .iter()
                .flat_map(|&(a, b)| a.min(b)..a.max(b).min(row_count))
                .collect();
            let got: Vec<u64> = partitions.iter().flat_map(|p| p.range.0..p.range.1).collect();
            prop_assert_eq!(got, want);
        }
    }

    #[tokio::test]
    async fn test_ordered_read_with_small_window() {
        let service = service(100);
        for after in [3, 1, 5] {
            service.reset_read_after(after);
        }
        let partitions = slice_row_ranges(&[], 100, 7).unwrap();
        assert_eq!(partitions.len(), 15);

        let reader = ParallelTableReader::new(
            service.clone(),
            request(TablePath::new("//t")),
            partitions,
            reader_options(),
            ParallelReadOptions {
                max_workers: 3,
                channel_capacity: 2,
                ordered: true,
            },
        );
        assert_eq!(
            reader.parameters(),
            ResponseParameters {
                start_row_index: Some(0),
                approximate_row_count: Some(100),
            }
        );

        let items: Vec<TaggedItem> = reader.into_stream().try_collect().await.unwrap();
        let ids: Vec<u64> = items.iter().map(|t| id_of(&t.item)).collect();
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
        assert!(items.windows(2).all(|w| w[0].partition <= w[1].partition));
    }

    #[tokio::test]
    async fn test_unordered_read_tags_items() {
        let service = service(60);
        let partitions = slice_row_ranges(&[Range::rows(10, 60)], 60, 9).unwrap();
        let reader = ParallelTableReader::new(
            service,
            request(TablePath::new("//t")),
            partitions.clone(),
            reader_options(),
            ParallelReadOptions {
                max_workers: 4,
                channel_capacity: 1,
                ordered: false,
            },
        );
        assert_eq!(reader.parameters().start_row_index, Some(10));

        let items: Vec<TaggedItem> = reader.into_stream().try_collect().await.unwrap();
        assert_eq!(items.len(), 50);

        let mut ids: Vec<u64> = items.iter().map(|t| id_of(&t.item)).collect();
        ids.sort_unstable();
        assert_eq!(ids, (10..60).collect::<Vec<_>>());

        for partition in &partitions {
            let rows: Vec<u64> = items
                .iter()
                .filter(|t| t.partition == partition.index)
                .map(|t| id_of(&t.item))
                .collect();
            assert_eq!(rows, (partition.range.0..partition.range.1).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_worker_failure_aborts_read() {
        let service = service(40);
        service.reset_read_after(2);
        let mut options = reader_options();
        options.retries_enabled = false;

        let partitions = slice_row_ranges(&[], 40, 10).unwrap();
        let mut reader = ParallelTableReader::new(
            service,
            request(TablePath::new("//t")),
            partitions,
            options,
            ParallelReadOptions {
                max_workers: 1,
                channel_capacity: 4,
                ordered: true,
            },
        );

        let error = loop {
            match reader.next_item().await {
                Ok(Some(_)) => {}
                Ok(None) => panic!("read should fail"),
                Err(e) => break e,
            }
        };
        match error {
            TransferError::PartialWorkerFailure {
                partition,
                completed,
                total,
                source,
            } => {
                assert_eq!(partition, 0);
                assert_eq!(completed, 0);
                assert_eq!(total, 4);
                assert!(matches!(
                    *source,
                    TransferError::Transport {
                        kind: TransportErrorKind::Reset,
                        ..
                    }
                ));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(reader.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_read() {
        let service = service(20);
        let token = CancellationToken::new();
        token.cancel();
        let mut options = reader_options();
        options.cancel = Some(token);

        let partitions = slice_row_ranges(&[], 20, 5).unwrap();
        let mut reader = ParallelTableReader::new(
            service,
            request(TablePath::new("//t")),
            partitions,
            options,
            ParallelReadOptions::default(),
        );
        assert!(matches!(reader.next_item().await, Err(TransferError::Cancelled)));
        assert!(reader.next_item().await.unwrap().is_none());
    }
}
