//! In-process table service
//!
//! Keeps tables in memory and renders read responses the way the real
//! service does: control rows for table, range and row boundaries in the
//! requested format, response parameters ahead of the body, and a body
//! split into buffers that do not line up with row boundaries.
//!
//! Faults can be injected to exercise the retry paths: failed requests,
//! connections reset in the middle of a row, failed or slow writes, lost
//! create responses and failed concatenation.

use super::{
    ReadRequest, ReadResponse, ResponseParameters, ServiceCapabilities, TableAttributes,
    TableService, WriteRequest,
};
use crate::codec::{split_rows, ControlMarker, ControlRowCodec};
use crate::error::{Result, TransferError, TransportErrorKind};
use crate::table::{Range, TableFormat, TablePath};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default size of body buffers handed to readers
const DEFAULT_BODY_CHUNK_SIZE: usize = 64;

#[derive(Debug, Default)]
struct MemoryTable {
    /// Row bodies without terminators
    rows: Vec<Bytes>,
    dynamic: bool,
    chunk_count: u64,
}

#[derive(Debug, Default)]
struct Faults {
    read_request_failures: u32,
    read_resets: VecDeque<u64>,
    write_failures: u32,
    permanent_write_failure: bool,
    write_delay: Option<Duration>,
    concatenate_failure: bool,
    lost_create_responses: u32,
}

#[derive(Debug)]
struct State {
    tables: BTreeMap<String, MemoryTable>,
    faults: Faults,
    capabilities: ServiceCapabilities,
    body_chunk_size: usize,
    read_requests: Vec<ReadRequest>,
    write_requests: Vec<WriteRequest>,
    calls: u64,
}

/// Table service backed by process memory
#[derive(Debug)]
pub struct InMemoryTableService {
    state: Mutex<State>,
}

impl InMemoryTableService {
    /// Empty service reporting range indexes
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                faults: Faults::default(),
                capabilities: ServiceCapabilities {
                    range_index_reporting: true,
                },
                body_chunk_size: DEFAULT_BODY_CHUNK_SIZE,
                read_requests: Vec::new(),
                write_requests: Vec::new(),
                calls: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace a table holding `rows` (bodies without terminators)
    pub fn insert_table(&self, path: &str, rows: impl IntoIterator<Item = Bytes>) {
        let rows: Vec<Bytes> = rows.into_iter().collect();
        let chunk_count = u64::from(!rows.is_empty());
        self.lock().tables.insert(
            path.to_string(),
            MemoryTable {
                rows,
                dynamic: false,
                chunk_count,
            },
        );
    }

    /// Row bodies of a table
    pub fn rows(&self, path: &str) -> Option<Vec<Bytes>> {
        self.lock().tables.get(path).map(|t| t.rows.clone())
    }

    /// Paths of all tables, sorted
    pub fn table_paths(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    /// Mark a table dynamic
    pub fn set_dynamic(&self, path: &str, dynamic: bool) {
        if let Some(table) = self.lock().tables.get_mut(path) {
            table.dynamic = dynamic;
        }
    }

    /// Override the reported capabilities
    pub fn set_capabilities(&self, capabilities: ServiceCapabilities) {
        self.lock().capabilities = capabilities;
    }

    /// Size of body buffers; 0 sends each body as one buffer
    pub fn set_body_chunk_size(&self, size: usize) {
        self.lock().body_chunk_size = size;
    }

    /// Fail the next `count` read requests before any response
    pub fn fail_next_read_requests(&self, count: u32) {
        self.lock().faults.read_request_failures = count;
    }

    /// Reset the connection of the next read response after `rows` data rows,
    /// leaving half of the following row in the body. Calls queue up, one per
    /// response.
    pub fn reset_read_after(&self, rows: u64) {
        self.lock().faults.read_resets.push_back(rows);
    }

    /// Fail the next `count` writes with a transport error
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().faults.write_failures = count;
    }

    /// Reject every write with a non-retriable service error
    pub fn fail_writes_permanently(&self, fail: bool) {
        self.lock().faults.permanent_write_failure = fail;
    }

    /// Delay each write by `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.lock().faults.write_delay = delay;
    }

    /// Reject concatenation with a non-retriable service error
    pub fn fail_concatenate(&self, fail: bool) {
        self.lock().faults.concatenate_failure = fail;
    }

    /// Apply the next `count` table creations but fail their responses with
    /// a transport error
    pub fn lose_next_create_responses(&self, count: u32) {
        self.lock().faults.lost_create_responses = count;
    }

    /// Every read request received, in order
    pub fn read_requests(&self) -> Vec<ReadRequest> {
        self.lock().read_requests.clone()
    }

    /// Every write request received, in order
    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.lock().write_requests.clone()
    }

    /// Number of calls of any kind
    pub fn request_count(&self) -> u64 {
        self.lock().calls
    }
}

impl Default for InMemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_error(path: &str) -> TransferError {
    TransferError::service(500, Some(400), format!("Cannot resolve path {}", path))
}

fn encode_row(format: &TableFormat, body: &[u8]) -> Bytes {
    match format.row_framing() {
        Some(framing) => framing.terminate(body),
        None => {
            let mut row = BytesMut::with_capacity(body.len() + 1);
            row.extend_from_slice(body);
            row.extend_from_slice(b"\n");
            row.freeze()
        }
    }
}

fn decode_payload(format: &TableFormat, payload: &Bytes) -> Result<Vec<Bytes>> {
    match format.row_framing() {
        Some(framing) => Ok(split_rows(framing, payload)?
            .iter()
            .map(|row| Bytes::copy_from_slice(framing.row_body(row)))
            .collect()),
        None if payload.is_empty() => Ok(Vec::new()),
        None => Ok(vec![payload.clone()]),
    }
}

struct RenderedRead {
    body: Bytes,
    parameters: ResponseParameters,
    reset: bool,
}

fn render_read(
    rows: &[Bytes],
    request: &ReadRequest,
    reset_after: Option<u64>,
) -> Result<RenderedRead> {
    let whole = [Range::default()];
    let ranges: &[Range] = if request.path.ranges.is_empty() {
        &whole
    } else {
        &request.path.ranges
    };

    let row_count = rows.len() as u64;
    let mut bounds = Vec::with_capacity(ranges.len());
    for range in ranges {
        if range.has_key_limit() {
            return Err(TransferError::service(
                1,
                Some(400),
                "key limits are not supported by the in-memory service",
            ));
        }
        let (lower, upper) = range.row_bounds(row_count)?;
        let upper = upper.min(row_count);
        bounds.push((lower.min(upper), upper));
    }

    let parameters = ResponseParameters {
        start_row_index: Some(bounds.first().map_or(0, |b| b.0)),
        approximate_row_count: Some(bounds.iter().map(|(lo, hi)| hi - lo).sum()),
    };

    let codec = request.format.control_codec();
    let controls = request.control_attributes;
    let emit = |body: &mut BytesMut, enabled: bool, marker: ControlMarker| -> Result<()> {
        if enabled && codec != ControlRowCodec::Opaque {
            body.extend_from_slice(&codec.dump(marker)?);
        }
        Ok(())
    };

    let mut body = BytesMut::new();
    let mut delivered = 0u64;
    emit(&mut body, controls.enable_table_index, ControlMarker::TableIndex(0))?;

    for (range_index, (lower, upper)) in bounds.iter().enumerate() {
        emit(
            &mut body,
            controls.enable_range_index,
            ControlMarker::RangeIndex(range_index as u64),
        )?;
        emit(
            &mut body,
            controls.enable_row_index && lower < upper,
            ControlMarker::RowIndex(*lower),
        )?;

        for index in *lower..*upper {
            let row = encode_row(&request.format, &rows[index as usize]);
            if reset_after == Some(delivered) {
                body.extend_from_slice(&row[..row.len() / 2]);
                return Ok(RenderedRead {
                    body: body.freeze(),
                    parameters,
                    reset: true,
                });
            }
            body.extend_from_slice(&row);
            delivered += 1;
        }
    }

    Ok(RenderedRead {
        body: body.freeze(),
        parameters,
        reset: false,
    })
}

#[async_trait]
impl TableService for InMemoryTableService {
    fn capabilities(&self) -> ServiceCapabilities {
        self.lock().capabilities
    }

    async fn read_table(&self, request: &ReadRequest) -> Result<ReadResponse> {
        let mut state = self.lock();
        state.calls += 1;
        state.read_requests.push(request.clone());

        if state.faults.read_request_failures > 0 {
            state.faults.read_request_failures -= 1;
            return Err(TransferError::transport(
                TransportErrorKind::Connect,
                "injected request failure",
            ));
        }

        let reset_after = state.faults.read_resets.pop_front();
        let chunk_size = state.body_chunk_size;
        let table = state
            .tables
            .get(&request.path.path)
            .ok_or_else(|| resolve_error(&request.path.path))?;
        let rendered = render_read(&table.rows, request, reset_after)?;
        drop(state);

        let mut items: Vec<Result<Bytes>> = if chunk_size == 0 {
            vec![Ok(rendered.body.clone())]
        } else {
            rendered
                .body
                .chunks(chunk_size)
                .map(|chunk| Ok(rendered.body.slice_ref(chunk)))
                .collect()
        };
        if rendered.reset {
            items.push(Err(TransferError::transport(
                TransportErrorKind::Reset,
                "connection reset by peer (injected)",
            )));
        }

        tracing::debug!(
            "in-memory read of {} ({} bytes, reset: {})",
            request.path,
            rendered.body.len(),
            rendered.reset
        );
        Ok(ReadResponse {
            parameters: rendered.parameters,
            body: futures::stream::iter(items).boxed(),
        })
    }

    async fn write_table(&self, request: &WriteRequest, payload: Bytes) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.calls += 1;
            state.write_requests.push(request.clone());
            state.faults.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.faults.permanent_write_failure {
            return Err(TransferError::service(
                1,
                Some(400),
                "injected permanent write failure",
            ));
        }
        if state.faults.write_failures > 0 {
            state.faults.write_failures -= 1;
            return Err(TransferError::transport(
                TransportErrorKind::Reset,
                "injected write failure",
            ));
        }

        let rows = decode_payload(&request.format, &payload)?;
        let path = &request.path.path;
        let table = state
            .tables
            .get_mut(path)
            .ok_or_else(|| resolve_error(path))?;
        if !request.path.append {
            table.rows.clear();
            table.chunk_count = 0;
        }
        table.rows.extend(rows);
        table.chunk_count += 1;
        Ok(())
    }

    async fn create_table(&self, path: &str, ignore_existing: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls += 1;
        if state.tables.contains_key(path) {
            if ignore_existing {
                return Ok(());
            }
            return Err(TransferError::conflict(path, "node already exists"));
        }
        state.tables.insert(path.to_string(), MemoryTable::default());
        if state.faults.lost_create_responses > 0 {
            state.faults.lost_create_responses -= 1;
            return Err(TransferError::transport(
                TransportErrorKind::Reset,
                "injected lost create response",
            ));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut state = self.lock();
        state.calls += 1;
        Ok(state.tables.contains_key(path))
    }

    async fn remove(&self, path: &str, force: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls += 1;
        if state.tables.remove(path).is_none() && !force {
            return Err(resolve_error(path));
        }
        Ok(())
    }

    async fn concatenate(&self, sources: &[String], destination: &TablePath) -> Result<()> {
        let mut state = self.lock();
        state.calls += 1;
        if state.faults.concatenate_failure {
            return Err(TransferError::service(
                1,
                Some(400),
                "injected concatenate failure",
            ));
        }

        let mut rows = Vec::new();
        for source in sources {
            let table = state.tables.get(source).ok_or_else(|| resolve_error(source))?;
            rows.extend(table.rows.iter().cloned());
        }

        let table = state
            .tables
            .get_mut(&destination.path)
            .ok_or_else(|| resolve_error(&destination.path))?;
        if !destination.append {
            table.rows.clear();
            table.chunk_count = 0;
        }
        table.rows.extend(rows);
        table.chunk_count += sources.len() as u64;
        Ok(())
    }

    async fn get_table_attributes(&self, path: &str) -> Result<TableAttributes> {
        let mut state = self.lock();
        state.calls += 1;
        let table = state.tables.get(path).ok_or_else(|| resolve_error(path))?;
        let uncompressed: u64 = table.rows.iter().map(|r| r.len() as u64 + 1).sum();
        Ok(TableAttributes {
            row_count: table.rows.len() as u64,
            uncompressed_data_size: uncompressed,
            compressed_data_size: uncompressed / 2,
            chunk_count: table.chunk_count,
            dynamic: table.dynamic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ControlAttributes;
    use futures::TryStreamExt;

    fn yson_rows(count: u64) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from(format!("{{\"id\"={}}}", i)))
            .collect()
    }

    async fn body_of(response: ReadResponse) -> (Vec<u8>, Option<TransferError>) {
        let mut body = Vec::new();
        let mut stream = response.body;
        loop {
            match stream.try_next().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => return (body, None),
                Err(e) => return (body, Some(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_read_renders_control_rows() {
        let service = InMemoryTableService::new();
        service.insert_table("//t", yson_rows(5));

        let request = ReadRequest {
            path: TablePath::new("//t")
                .with_range(Range::rows(1, 3))
                .with_range(Range::exact_row(4)),
            format: TableFormat::Yson,
            control_attributes: ControlAttributes {
                enable_row_index: true,
                enable_range_index: true,
                enable_table_index: false,
            },
            unordered: false,
        };
        let response = service.read_table(&request).await.unwrap();
        assert_eq!(response.parameters.start_row_index, Some(1));
        assert_eq!(response.parameters.approximate_row_count, Some(3));

        let (body, error) = body_of(response).await;
        assert!(error.is_none());
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "<\"range_index\"=0;>#;<\"row_index\"=1;>#;{\"id\"=1};{\"id\"=2};\
             <\"range_index\"=1;>#;<\"row_index\"=4;>#;{\"id\"=4};"
        );
    }

    #[tokio::test]
    async fn test_reset_leaves_partial_row() {
        let service = InMemoryTableService::new();
        service.insert_table("//t", yson_rows(4));
        service.reset_read_after(2);

        let request = ReadRequest {
            path: TablePath::new("//t"),
            format: TableFormat::Yson,
            control_attributes: ControlAttributes::default(),
            unordered: false,
        };
        let (body, error) = body_of(service.read_table(&request).await.unwrap()).await;
        assert!(matches!(
            error,
            Some(TransferError::Transport {
                kind: TransportErrorKind::Reset,
                ..
            })
        ));
        assert_eq!(String::from_utf8(body).unwrap(), "{\"id\"=0};{\"id\"=1};{\"id");

        // The fault is consumed
        let (_, error) = body_of(service.read_table(&request).await.unwrap()).await;
        assert!(error.is_none());
        assert_eq!(service.read_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_or_conflicts() {
        let service = InMemoryTableService::new();
        service.create_table("//t", true).await.unwrap();
        service.create_table("//t", true).await.unwrap();
        assert!(matches!(
            service.create_table("//t", false).await,
            Err(TransferError::DestinationConflict { .. })
        ));
        assert_eq!(service.table_paths(), vec!["//t".to_string()]);
    }

    #[tokio::test]
    async fn test_lost_create_response_still_creates() {
        let service = InMemoryTableService::new();
        service.lose_next_create_responses(1);
        assert!(matches!(
            service.create_table("//t", false).await,
            Err(TransferError::Transport { .. })
        ));
        assert!(service.exists("//t").await.unwrap());
        assert!(matches!(
            service.create_table("//t", false).await,
            Err(TransferError::DestinationConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_overwrite_and_append() {
        let service = InMemoryTableService::new();
        service.create_table("//t", false).await.unwrap();

        let overwrite = WriteRequest {
            path: TablePath::new("//t"),
            format: TableFormat::json(),
        };
        let append = WriteRequest {
            path: TablePath::new("//t").with_append(true),
            format: TableFormat::json(),
        };
        service
            .write_table(&overwrite, Bytes::from_static(b"{\"a\":1}\n{\"a\":2}\n"))
            .await
            .unwrap();
        service
            .write_table(&append, Bytes::from_static(b"{\"a\":3}\n"))
            .await
            .unwrap();
        assert_eq!(service.rows("//t").unwrap().len(), 3);

        service
            .write_table(&overwrite, Bytes::from_static(b"{\"a\":4}\n"))
            .await
            .unwrap();
        assert_eq!(service.rows("//t").unwrap(), vec![Bytes::from_static(b"{\"a\":4}")]);

        let missing = WriteRequest {
            path: TablePath::new("//missing"),
            format: TableFormat::json(),
        };
        assert!(service.write_table(&missing, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_concatenate_in_order() {
        let service = InMemoryTableService::new();
        service.insert_table("//tmp/b", vec![Bytes::from_static(b"b")]);
        service.insert_table("//tmp/a", vec![Bytes::from_static(b"a")]);
        service.create_table("//dst", false).await.unwrap();

        let sources = vec!["//tmp/b".to_string(), "//tmp/a".to_string()];
        service
            .concatenate(&sources, &TablePath::new("//dst"))
            .await
            .unwrap();
        assert_eq!(
            service.rows("//dst").unwrap(),
            vec![Bytes::from_static(b"b"), Bytes::from_static(b"a")]
        );

        let attributes = service.get_table_attributes("//dst").await.unwrap();
        assert_eq!(attributes.row_count, 2);
        assert_eq!(attributes.chunk_count, 2);
    }
}
