//! Packing of rows into write chunks
//!
//! Input bytes are framed into rows and packed into chunks bounded by a
//! byte size and a row count. A row is never split across chunks; a single
//! row larger than the byte bound becomes a chunk of its own.

use crate::codec::{RowFraming, RowSplitter};
use crate::error::{Result, TransferError};
use crate::service::ByteStream;
use crate::table::TableFormat;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::collections::VecDeque;

/// Unit of upload; written and retried as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Position of the chunk in the input
    pub sequence: u64,
    /// Framed rows, terminators included
    pub payload: Bytes,
    /// Rows in the payload; 0 for formats without row framing
    pub row_count: u64,
}

/// Builds [`WriteChunk`]s from streamed bytes or individual rows
#[derive(Debug)]
pub struct ChunkBuilder {
    framing: Option<RowFraming>,
    format_name: &'static str,
    max_bytes: u64,
    max_rows: u64,
    splitter: Option<RowSplitter>,
    current: BytesMut,
    current_rows: u64,
    next_sequence: u64,
    ready: VecDeque<WriteChunk>,
    warned: bool,
}

impl ChunkBuilder {
    /// Create a builder cutting chunks at `max_bytes` or `max_rows`,
    /// whichever is reached first
    pub fn new(format: &TableFormat, max_bytes: u64, max_rows: u64) -> Self {
        let framing = format.row_framing();
        Self {
            framing,
            format_name: format.name(),
            max_bytes: max_bytes.max(1),
            max_rows: max_rows.max(1),
            splitter: framing.map(RowSplitter::new),
            current: BytesMut::new(),
            current_rows: 0,
            next_sequence: 0,
            ready: VecDeque::new(),
            warned: false,
        }
    }

    /// Append raw input bytes
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        let Some(splitter) = self.splitter.as_mut() else {
            if !self.warned {
                tracing::warn!(
                    "Format {} cannot be split into rows; the input is written as a single chunk",
                    self.format_name
                );
                self.warned = true;
            }
            self.current.extend_from_slice(data);
            return Ok(());
        };

        splitter.push(data);
        let mut rows = Vec::new();
        while let Some(row) = splitter.next_row()? {
            rows.push(row);
        }
        for row in rows {
            self.add_row(&row);
        }
        Ok(())
    }

    /// Append one row given without its terminator
    pub fn push_row(&mut self, body: &[u8]) -> Result<()> {
        let framing = self.framing.ok_or_else(|| {
            TransferError::config(format!(
                "rows cannot be written one by one in {} format",
                self.format_name
            ))
        })?;
        let row = framing.terminate(framing.row_body(body));
        self.add_row(&row);
        Ok(())
    }

    /// Next complete chunk, if any
    pub fn pop_ready(&mut self) -> Option<WriteChunk> {
        self.ready.pop_front()
    }

    /// Flush the trailing row and the last partial chunk
    pub fn finish(&mut self) -> Result<()> {
        if let Some(splitter) = self.splitter.as_mut() {
            if let Some(row) = splitter.finish()? {
                self.add_row(&row);
            }
        }
        self.cut();
        Ok(())
    }

    /// Chunks emitted so far
    pub fn chunks_emitted(&self) -> u64 {
        self.next_sequence
    }

    fn add_row(&mut self, row: &[u8]) {
        let size = row.len() as u64;
        if self.current_rows > 0 && self.current.len() as u64 + size > self.max_bytes {
            self.cut();
        }
        self.current.extend_from_slice(row);
        self.current_rows += 1;
        if self.current_rows >= self.max_rows || self.current.len() as u64 >= self.max_bytes {
            self.cut();
        }
    }

    fn cut(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.ready.push_back(WriteChunk {
            sequence: self.next_sequence,
            payload: self.current.split().freeze(),
            row_count: self.current_rows,
        });
        self.next_sequence += 1;
        self.current_rows = 0;
    }
}

/// Turn a byte stream into a stream of chunks
pub fn chunk_stream(input: ByteStream, builder: ChunkBuilder) -> BoxStream<'static, Result<WriteChunk>> {
    futures::stream::try_unfold(
        (input, builder, false),
        |(mut input, mut builder, mut finished)| async move {
            loop {
                if let Some(chunk) = builder.pop_ready() {
                    return Ok(Some((chunk, (input, builder, finished))));
                }
                if finished {
                    return Ok(None);
                }
                match input.try_next().await? {
                    Some(data) => builder.push(&data)?,
                    None => {
                        builder.finish()?;
                        finished = true;
                    }
                }
            }
        },
    )
    .boxed()
}

/// Chunks of a list of row bodies
pub fn chunk_rows<I>(rows: I, mut builder: ChunkBuilder) -> Result<Vec<WriteChunk>>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    for row in rows {
        builder.push_row(row.as_ref())?;
    }
    builder.finish()?;
    Ok(std::iter::from_fn(|| builder.pop_ready()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(builder: &mut ChunkBuilder) -> Vec<WriteChunk> {
        std::iter::from_fn(|| builder.pop_ready()).collect()
    }

    #[test]
    fn test_cut_by_rows() {
        let mut builder = ChunkBuilder::new(&TableFormat::Yson, 1 << 20, 2);
        builder.push(b"{a=1};{a=2};{a=3};").unwrap();
        builder.finish().unwrap();
        let chunks = drain(&mut builder);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload, Bytes::from_static(b"{a=1};{a=2};"));
        assert_eq!(chunks[0].row_count, 2);
        assert_eq!(chunks[1].sequence, 1);
        assert_eq!(chunks[1].payload, Bytes::from_static(b"{a=3};"));
    }

    #[test]
    fn test_cut_by_bytes_never_splits_rows() {
        let mut builder = ChunkBuilder::new(&TableFormat::json(), 10, 100);
        builder.push(b"{\"a\":1}\n{\"a\":2}\n{\"long\":12345}\n").unwrap();
        builder.finish().unwrap();
        let payloads: Vec<_> = drain(&mut builder).into_iter().map(|c| c.payload).collect();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"{\"a\":1}\n"),
                Bytes::from_static(b"{\"a\":2}\n"),
                Bytes::from_static(b"{\"long\":12345}\n"),
            ]
        );
    }

    #[test]
    fn test_rows_split_across_buffers() {
        let mut builder = ChunkBuilder::new(&TableFormat::Yson, 1 << 20, 10);
        builder.push(b"{a=\"x;").unwrap();
        builder.push(b"y\"};{a=2}").unwrap();
        builder.finish().unwrap();
        let chunks = drain(&mut builder);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload, Bytes::from_static(b"{a=\"x;y\"};{a=2};"));
        assert_eq!(chunks[0].row_count, 2);
    }

    #[test]
    fn test_unframed_format_is_one_chunk() {
        let format = TableFormat::Skiff;
        let mut builder = ChunkBuilder::new(&format, 4, 1);
        builder.push(b"\x01\x02\x03").unwrap();
        builder.push(b"\x04\x05\x06").unwrap();
        builder.finish().unwrap();
        let chunks = drain(&mut builder);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload.len(), 6);
        assert_eq!(chunks[0].row_count, 0);
        assert!(builder.push_row(b"x").is_err());
    }

    #[test]
    fn test_chunk_rows_terminates_bodies() {
        let chunks = chunk_rows(["{a=1}", "{a=2};"], ChunkBuilder::new(&TableFormat::Yson, 1024, 10)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload, Bytes::from_static(b"{a=1};{a=2};"));
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        let chunks = chunk_rows(Vec::<Bytes>::new(), ChunkBuilder::new(&TableFormat::Yson, 1024, 10)).unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_stream() {
        let input: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{a=1};{a")),
            Ok(Bytes::from_static(b"=2};{a=3};")),
        ])
        .boxed();
        let chunks: Vec<WriteChunk> = chunk_stream(input, ChunkBuilder::new(&TableFormat::Yson, 1024, 2))
            .try_collect()
            .await
            .unwrap();
        let rows: Vec<u64> = chunks.iter().map(|c| c.row_count).collect();
        assert_eq!(rows, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_chunk_stream_truncated_row() {
        let input: ByteStream = futures::stream::iter(vec![Ok(Bytes::from_static(b"{a=1};{a=\"open"))]).boxed();
        let result: Result<Vec<WriteChunk>> =
            chunk_stream(input, ChunkBuilder::new(&TableFormat::Yson, 1024, 10)).try_collect().await;
        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
    }
}
