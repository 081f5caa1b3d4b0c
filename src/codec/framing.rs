//! Row framing for streamed table data
//!
//! Splits an arbitrary sequence of byte buffers into whole rows without
//! parsing them. Scanning is incremental: bytes already inspected are not
//! rescanned when more data arrives.

use crate::error::{Result, TransferError};
use bytes::{Buf, Bytes, BytesMut};

/// How rows are delimited in a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFraming {
    /// YSON list fragment: items end with `;` at nesting depth zero
    YsonListFragment,
    /// One row per `\n`-terminated line
    Lines,
}

impl RowFraming {
    /// Row terminator appended to rows that arrive without one
    pub fn terminator(&self) -> u8 {
        match self {
            Self::YsonListFragment => b';',
            Self::Lines => b'\n',
        }
    }

    /// Row contents without the terminator and surrounding whitespace
    pub fn row_body<'a>(&self, row: &'a [u8]) -> &'a [u8] {
        let row = trim_ascii_end(trim_ascii_start(row));
        match row.split_last() {
            Some((last, body)) if *last == self.terminator() => trim_ascii_end(body),
            _ => row,
        }
    }

    /// Row contents followed by the terminator
    pub fn terminate(&self, body: &[u8]) -> Bytes {
        let mut row = BytesMut::with_capacity(body.len() + 1);
        row.extend_from_slice(body);
        row.extend_from_slice(&[self.terminator()]);
        row.freeze()
    }
}

/// Incremental splitter turning byte buffers into rows
#[derive(Debug)]
pub struct RowSplitter {
    framing: RowFraming,
    buffer: BytesMut,
    /// Bytes of `buffer` already scanned for the current row
    scanned: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl RowSplitter {
    /// Create a splitter for the given framing
    pub fn new(framing: RowFraming) -> Self {
        Self {
            framing,
            buffer: BytesMut::new(),
            scanned: 0,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as rows
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete row, terminator included
    pub fn next_row(&mut self) -> Result<Option<Bytes>> {
        match self.framing {
            RowFraming::Lines => Ok(self.next_line()),
            RowFraming::YsonListFragment => self.next_yson_item(),
        }
    }

    /// Flush the trailing row at end of stream.
    ///
    /// A trailing row without terminator is accepted and terminated. A YSON
    /// item cut inside a string or a nested structure is a protocol violation.
    pub fn finish(&mut self) -> Result<Option<Bytes>> {
        if self.framing == RowFraming::YsonListFragment && (self.in_string || self.depth > 0) {
            self.reset();
            return Err(TransferError::protocol("stream ended in the middle of a row"));
        }

        let rest = self.buffer.split().freeze();
        self.reset();
        let body = trim_ascii_end(trim_ascii_start(&rest));
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.framing.terminate(body)))
    }

    /// Drop any partially received row
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    fn next_line(&mut self) -> Option<Bytes> {
        loop {
            let pos = self.buffer[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(pos) = pos else {
                self.scanned = self.buffer.len();
                return None;
            };

            let line = self.buffer.split_to(self.scanned + pos + 1).freeze();
            self.scanned = 0;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line);
        }
    }

    fn next_yson_item(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.scanned == 0 {
                let skip = self
                    .buffer
                    .iter()
                    .take_while(|b| b.is_ascii_whitespace())
                    .count();
                self.buffer.advance(skip);
            }

            let mut end = None;
            let mut i = self.scanned;
            while i < self.buffer.len() {
                let b = self.buffer[i];
                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if b == b'\\' {
                        self.escaped = true;
                    } else if b == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match b {
                        b'"' => self.in_string = true,
                        b'{' | b'[' | b'<' => self.depth += 1,
                        b'}' | b']' | b'>' => {
                            if self.depth == 0 {
                                return Err(TransferError::protocol(format!(
                                    "unbalanced '{}' in YSON stream",
                                    b as char
                                )));
                            }
                            self.depth -= 1;
                        }
                        b';' if self.depth == 0 => {
                            end = Some(i + 1);
                            break;
                        }
                        _ => {}
                    }
                }
                i += 1;
            }

            let Some(end) = end else {
                self.scanned = i;
                return Ok(None);
            };

            let item = self.buffer.split_to(end).freeze();
            self.scanned = 0;
            // A bare separator carries no row
            if item.len() == 1 {
                continue;
            }
            return Ok(Some(item));
        }
    }
}

/// Split a complete buffer into rows
pub fn split_rows(framing: RowFraming, data: &[u8]) -> Result<Vec<Bytes>> {
    let mut splitter = RowSplitter::new(framing);
    splitter.push(data);

    let mut rows = Vec::new();
    while let Some(row) = splitter.next_row()? {
        rows.push(row);
    }
    if let Some(row) = splitter.finish()? {
        rows.push(row);
    }
    Ok(rows)
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let start = data.iter().take_while(|b| b.is_ascii_whitespace()).count();
    &data[start..]
}

fn trim_ascii_end(data: &[u8]) -> &[u8] {
    let trailing = data.iter().rev().take_while(|b| b.is_ascii_whitespace()).count();
    &data[..data.len() - trailing]
}
