//! Read session bookkeeping
//!
//! A [`ReadSession`] tracks how far a read has progressed so that a failed
//! connection can be resumed exactly where it stopped. It owns a private
//! copy of the request and rewrites it before every retry:
//!
//! * ranges the service has finished are dropped,
//! * the range being read gets its lower limit moved to the next row,
//! * a path without ranges gains an open range starting at the next row.
//!
//! Control markers are forwarded to the caller once per logical boundary,
//! with range indexes translated back to the caller's original numbering.
//!
//! The session performs no I/O; [`TableReader`](super::TableReader) drives it.

use crate::codec::{ControlMarker, ControlRowCodec, StreamItem};
use crate::error::{Result, TransferError};
use crate::service::{ControlAttributes, ReadRequest, ResponseParameters, ServiceCapabilities};
use crate::table::{Range, ReadLimit, RowIndex};
use bytes::Bytes;
use std::collections::VecDeque;

/// Item delivered to the consumer of a read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadItem {
    /// Data row, terminator included
    Row(Bytes),
    /// Control marker the caller asked for
    Control(ControlMarker),
}

impl ReadItem {
    /// Wire bytes of this item in the given codec
    pub fn into_bytes(self, codec: ControlRowCodec) -> Result<Bytes> {
        match self {
            Self::Row(row) => Ok(row),
            Self::Control(marker) => codec.dump(marker),
        }
    }
}

/// Resume state of one read
#[derive(Debug)]
pub struct ReadSession {
    request: ReadRequest,
    caller_controls: ControlAttributes,
    codec: ControlRowCodec,
    resumable: bool,

    started: bool,
    responses: u32,
    next_row_index: RowIndex,
    /// Absolute index of the first remaining range
    current_range_index: u64,
    /// Range index, in the numbering of the current response, of the first
    /// remaining range
    response_range_index: u64,
    range_started: bool,

    echoed_range_index: Option<u64>,
    row_index_echoed: bool,
    echoed_table_index: Option<u64>,
}

impl ReadSession {
    /// Validate a read and set up its session.
    ///
    /// Everything that can make a read fail without the network is checked
    /// here: mixed ranges, unordered resumable reads, and multi-range
    /// resumption the deployment or format cannot support.
    pub fn new(
        request: ReadRequest,
        retries_enabled: bool,
        allow_multiple_ranges: bool,
        capabilities: ServiceCapabilities,
    ) -> Result<Self> {
        let mut request = request;
        request.path = request.path.normalized()?;

        let resumable = retries_enabled && request.format.row_framing().is_some();
        if resumable && request.unordered {
            return Err(TransferError::config(
                "unordered reads cannot be combined with read retries",
            ));
        }

        let caller_controls = request.control_attributes;
        if resumable && request.path.ranges.len() > 1 {
            if !allow_multiple_ranges {
                return Err(TransferError::protocol(
                    "resuming a read of several ranges is not allowed; \
                     enable read_retries.allow_multiple_ranges or disable read retries",
                ));
            }
            if !capabilities.range_index_reporting {
                return Err(TransferError::protocol(
                    "the service does not report range indexes, reads of several ranges cannot be resumed",
                ));
            }
            if !request.format.supports_multi_range_retries() {
                return Err(TransferError::protocol(format!(
                    "reads of several ranges can only be resumed in yson or json format, not {}",
                    request.format.name()
                )));
            }
            request.control_attributes.enable_row_index = true;
            request.control_attributes.enable_range_index = true;
        }

        Ok(Self {
            codec: request.format.control_codec(),
            request,
            caller_controls,
            resumable,
            started: false,
            responses: 0,
            next_row_index: 0,
            current_range_index: 0,
            response_range_index: 0,
            range_started: false,
            echoed_range_index: None,
            row_index_echoed: false,
            echoed_table_index: None,
        })
    }

    /// Request to issue next
    pub fn request(&self) -> &ReadRequest {
        &self.request
    }

    /// Whether failures may be resumed
    pub fn resumable(&self) -> bool {
        self.resumable
    }

    /// Codec of the stream
    pub fn codec(&self) -> ControlRowCodec {
        self.codec
    }

    /// Whether a response has been opened
    pub fn started(&self) -> bool {
        self.started
    }

    /// Row index of the next data row
    pub fn next_row_index(&self) -> RowIndex {
        self.next_row_index
    }

    /// Absolute index of the range being read
    pub fn current_range_index(&self) -> u64 {
        self.current_range_index
    }

    /// Start consuming a new response
    pub fn begin_response(&mut self, parameters: &ResponseParameters) -> Result<()> {
        self.responses += 1;
        self.response_range_index = 0;

        if !self.started {
            self.next_row_index = match parameters.start_row_index {
                Some(index) => index,
                None if self.resumable => {
                    return Err(TransferError::protocol(
                        "read response carries no start_row_index, the read cannot be resumed",
                    ))
                }
                None => 0,
            };
            self.started = true;
        }
        Ok(())
    }

    /// Account for one framed row of the response and queue what the
    /// caller should see
    pub fn observe(&mut self, row: Bytes, out: &mut VecDeque<ReadItem>) -> Result<()> {
        match self.codec.classify(row)? {
            StreamItem::Row(row) => {
                self.next_row_index += 1;
                self.range_started = true;
                out.push_back(ReadItem::Row(row));
            }
            StreamItem::Control(markers) => {
                for marker in markers {
                    self.on_marker(marker, out)?;
                }
            }
        }
        Ok(())
    }

    fn remaining_ranges(&self) -> u64 {
        self.request.path.ranges.len().max(1) as u64
    }

    fn on_marker(&mut self, marker: ControlMarker, out: &mut VecDeque<ReadItem>) -> Result<()> {
        match marker {
            ControlMarker::TableIndex(index) => {
                if self.caller_controls.enable_table_index && self.echoed_table_index != Some(index) {
                    out.push_back(ReadItem::Control(marker));
                }
                self.echoed_table_index = Some(index);
            }
            ControlMarker::RangeIndex(index) => {
                let skip = index.checked_sub(self.response_range_index).ok_or_else(|| {
                    TransferError::protocol(format!(
                        "range index went back from {} to {}",
                        self.response_range_index, index
                    ))
                })?;

                if skip > 0 {
                    let remaining = self.remaining_ranges();
                    if skip >= remaining {
                        return Err(TransferError::protocol(format!(
                            "range index {} points past the {} remaining ranges",
                            index, remaining
                        )));
                    }
                    self.request.path.ranges.drain(..skip as usize);
                    self.current_range_index += skip;
                    self.response_range_index = index;
                    self.range_started = false;
                }

                if self.echoed_range_index != Some(self.current_range_index) {
                    self.row_index_echoed = false;
                    if self.caller_controls.enable_range_index {
                        out.push_back(ReadItem::Control(ControlMarker::RangeIndex(
                            self.current_range_index,
                        )));
                    }
                    self.echoed_range_index = Some(self.current_range_index);
                }
            }
            ControlMarker::RowIndex(index) => {
                self.next_row_index = index;
                // Without range markers on the wire a range change is
                // invisible; only a resumed response can repeat a marker.
                let tracks_ranges = self.request.control_attributes.enable_range_index;
                let repeated = self.row_index_echoed && (tracks_ranges || self.responses > 1);
                if self.caller_controls.enable_row_index && !repeated {
                    out.push_back(ReadItem::Control(marker));
                }
                self.row_index_echoed = true;
            }
        }
        Ok(())
    }

    /// Rewrite the private request so the next response starts right after
    /// the last delivered row
    pub fn prepare_retry(&mut self) {
        if !self.started {
            return;
        }

        let ranges = &mut self.request.path.ranges;
        if ranges.is_empty() {
            ranges.push(Range::from_row(self.next_row_index));
        } else if self.range_started {
            let range = &mut ranges[0];
            if range.exact.is_some() {
                *range = Range::empty();
            } else {
                range.lower_limit = Some(ReadLimit::row(self.next_row_index));
            }
        }
        self.range_started = false;
    }
}
