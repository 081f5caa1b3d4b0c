//! Control-marker codec
//!
//! The service embeds control rows in the data stream to announce range,
//! row and table boundaries. This module tells them apart from data rows,
//! decodes them into [`ControlMarker`]s and encodes markers back into the
//! wire form of the stream they came from.

use crate::error::{Result, TransferError};
use bytes::Bytes;
use serde_json::{Map, Value};

const RANGE_INDEX: &str = "range_index";
const ROW_INDEX: &str = "row_index";
const TABLE_INDEX: &str = "table_index";
const IGNORED_KEYS: [&str; 2] = ["key_switch", "tablet_index"];

/// Boundary announced in-band by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMarker {
    /// Following rows belong to this range of the request
    RangeIndex(u64),
    /// Row index of the next data row
    RowIndex(u64),
    /// Following rows come from this input table
    TableIndex(u64),
}

impl ControlMarker {
    /// Attribute name on the wire
    pub fn key(&self) -> &'static str {
        match self {
            Self::RangeIndex(_) => RANGE_INDEX,
            Self::RowIndex(_) => ROW_INDEX,
            Self::TableIndex(_) => TABLE_INDEX,
        }
    }

    /// Carried index
    pub fn value(&self) -> u64 {
        match self {
            Self::RangeIndex(v) | Self::RowIndex(v) | Self::TableIndex(v) => *v,
        }
    }
}

/// One framed item of a stream after classification
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Data row, passed through untouched
    Row(Bytes),
    /// Control row, in table, range, row order
    Control(Vec<ControlMarker>),
}

/// Codec selected once per session from the declared format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRowCodec {
    /// YSON text: `<"range_index"=1;>#;`
    Yson,
    /// Line-delimited JSON: `{"$attributes":{"range_index":1},"$value":null}`
    Json,
    /// Formats that carry no recognizable control rows
    Opaque,
}

impl ControlRowCodec {
    /// Cheap structural check run before any parsing
    pub fn looks_like_control_row(&self, row: &[u8]) -> bool {
        match self {
            Self::Yson => {
                let body = trim_end(row);
                let body = body.strip_suffix(b";").map(trim_end).unwrap_or(body);
                body.last() == Some(&b'#')
            }
            Self::Json => contains(row, b"$value"),
            Self::Opaque => false,
        }
    }

    /// Whether `row` is a control row.
    ///
    /// A YSON row that passes the structural check but does not parse is an
    /// error rather than a data row.
    pub fn is_control_row(&self, row: &[u8]) -> Result<bool> {
        if !self.looks_like_control_row(row) {
            return Ok(false);
        }
        match self {
            Self::Yson => parse_yson_attributes(row).map(|_| true),
            Self::Json => Ok(json_control_attributes(row).is_some()),
            Self::Opaque => Ok(false),
        }
    }

    /// Classify a framed row
    pub fn classify(&self, row: Bytes) -> Result<StreamItem> {
        if !self.looks_like_control_row(&row) {
            return Ok(StreamItem::Row(row));
        }
        match self {
            Self::Yson => self.load(&row).map(StreamItem::Control),
            Self::Json => match json_control_attributes(&row) {
                Some(attributes) => markers_from(attributes).map(StreamItem::Control),
                None => Ok(StreamItem::Row(row)),
            },
            Self::Opaque => Ok(StreamItem::Row(row)),
        }
    }

    /// Decode the markers of a control row
    pub fn load(&self, row: &[u8]) -> Result<Vec<ControlMarker>> {
        match self {
            Self::Yson => markers_from(parse_yson_attributes(row)?),
            Self::Json => {
                let attributes = json_control_attributes(row)
                    .ok_or_else(|| TransferError::protocol("JSON row is not a control row"))?;
                markers_from(attributes)
            }
            Self::Opaque => Err(TransferError::protocol(
                "format does not carry control rows",
            )),
        }
    }

    /// Encode one marker as a complete control row
    pub fn dump(&self, marker: ControlMarker) -> Result<Bytes> {
        match self {
            Self::Yson => Ok(Bytes::from(format!(
                "<\"{}\"={};>#;",
                marker.key(),
                marker.value()
            ))),
            Self::Json => Ok(Bytes::from(format!(
                "{{\"$attributes\":{{\"{}\":{}}},\"$value\":null}}\n",
                marker.key(),
                marker.value()
            ))),
            Self::Opaque => Err(TransferError::protocol(
                "format does not carry control rows",
            )),
        }
    }
}

fn markers_from(attributes: Vec<(String, Value)>) -> Result<Vec<ControlMarker>> {
    let mut table = None;
    let mut range = None;
    let mut row = None;

    for (key, value) in attributes {
        let slot = match key.as_str() {
            TABLE_INDEX => &mut table,
            RANGE_INDEX => &mut range,
            ROW_INDEX => &mut row,
            k if IGNORED_KEYS.contains(&k) => continue,
            other => {
                return Err(TransferError::protocol(format!(
                    "unknown control attribute '{}'",
                    other
                )))
            }
        };
        let index = value.as_u64().ok_or_else(|| {
            TransferError::protocol(format!("control attribute '{}' is not an index: {}", key, value))
        })?;
        *slot = Some(index);
    }

    let markers: Vec<ControlMarker> = [
        table.map(ControlMarker::TableIndex),
        range.map(ControlMarker::RangeIndex),
        row.map(ControlMarker::RowIndex),
    ]
    .into_iter()
    .flatten()
    .collect();

    if markers.is_empty() {
        return Err(TransferError::protocol("control row carries no markers"));
    }
    Ok(markers)
}

/// Attributes of a JSON control row, or `None` for a data row
fn json_control_attributes(row: &[u8]) -> Option<Vec<(String, Value)>> {
    let value: Value = serde_json::from_slice(row).ok()?;
    let mut object: Map<String, Value> = match value {
        Value::Object(object) => object,
        _ => return None,
    };
    if object.len() != 2 || !object.get("$value")?.is_null() {
        return None;
    }
    let attributes = match object.remove("$attributes")? {
        Value::Object(attributes) => attributes,
        _ => return None,
    };
    let known = |k: &str| matches!(k, RANGE_INDEX | ROW_INDEX | TABLE_INDEX) || IGNORED_KEYS.contains(&k);
    if attributes.is_empty() || !attributes.keys().all(|k| known(k.as_str())) {
        return None;
    }
    Some(attributes.into_iter().collect())
}

/// Parse `<key=value;...>#` with optional trailing `;`
fn parse_yson_attributes(row: &[u8]) -> Result<Vec<(String, Value)>> {
    let malformed = |what: &str| {
        TransferError::protocol(format!(
            "malformed YSON control row ({}): {}",
            what,
            String::from_utf8_lossy(row)
        ))
    };

    let mut cursor = Cursor::new(row);
    cursor.skip_ws();
    if !cursor.eat(b'<') {
        return Err(malformed("expected '<'"));
    }

    let mut attributes = Vec::new();
    loop {
        cursor.skip_ws();
        if cursor.eat(b'>') {
            break;
        }
        let key = cursor.key().ok_or_else(|| malformed("bad attribute name"))?;
        cursor.skip_ws();
        if !cursor.eat(b'=') {
            return Err(malformed("expected '='"));
        }
        cursor.skip_ws();
        let value = cursor.scalar().ok_or_else(|| malformed("bad attribute value"))?;
        attributes.push((key, value));
        cursor.skip_ws();
        if !cursor.eat(b';') && cursor.peek() != Some(b'>') {
            return Err(malformed("expected ';' or '>'"));
        }
    }

    cursor.skip_ws();
    if !cursor.eat(b'#') {
        return Err(malformed("expected '#'"));
    }
    cursor.skip_ws();
    cursor.eat(b';');
    cursor.skip_ws();
    if !cursor.at_end() {
        return Err(malformed("trailing bytes"));
    }
    Ok(attributes)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        &self.data[start..self.pos]
    }

    fn key(&mut self) -> Option<String> {
        if self.eat(b'"') {
            let mut key = Vec::new();
            loop {
                match self.peek()? {
                    b'"' => {
                        self.pos += 1;
                        break;
                    }
                    b'\\' => {
                        self.pos += 1;
                        key.push(self.peek()?);
                        self.pos += 1;
                    }
                    b => {
                        key.push(b);
                        self.pos += 1;
                    }
                }
            }
            return String::from_utf8(key).ok();
        }

        let ident = self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if ident.is_empty() {
            return None;
        }
        String::from_utf8(ident.to_vec()).ok()
    }

    fn scalar(&mut self) -> Option<Value> {
        match self.peek()? {
            b'#' => {
                self.pos += 1;
                Some(Value::Null)
            }
            b'%' => {
                self.pos += 1;
                match self.take_while(|b| b.is_ascii_alphabetic()) {
                    b"true" => Some(Value::Bool(true)),
                    b"false" => Some(Value::Bool(false)),
                    _ => None,
                }
            }
            _ => {
                let negative = self.eat(b'-');
                let digits = self.take_while(|b| b.is_ascii_digit());
                if digits.is_empty() {
                    return None;
                }
                self.eat(b'u');
                let magnitude: u64 = std::str::from_utf8(digits).ok()?.parse().ok()?;
                if negative {
                    i64::try_from(magnitude).ok().map(|m| Value::from(-m))
                } else {
                    Some(Value::from(magnitude))
                }
            }
        }
    }
}

fn trim_end(data: &[u8]) -> &[u8] {
    let trailing = data.iter().rev().take_while(|b| b.is_ascii_whitespace()).count();
    &data[..data.len() - trailing]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
