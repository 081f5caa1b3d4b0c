//! Table references and row ranges
//!
//! A [`TablePath`] names a table on the service and optionally narrows the
//! transfer to an ordered list of [`Range`]s. Its wire form is the JSON
//! encoding of a rich path: `{"$value": "//path", "$attributes": {...}}`.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Row offset inside a table, stable for the lifetime of one transfer
pub type RowIndex = u64;

/// One side of a range, or the single row of an exact range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadLimit {
    /// Row index limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<RowIndex>,
    /// Key limit (sorted tables only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<Value>>,
}

impl ReadLimit {
    /// Limit on a row index
    pub fn row(index: RowIndex) -> Self {
        Self {
            row_index: Some(index),
            key: None,
        }
    }

    /// Limit on a key
    pub fn key(key: Vec<Value>) -> Self {
        Self {
            row_index: None,
            key: Some(key),
        }
    }

    /// Whether this limit uses anything besides a row index
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }
}

/// Contiguous span of rows or a single exact row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<ReadLimit>,
    /// Exclusive upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<ReadLimit>,
    /// Single selected row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<ReadLimit>,
}

impl Range {
    /// Rows `[lower, upper)`
    pub fn rows(lower: RowIndex, upper: RowIndex) -> Self {
        Self {
            lower_limit: Some(ReadLimit::row(lower)),
            upper_limit: Some(ReadLimit::row(upper)),
            exact: None,
        }
    }

    /// Rows from `lower` to the end of the table
    pub fn from_row(lower: RowIndex) -> Self {
        Self {
            lower_limit: Some(ReadLimit::row(lower)),
            ..Default::default()
        }
    }

    /// Exactly one row
    pub fn exact_row(index: RowIndex) -> Self {
        Self {
            exact: Some(ReadLimit::row(index)),
            ..Default::default()
        }
    }

    /// Degenerate range selecting nothing
    pub fn empty() -> Self {
        Self::rows(0, 0)
    }

    /// Check the exact/limits exclusivity
    pub fn validate(&self) -> Result<()> {
        if self.exact.is_some() && (self.lower_limit.is_some() || self.upper_limit.is_some()) {
            return Err(TransferError::config(
                "range mixes an exact selector with lower/upper limits",
            ));
        }
        Ok(())
    }

    /// Whether any limit of this range is a key limit
    pub fn has_key_limit(&self) -> bool {
        [&self.lower_limit, &self.upper_limit, &self.exact]
            .into_iter()
            .flatten()
            .any(ReadLimit::has_key)
    }

    /// Row bounds `[lower, upper)` clamped to `row_count`.
    ///
    /// Fails for key limits, which cannot be translated to row offsets
    /// without the service.
    pub fn row_bounds(&self, row_count: RowIndex) -> Result<(RowIndex, RowIndex)> {
        fn row_of(limit: &ReadLimit) -> Result<RowIndex> {
            limit
                .row_index
                .ok_or_else(|| TransferError::config("range limit has no row_index"))
        }

        if let Some(exact) = &self.exact {
            let index = row_of(exact)?;
            return Ok((index, index + 1));
        }

        let lower = self.lower_limit.as_ref().map(row_of).transpose()?.unwrap_or(0);
        let upper = self
            .upper_limit
            .as_ref()
            .map(row_of)
            .transpose()?
            .unwrap_or(row_count)
            .min(row_count);
        Ok((lower, upper.max(lower)))
    }
}

/// Reference to a table plus optional ranges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TablePath {
    /// Service-side path, e.g. `//home/project/table`
    pub path: String,
    /// Ordered range selectors; empty means the whole table
    #[serde(default)]
    pub ranges: Vec<Range>,
    /// Append instead of overwrite on writes
    #[serde(default)]
    pub append: bool,
}

impl TablePath {
    /// Reference to a whole table
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ranges: Vec::new(),
            append: false,
        }
    }

    /// Add a range selector
    pub fn with_range(mut self, range: Range) -> Self {
        self.ranges.push(range);
        self
    }

    /// Set append mode
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Validate every range, returning the reference unchanged on success
    pub fn normalized(self) -> Result<Self> {
        if self.path.is_empty() {
            return Err(TransferError::config("table path is empty"));
        }
        for range in &self.ranges {
            range.validate()?;
        }
        Ok(self)
    }

    /// Whether any range uses key limits
    pub fn has_key_limit_in_ranges(&self) -> bool {
        self.ranges.iter().any(Range::has_key_limit)
    }

    /// Rich-path JSON sent to the service
    pub fn to_wire(&self) -> Value {
        let mut attributes = Map::new();
        if !self.ranges.is_empty() {
            attributes.insert("ranges".to_string(), json!(self.ranges));
        }
        if self.append {
            attributes.insert("append".to_string(), Value::Bool(true));
        }

        if attributes.is_empty() {
            Value::String(self.path.clone())
        } else {
            json!({ "$value": self.path, "$attributes": attributes })
        }
    }
}

impl std::fmt::Display for TablePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)?;
        if !self.ranges.is_empty() {
            write!(f, " ({} ranges)", self.ranges.len())?;
        }
        Ok(())
    }
}
