//! Tabular data formats
//!
//! The format declared for a transfer decides how the byte stream is framed
//! into rows and which control-row codec applies. Nothing is sniffed from
//! the content.

use crate::codec::{ControlRowCodec, RowFraming};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Format of rows on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum TableFormat {
    /// YSON text list fragment
    #[default]
    Yson,
    /// JSON, one row per line unless `pretty`
    Json {
        #[serde(default)]
        pretty: bool,
    },
    /// Tab-separated key=value lines
    Dsv,
    /// Binary Skiff; no row framing is available to the client
    Skiff,
}

impl TableFormat {
    /// Line-delimited JSON
    pub fn json() -> Self {
        Self::Json { pretty: false }
    }

    /// Format name as the service knows it
    pub fn name(&self) -> &'static str {
        match self {
            Self::Yson => "yson",
            Self::Json { .. } => "json",
            Self::Dsv => "dsv",
            Self::Skiff => "skiff",
        }
    }

    /// Control-row codec for streams in this format
    pub fn control_codec(&self) -> ControlRowCodec {
        match self {
            Self::Yson => ControlRowCodec::Yson,
            Self::Json { pretty: false } => ControlRowCodec::Json,
            _ => ControlRowCodec::Opaque,
        }
    }

    /// Row framing, if the client can split this format into rows
    pub fn row_framing(&self) -> Option<RowFraming> {
        match self {
            Self::Yson => Some(RowFraming::YsonListFragment),
            Self::Json { pretty: false } | Self::Dsv => Some(RowFraming::Lines),
            Self::Json { pretty: true } | Self::Skiff => None,
        }
    }

    /// Whether reads spanning several ranges can be resumed in this format
    pub fn supports_multi_range_retries(&self) -> bool {
        !matches!(self.control_codec(), ControlRowCodec::Opaque)
    }

    /// Wire form for `input_format` / `output_format` parameters
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Yson => json!({"$value": "yson", "$attributes": {"format": "text"}}),
            Self::Json { pretty: true } => json!({"$value": "json", "$attributes": {"format": "pretty"}}),
            Self::Json { pretty: false } => json!("json"),
            Self::Dsv => json!("dsv"),
            Self::Skiff => json!("skiff"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_per_format() {
        assert!(TableFormat::Yson.supports_multi_range_retries());
        assert!(TableFormat::json().supports_multi_range_retries());
        assert!(!TableFormat::Json { pretty: true }.supports_multi_range_retries());
        assert!(!TableFormat::Dsv.supports_multi_range_retries());
        assert!(TableFormat::Dsv.row_framing().is_some());
        assert!(TableFormat::Skiff.row_framing().is_none());
    }

    #[test]
    fn test_serde_roundtrip_names() {
        let parsed: TableFormat = serde_json::from_str(r#"{"name":"json"}"#).unwrap();
        assert_eq!(parsed, TableFormat::json());
        let parsed: TableFormat = serde_json::from_str(r#"{"name":"yson"}"#).unwrap();
        assert_eq!(parsed, TableFormat::Yson);
        assert_eq!(TableFormat::Yson.to_wire()["$value"], "yson");
    }
}
