//! Configuration settings for TableCopy
//!
//! Defines all transfer options and their defaults. A configuration is
//! loaded from a JSON file, adjusted from the environment, and validated
//! before a client is built from it.

use crate::error::{Result, TransferError};
use crate::retry::{RetryConfig, DEFAULT_RETRIABLE_CODES};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Proxy base URL
pub const ENV_PROXY_URL: &str = "TABLECOPY_PROXY_URL";
/// Enable parallel reads ("1"/"true"/"yes")
pub const ENV_READ_PARALLEL: &str = "TABLECOPY_READ_PARALLEL";
/// Enable parallel writes ("1"/"true"/"yes")
pub const ENV_WRITE_PARALLEL: &str = "TABLECOPY_WRITE_PARALLEL";
/// Write chunk size, human readable ("128M")
pub const ENV_CHUNK_SIZE: &str = "TABLECOPY_CHUNK_SIZE";

/// Complete transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransferConfig {
    /// HTTP proxy connection
    pub proxy: ProxyConfig,
    /// Read resumption
    pub read_retries: ReadRetryConfig,
    /// Partitioned reads
    pub read_parallel: ReadParallelConfig,
    /// Write chunking and retries
    pub write_retries: WriteRetryConfig,
    /// Writes through temporary tables
    pub write_parallel: WriteParallelConfig,
    /// Deadline for a whole transfer; no retry starts after it
    pub transfer_timeout_ms: Option<u64>,
    /// Service error codes treated as transient
    pub retriable_error_codes: Vec<i64>,
}

/// Connection to the HTTP proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base URL, e.g. `http://proxy.example.com`
    pub url: String,
    /// Timeout of one request attempt, including each body read (0 = none)
    pub request_timeout_ms: u64,
    /// Whether the proxy announces ranges with `range_index` control rows
    pub range_index_reporting: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: 60_000,
            range_index_reporting: true,
        }
    }
}

/// Resumable reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRetryConfig {
    /// Resume reads after retriable failures
    pub enable: bool,
    /// Permit resuming reads that span several ranges
    pub allow_multiple_ranges: bool,
    /// Backoff between read attempts
    pub retry: RetryConfig,
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            allow_multiple_ranges: false,
            retry: RetryConfig {
                max_retries: 30,
                ..Default::default()
            },
        }
    }
}

/// Partitioned reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadParallelConfig {
    /// Read partitions concurrently
    pub enable: bool,
    /// Partitions read at the same time
    pub max_thread_count: usize,
    /// Target uncompressed bytes per partition
    #[serde(deserialize_with = "deserialize_size")]
    pub data_size_per_thread: u64,
    /// Items buffered per partition channel
    pub channel_capacity: usize,
}

impl Default for ReadParallelConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_thread_count: 10,
            data_size_per_thread: 8 * 1024 * 1024,
            channel_capacity: 1024,
        }
    }
}

/// Chunked writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRetryConfig {
    /// Split writes into retried chunks
    pub enable: bool,
    /// Byte bound of a chunk
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: u64,
    /// Row bound of a chunk
    pub rows_chunk_size: u64,
    /// Backoff between write attempts
    pub retry: RetryConfig,
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            chunk_size: 128 * 1024 * 1024,
            rows_chunk_size: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// Chunks written through temporary tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteParallelConfig {
    /// Upload chunks concurrently
    pub enable: bool,
    /// Chunks uploaded at the same time
    pub max_thread_count: usize,
    /// Directory for temporary tables
    pub temp_directory: String,
}

impl Default for WriteParallelConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_thread_count: 10,
            temp_directory: "//tmp/tablecopy".to_string(),
        }
    }
}

impl TransferConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            TransferError::config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Apply `TABLECOPY_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_PROXY_URL) {
            self.proxy.url = url;
        }
        if let Some(value) = lookup(ENV_READ_PARALLEL) {
            self.read_parallel.enable = parse_flag(ENV_READ_PARALLEL, &value)?;
        }
        if let Some(value) = lookup(ENV_WRITE_PARALLEL) {
            self.write_parallel.enable = parse_flag(ENV_WRITE_PARALLEL, &value)?;
        }
        if let Some(value) = lookup(ENV_CHUNK_SIZE) {
            self.write_retries.chunk_size = parse_size(&value)
                .map_err(|e| TransferError::config(format!("{}: {}", ENV_CHUNK_SIZE, e)))?;
        }
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.read_parallel.max_thread_count == 0 {
            return Err(TransferError::config("read_parallel.max_thread_count must be at least 1"));
        }
        if self.read_parallel.data_size_per_thread == 0 {
            return Err(TransferError::config("read_parallel.data_size_per_thread must be positive"));
        }
        if self.read_parallel.channel_capacity == 0 {
            return Err(TransferError::config("read_parallel.channel_capacity must be positive"));
        }
        if self.write_parallel.max_thread_count == 0 {
            return Err(TransferError::config("write_parallel.max_thread_count must be at least 1"));
        }
        if self.write_parallel.temp_directory.is_empty() {
            return Err(TransferError::config("write_parallel.temp_directory is empty"));
        }
        if self.write_retries.chunk_size == 0 || self.write_retries.rows_chunk_size == 0 {
            return Err(TransferError::config("write chunk bounds must be positive"));
        }
        for retry in [&self.read_retries.retry, &self.write_retries.retry] {
            if retry.backoff_multiplier < 1.0 {
                return Err(TransferError::config("backoff_multiplier must be at least 1.0"));
            }
        }
        Ok(())
    }

    /// Per-attempt timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.proxy.request_timeout_ms > 0).then(|| Duration::from_millis(self.proxy.request_timeout_ms))
    }

    /// Whole-transfer deadline
    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_ms.map(Duration::from_millis)
    }

    /// Retriable codes, falling back to the defaults when none are configured
    pub fn retriable_codes(&self) -> Vec<i64> {
        if self.retriable_error_codes.is_empty() {
            DEFAULT_RETRIABLE_CODES.to_vec()
        } else {
            self.retriable_error_codes.clone()
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(TransferError::config(format!("{}: not a boolean: {}", key, other))),
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Human(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Human(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let units: [(&str, u64); 4] = [
        ("T", 1024u64.pow(4)),
        ("G", 1024u64.pow(3)),
        ("M", 1024u64.pow(2)),
        ("K", 1024),
    ];

    let digits = size.strip_suffix('B').unwrap_or(&size);
    let (num_str, multiplier) = units
        .iter()
        .find_map(|(suffix, mult)| digits.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((digits, 1));

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;
    if num < 0.0 {
        return Err(format!("Negative size: {}", size));
    }

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("1.5G").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_size("10b").unwrap(), 10);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = TransferConfig::default();
        config.validate().unwrap();
        assert!(config.read_retries.enable);
        assert!(!config.read_retries.allow_multiple_ranges);
        assert_eq!(config.write_retries.rows_chunk_size, 100);
        assert_eq!(config.retriable_codes(), DEFAULT_RETRIABLE_CODES.to_vec());
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_file_with_human_sizes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "proxy": {{"url": "http://proxy:8080"}},
                "read_parallel": {{"enable": true, "data_size_per_thread": "16M"}},
                "write_retries": {{"chunk_size": 4096, "retry": {{"max_retries": 2}}}},
                "retriable_error_codes": [100, 7]
            }}"#
        )
        .unwrap();

        let config = TransferConfig::from_file(file.path()).unwrap();
        assert_eq!(config.proxy.url, "http://proxy:8080");
        assert_eq!(config.proxy.request_timeout_ms, 60_000);
        assert!(config.read_parallel.enable);
        assert_eq!(config.read_parallel.data_size_per_thread, 16 * 1024 * 1024);
        assert_eq!(config.read_parallel.max_thread_count, 10);
        assert_eq!(config.write_retries.chunk_size, 4096);
        assert_eq!(config.write_retries.retry.max_retries, 2);
        assert_eq!(config.write_retries.retry.initial_delay_ms, 500);
        assert_eq!(config.retriable_codes(), vec![100, 7]);
    }

    #[test]
    fn test_from_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            TransferConfig::from_file(file.path()),
            Err(TransferError::ConfigError(_))
        ));
        assert!(matches!(
            TransferConfig::from_file(Path::new("/nonexistent/tablecopy.json")),
            Err(TransferError::Io { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_PROXY_URL, "http://other"),
            (ENV_READ_PARALLEL, "yes"),
            (ENV_WRITE_PARALLEL, "0"),
            (ENV_CHUNK_SIZE, "2M"),
        ]
        .into_iter()
        .collect();

        let mut config = TransferConfig::default();
        config.write_parallel.enable = true;
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.proxy.url, "http://other");
        assert!(config.read_parallel.enable);
        assert!(!config.write_parallel.enable);
        assert_eq!(config.write_retries.chunk_size, 2 * 1024 * 1024);

        let mut config = TransferConfig::default();
        let bad = config.apply_overrides(|key| (key == ENV_READ_PARALLEL).then(|| "maybe".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = TransferConfig::default();
        config.write_retries.rows_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.read_parallel.max_thread_count = 0;
        assert!(config.validate().is_err());
    }
}
