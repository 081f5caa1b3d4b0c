//! HTTP proxy client
//!
//! Talks to the storage service through its HTTP proxy API (`/api/v4`).
//! Heavy commands (`read_table`, `write_table`) carry their parameters in
//! the `X-YT-Parameters` header so the body is free for data; light
//! commands send parameters as a JSON body.

use super::{
    ReadRequest, ReadResponse, ResponseParameters, ServiceCapabilities, TableAttributes,
    TableService, WriteRequest,
};
use crate::config::ProxyConfig;
use crate::error::{Result, TransferError, TransportErrorKind};
use crate::table::TablePath;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use std::time::Duration;

const PARAMETERS_HEADER: &str = "X-YT-Parameters";
const RESPONSE_PARAMETERS_HEADER: &str = "X-YT-Response-Parameters";
const ERROR_HEADER: &str = "X-YT-Error";
const HEADER_FORMAT_HEADER: &str = "X-YT-Header-Format";

/// Service code for "node already exists"
const ALREADY_EXISTS_CODE: i64 = 501;

/// Where a command expects its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterPlacement {
    Header,
    Body,
}

/// Table service reached through the HTTP proxy
#[derive(Debug, Clone)]
pub struct HttpProxyClient {
    client: Client,
    base_url: String,
    capabilities: ServiceCapabilities,
}

impl HttpProxyClient {
    /// Client for the proxy at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::from_config(&ProxyConfig {
            url: base_url.into(),
            ..Default::default()
        })
    }

    /// Client built from proxy settings
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(TransferError::config("proxy.url is not set"));
        }

        let mut builder = Client::builder();
        if config.request_timeout_ms > 0 {
            builder = builder.connect_timeout(Duration::from_millis(config.request_timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| TransferError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.url),
            capabilities: ServiceCapabilities {
                range_index_reporting: config.range_index_reporting,
            },
        })
    }

    /// Override the reported capabilities
    pub fn with_capabilities(mut self, capabilities: ServiceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    async fn execute(
        &self,
        method: Method,
        command: &str,
        parameters: Value,
        placement: ParameterPlacement,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let url = command_url(&self.base_url, command);
        tracing::debug!("{} {} {}", method, url, parameters);

        let mut request = self
            .client
            .request(method, &url)
            .header(HEADER_FORMAT_HEADER, "json");
        request = match placement {
            ParameterPlacement::Header => request.header(PARAMETERS_HEADER, parameters.to_string()),
            ParameterPlacement::Body => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(parameters.to_string()),
        };
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let header = response
            .headers()
            .get(ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(transport_error)?;
        Err(decode_error(status, header.as_deref(), &body))
    }

    async fn value_of(response: Response) -> Result<Value> {
        let body = response.bytes().await.map_err(transport_error)?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        let value: Value = serde_json::from_slice(&body)?;
        Ok(match value {
            Value::Object(mut object) if object.contains_key("value") => {
                object.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

#[async_trait]
impl TableService for HttpProxyClient {
    fn capabilities(&self) -> ServiceCapabilities {
        self.capabilities
    }

    async fn read_table(&self, request: &ReadRequest) -> Result<ReadResponse> {
        let response = self
            .execute(
                Method::GET,
                "read_table",
                read_parameters(request),
                ParameterPlacement::Header,
                None,
            )
            .await?;

        let parameters = parse_response_parameters(
            response
                .headers()
                .get(RESPONSE_PARAMETERS_HEADER)
                .and_then(|v| v.to_str().ok()),
        )?;
        let body = response.bytes_stream().map_err(transport_error).boxed();
        Ok(ReadResponse { parameters, body })
    }

    async fn write_table(&self, request: &WriteRequest, payload: Bytes) -> Result<()> {
        self.execute(
            Method::PUT,
            "write_table",
            write_parameters(request),
            ParameterPlacement::Header,
            Some(payload),
        )
        .await?;
        Ok(())
    }

    async fn create_table(&self, path: &str, ignore_existing: bool) -> Result<()> {
        let parameters = json!({
            "path": path,
            "type": "table",
            "ignore_existing": ignore_existing,
        });
        match self
            .execute(Method::POST, "create", parameters, ParameterPlacement::Body, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(TransferError::Service {
                code: ALREADY_EXISTS_CODE,
                message,
                ..
            }) => Err(TransferError::conflict(path, message)),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self
            .execute(
                Method::GET,
                "exists",
                json!({ "path": path }),
                ParameterPlacement::Header,
                None,
            )
            .await?;
        match Self::value_of(response).await? {
            Value::Bool(exists) => Ok(exists),
            other => Err(TransferError::protocol(format!(
                "unexpected exists response: {}",
                other
            ))),
        }
    }

    async fn remove(&self, path: &str, force: bool) -> Result<()> {
        self.execute(
            Method::POST,
            "remove",
            json!({ "path": path, "force": force }),
            ParameterPlacement::Body,
            None,
        )
        .await?;
        Ok(())
    }

    async fn concatenate(&self, sources: &[String], destination: &TablePath) -> Result<()> {
        let parameters = json!({
            "source_paths": sources,
            "destination_path": destination.to_wire(),
        });
        self.execute(
            Method::POST,
            "concatenate",
            parameters,
            ParameterPlacement::Body,
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_table_attributes(&self, path: &str) -> Result<TableAttributes> {
        let parameters = json!({
            "path": format!("{}/@", path),
            "attributes": [
                "row_count",
                "uncompressed_data_size",
                "compressed_data_size",
                "chunk_count",
                "dynamic",
            ],
        });
        let response = self
            .execute(Method::GET, "get", parameters, ParameterPlacement::Header, None)
            .await?;
        let value = Self::value_of(response).await?;
        serde_json::from_value(value)
            .map_err(|e| TransferError::protocol(format!("invalid attributes of {}: {}", path, e)))
    }
}

fn normalize_base_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

fn command_url(base_url: &str, command: &str) -> String {
    format!("{}/api/v4/{}", base_url, command)
}

fn read_parameters(request: &ReadRequest) -> Value {
    json!({
        "path": request.path.to_wire(),
        "output_format": request.format.to_wire(),
        "control_attributes": request.control_attributes,
        "unordered": request.unordered,
    })
}

fn write_parameters(request: &WriteRequest) -> Value {
    json!({
        "path": request.path.to_wire(),
        "input_format": request.format.to_wire(),
    })
}

fn parse_response_parameters(header: Option<&str>) -> Result<ResponseParameters> {
    match header {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(text).map_err(|e| {
            TransferError::protocol(format!("invalid {} header: {}", RESPONSE_PARAMETERS_HEADER, e))
        }),
        _ => Ok(ResponseParameters::default()),
    }
}

/// Innermost non-zero error code of a service error tree
fn error_code(error: &Value) -> Option<i64> {
    let own = error.get("code").and_then(Value::as_i64).filter(|c| *c != 0);
    let inner = error
        .get("inner_errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.iter().find_map(error_code));
    inner.or(own)
}

fn decode_error(status: u16, header: Option<&str>, body: &[u8]) -> TransferError {
    let parsed = header
        .and_then(|h| serde_json::from_str::<Value>(h).ok())
        .or_else(|| serde_json::from_slice::<Value>(body).ok())
        .filter(Value::is_object);

    match parsed {
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            TransferError::service(error_code(&error).unwrap_or(1), Some(status), message)
        }
        None => {
            let text = String::from_utf8_lossy(body);
            TransferError::service(1, Some(status), text.trim().to_string())
        }
    }
}

fn transport_error(err: reqwest::Error) -> TransferError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Reset
    };
    TransferError::transport(kind, err.to_string())
}
