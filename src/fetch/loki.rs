//! Loki query client (`GET /loki/api/v1/query_range`).

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{LogSource, QueryRequest, SourceError};
use crate::types::RawEntry;

const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";

/// Blocking HTTP client for one Loki endpoint.
#[derive(Debug, Clone)]
pub struct LokiSource {
    client: Client,
    endpoint: String,
}

impl LokiSource {
    /// Creates a source targeting `endpoint` (e.g.
    /// `http://loki.monitoring.svc.cluster.local:3100`).
    ///
    /// `timeout` bounds each query end to end.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(SourceError::Rejected(
                "log store endpoint must not be empty".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::Rejected(format!("http client build failed: {err}")))?;
        Ok(Self { client, endpoint })
    }

    fn query_url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), QUERY_RANGE_PATH)
    }
}

impl LogSource for LokiSource {
    fn query(&self, request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError> {
        let response = self
            .client
            .get(self.query_url())
            .query(&[
                ("query", request.selector.clone()),
                ("start", request.start_ns.to_string()),
                ("end", request.end_ns.to_string()),
                ("limit", request.limit.to_string()),
                ("direction", "forward".to_string()),
            ])
            .send()
            .map_err(|err| SourceError::Unavailable(format!("query_range failed: {err}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Unavailable(format!(
                "query_range returned status {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SourceError::Rejected(format!(
                "query_range returned status {status}: {}",
                body.trim()
            )));
        }

        let body = response
            .text()
            .map_err(|err| SourceError::Unavailable(format!("query_range body read failed: {err}")))?;
        parse_query_range(&body)
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
    data: WireData,
}

#[derive(Debug, Deserialize)]
struct WireData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<WireStream>,
}

#[derive(Debug, Deserialize)]
struct WireStream {
    #[serde(default)]
    stream: BTreeMap<String, String>,
    /// `[ "<ns timestamp>", "<line>", {optional structured metadata} ]`
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Decode a `query_range` body of result type `streams` into entries.
pub fn parse_query_range(body: &str) -> Result<Vec<RawEntry>, SourceError> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|err| SourceError::Decode(format!("invalid query_range body: {err}")))?;

    if wire.status != "success" {
        return Err(SourceError::Rejected(format!(
            "query_range status '{}'",
            wire.status
        )));
    }
    if wire.data.result_type != "streams" {
        return Err(SourceError::Decode(format!(
            "expected result type 'streams', got '{}'",
            wire.data.result_type
        )));
    }

    let mut entries = Vec::new();
    for stream in wire.data.result {
        for value in stream.values {
            let (Some(Value::String(ts)), Some(Value::String(line))) = (value.first(), value.get(1))
            else {
                return Err(SourceError::Decode(format!(
                    "malformed stream value: {:?}",
                    value
                )));
            };
            let timestamp_ns = ts
                .parse::<u64>()
                .map_err(|err| SourceError::Decode(format!("bad timestamp '{ts}': {err}")))?;
            entries.push(RawEntry {
                timestamp_ns,
                labels: stream.stream.clone(),
                line: line.clone(),
            });
        }
    }

    Ok(entries)
}
