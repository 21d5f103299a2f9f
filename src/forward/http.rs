use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

use super::{Sink, SinkError};
use crate::types::OccurrenceRecord;

/// Posts each occurrence as a JSON document to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct WireOccurrence<'a> {
    cluster_id: u64,
    template: &'a str,
    sample: &'a str,
    timestamp_ns: u64,
    count: u64,
}

impl<'a> From<&'a OccurrenceRecord> for WireOccurrence<'a> {
    fn from(record: &'a OccurrenceRecord) -> Self {
        Self {
            cluster_id: record.cluster_id,
            template: &record.template,
            sample: &record.sample,
            timestamp_ns: record.timestamp_ns,
            count: record.count,
        }
    }
}

/// Map a collector response status onto the sink contract.
fn classify_status(status: StatusCode) -> Result<(), SinkError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(SinkError::Unreachable(format!("collector returned status {status}")))
    } else {
        Err(SinkError::Rejected(format!("collector returned status {status}")))
    }
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(SinkError::InvalidUrl(endpoint));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SinkError::InvalidUrl(format!("http client build failed: {err}")))?;
        Ok(Self { client, endpoint })
    }
}

impl Sink for HttpSink {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&WireOccurrence::from(record))
            .send()
            .map_err(|err| SinkError::Unreachable(format!("occurrence post failed: {err}")))?;
        classify_status(response.status())
    }
}
