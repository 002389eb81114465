//! InfluxDB v2 HTTP sink.
//!
//! Points are posted as line protocol to `/api/v2/write` with second
//! precision. InfluxDB overwrites a point with the same measurement, tag set
//! and timestamp, so the natural key is carried in the tags (`block_number`,
//! `tx_hash`, `log_index`, `batch_index`) to keep distinct facts from colliding.

use async_trait::async_trait;
use ingest_data::Record;
use reqwest::StatusCode;
use std::time::Duration;

use crate::line_protocol::encode_batch;
use crate::sink::{RecordSink, SubmitError};

#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub timeout: Duration,
}

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
}

impl InfluxSink {
    /// # Errors
    /// Returns [`SubmitError::Fatal`] if the HTTP client cannot be built.
    pub fn new(settings: &InfluxSettings) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| SubmitError::Fatal(format!("failed to build HTTP client: {e}")))?;
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=s",
            settings.url.trim_end_matches('/'),
            settings.org,
            settings.bucket
        );
        Ok(Self {
            client,
            write_url,
            token: settings.token.clone(),
        })
    }
}

/// Maps an HTTP status and body to a submission outcome.
fn classify_response(status: StatusCode, body: &str) -> SubmitError {
    let reason = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            SubmitError::Transient(reason)
        }
        s if s.is_server_error() => SubmitError::Transient(reason),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SubmitError::Rejected {
            index: rejected_line(body),
            reason,
        },
        StatusCode::PAYLOAD_TOO_LARGE => SubmitError::Rejected {
            index: None,
            reason,
        },
        _ => SubmitError::Fatal(reason),
    }
}

/// Zero-based index of the first line InfluxDB names in a parse error
/// (`... line 3: ...`).
fn rejected_line(body: &str) -> Option<usize> {
    let at = body.find("line ")?;
    let digits: String = body[at + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<usize>().ok()?.checked_sub(1)
}

#[async_trait]
impl RecordSink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    #[tracing::instrument(skip(self, records), fields(points = records.len()))]
    async fn submit(&self, records: &[Record]) -> Result<(), SubmitError> {
        let body = encode_batch(records);
        let response = self
            .client
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| SubmitError::Transient(format!("InfluxDB request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let err = classify_response(status, &text);
        tracing::debug!(status = status.as_u16(), error = %err, "InfluxDB write refused");
        Err(err)
    }
}
