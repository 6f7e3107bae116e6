//! Single-shot client for the reporting API.

use std::collections::BTreeMap;
use std::fmt;

use recon_core::{FieldConverter, Record, ReportDescriptor};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
};

#[derive(Clone)]
pub struct ReportingCredentials {
    pub host: String,
    pub user: String,
    pub token: String,
}

impl fmt::Debug for ReportingCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingCredentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error(transparent)]
    Client(#[from] anyhow::Error),
    #[error("unparseable reporting response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// Decoded response body, with field names already back in caller vocabulary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportEnvelope {
    pub headers: Vec<String>,
    #[serde(default)]
    pub pretty_headers: BTreeMap<String, String>,
    pub data: Vec<Vec<JsonValue>>,
}

impl ReportEnvelope {
    pub fn into_records(self) -> Vec<Record> {
        let headers = self.headers;
        self.data
            .into_iter()
            .map(|row| headers.iter().cloned().zip(row).collect::<Record>())
            .collect()
    }
}

/// Decodes a 2xx body. `Ok(None)` means the body carried no `headers` key.
pub fn parse_envelope(body: &[u8], publisher: &str) -> Result<Option<ReportEnvelope>, String> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?;
    let has_headers = value
        .as_object()
        .map(|obj| obj.contains_key("headers"))
        .unwrap_or(false);
    if !has_headers {
        return Ok(None);
    }

    let envelope: ReportEnvelope =
        serde_json::from_value(value).map_err(|e| format!("unexpected envelope shape: {e}"))?;

    let width = envelope.headers.len();
    if let Some((idx, row)) = envelope
        .data
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != width)
    {
        return Err(format!(
            "row {idx} has {} values for {width} headers",
            row.len()
        ));
    }

    let headers = envelope
        .headers
        .iter()
        .map(|h| FieldConverter::to_caller_vocabulary(h, publisher))
        .collect();
    let pretty_headers = envelope
        .pretty_headers
        .into_iter()
        .map(|(k, v)| (FieldConverter::to_caller_vocabulary(&k, publisher), v))
        .collect();

    Ok(Some(ReportEnvelope {
        headers,
        pretty_headers,
        data: envelope.data,
    }))
}

#[derive(Debug, Clone)]
pub struct ReportingClient {
    client: reqwest::Client,
    credentials: ReportingCredentials,
    backoff: BackoffPolicy,
}

impl ReportingClient {
    pub fn new(
        credentials: ReportingCredentials,
        config: HttpClientConfig,
    ) -> Result<Self, ReportingError> {
        let client = config.build_client()?;
        Ok(Self {
            client,
            credentials,
            backoff: config.backoff,
        })
    }

    pub fn report_url(&self, report: &ReportDescriptor) -> String {
        format!(
            "{}/api/reporting/{}/{}",
            self.credentials.host.trim_end_matches('/'),
            report.site_id(),
            report.publisher()
        )
    }

    /// Fetches one report. Transport failures and non-2xx answers are logged
    /// and returned as `Ok(None)`; only an unparseable 2xx body is an error.
    pub async fn fetch_records(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Option<Vec<Record>>, ReportingError> {
        let envelope = self.fetch_envelope(report).await?;
        Ok(envelope.map(ReportEnvelope::into_records))
    }

    pub async fn fetch_envelope(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Option<ReportEnvelope>, ReportingError> {
        let span = info_span!(
            "reporting_fetch",
            site_id = report.site_id(),
            publisher = report.publisher(),
            window = %report.window()
        );
        self.fetch_envelope_inner(report).instrument(span).await
    }

    async fn fetch_envelope_inner(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Option<ReportEnvelope>, ReportingError> {
        let url = self.report_url(report);
        debug!(%url, request = %report, "making reporting request");

        let mut attempt = 0usize;
        let response = loop {
            let sent = self
                .client
                .post(&url)
                .basic_auth(&self.credentials.user, Some(&self.credentials.token))
                .json(&report.body())
                .send()
                .await;

            match sent {
                Ok(resp) if resp.status().is_success() => break resp,
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying reporting request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    log_rejected(status, &text, &url, report);
                    return Ok(None);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying reporting request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    error!(error = %err, %url, request = %report, "reporting request failed");
                    return Ok(None);
                }
            }
        };

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, %url, "reading reporting response body failed");
                return Ok(None);
            }
        };

        match parse_envelope(&body, report.publisher()) {
            Ok(Some(envelope)) => {
                debug!(rows = envelope.data.len(), "parsed reporting response");
                Ok(Some(envelope))
            }
            Ok(None) => {
                info!(%url, request = %report, "reporting response has no headers");
                Ok(None)
            }
            Err(reason) => {
                let preview: String = String::from_utf8_lossy(&body).chars().take(3000).collect();
                error!(%url, %reason, body = %preview, "failed to parse reporting response");
                Err(ReportingError::Parse { url, reason })
            }
        }
    }
}

fn log_rejected(status: StatusCode, text: &str, url: &str, report: &ReportDescriptor) {
    let reason = format!("{} {}", status.canonical_reason().unwrap_or(""), text);
    if status == StatusCode::BAD_REQUEST {
        info!(
            status = status.as_u16(),
            %reason,
            %url,
            request = %report,
            "reporting request rejected"
        );
    } else {
        error!(
            status = status.as_u16(),
            %reason,
            %url,
            request = %report,
            "reporting request rejected"
        );
    }
}
