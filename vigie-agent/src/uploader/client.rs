//! Collector API client
//!
//! One authenticated POST per batch. The HTTP exchange is reduced to an
//! [`UploadOutcome`] tag so the retry/backoff decision never depends on error
//! types.

use crate::queue::QueueEntry;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One element of the request array (matches the ingest contract)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord<'a> {
    pub source: &'a str,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub entry_type: &'a str,
    pub payload: &'a serde_json::Value,
}

impl<'a> UploadRecord<'a> {
    pub fn from_entry(source: &'a str, entry: &'a QueueEntry) -> Self {
        Self {
            source,
            timestamp: entry.timestamp,
            entry_type: &entry.entry_type,
            payload: &entry.payload,
        }
    }
}

/// Per-item acknowledgement, positionally aligned with the request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ItemResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    results: Vec<ItemResult>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(rename = "msBeforeNext")]
    ms_before_next: Option<u64>,
}

/// What one upload attempt amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// 2xx with a parseable `results` array
    Delivered(Vec<ItemResult>),
    /// Connection failure, timeout, 5xx
    Transient(String),
    /// 429 with an explicit wait hint
    RateLimited(Duration),
    /// Any other status, or a body we cannot interpret
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl IngestClient {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vigie-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            url: url.to_string(),
            token: token.to_string(),
        })
    }

    pub async fn send(&self, records: &[UploadRecord<'_>]) -> UploadOutcome {
        debug!("POST {} ({} records)", self.url, records.len());

        let response = match self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(records)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return UploadOutcome::Transient(e.to_string()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return UploadOutcome::Transient(format!("reading response body: {e}")),
        };

        classify(status, &body)
    }
}

/// Maps a status + body to an outcome
pub fn classify(status: StatusCode, body: &str) -> UploadOutcome {
    if status.is_success() {
        return match serde_json::from_str::<UploadResponse>(body) {
            Ok(parsed) => UploadOutcome::Delivered(parsed.results),
            Err(_) => UploadOutcome::Rejected {
                status: status.as_u16(),
                body: body.to_string(),
            },
        };
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Ok(RateLimitBody {
            ms_before_next: Some(ms),
        }) = serde_json::from_str(body)
        {
            return UploadOutcome::RateLimited(Duration::from_millis(ms));
        }
    }

    if status.is_server_error() {
        return UploadOutcome::Transient(format!("HTTP {status}"));
    }

    UploadOutcome::Rejected {
        status: status.as_u16(),
        body: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntryStatus;
    use serde_json::json;
    use vigie_devkit::{contract_helpers, MockIngestApi};

    fn entry(id: i64) -> QueueEntry {
        QueueEntry {
            id,
            entry_type: "ping".to_string(),
            payload: json!({"n": id}),
            timestamp: 1_700_000_000_000 + id,
            status: EntryStatus::Pending,
            failure_reason: None,
        }
    }

    #[test]
    fn test_classify_success() {
        let outcome = classify(
            StatusCode::OK,
            r#"{"results":[{"success":true},{"success":false,"message":"bad payload"}]}"#,
        );
        assert_eq!(
            outcome,
            UploadOutcome::Delivered(vec![
                ItemResult { success: true, message: None },
                ItemResult { success: false, message: Some("bad payload".to_string()) },
            ])
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, r#"{"msBeforeNext":1500}"#),
            UploadOutcome::RateLimited(Duration::from_millis(1500))
        );
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, r#"{"error":"slow down"}"#),
            UploadOutcome::Rejected { status: 429, .. }
        ));
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, ""),
            UploadOutcome::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, "no"),
            UploadOutcome::Rejected { status: 401, .. }
        ));
        assert!(matches!(
            classify(StatusCode::OK, "not json"),
            UploadOutcome::Rejected { status: 200, .. }
        ));
    }

    #[tokio::test]
    async fn test_send_request_shape() {
        let api = MockIngestApi::start().await;
        api.accept_all().await;

        let client = IngestClient::new(&api.url(), &api.token(), Duration::from_secs(5)).unwrap();
        let entries = vec![entry(1), entry(2)];
        let records: Vec<_> = entries
            .iter()
            .map(|e| UploadRecord::from_entry("a1:b2:c3:d4:e5:f6", e))
            .collect();

        let outcome = client.send(&records).await;
        assert_eq!(
            outcome,
            UploadOutcome::Delivered(vec![
                ItemResult { success: true, message: None },
                ItemResult { success: true, message: None },
            ])
        );

        let batches = api.received_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        for (record, entry) in batches[0].iter().zip(&entries) {
            contract_helpers::assert_upload_record(record).unwrap();
            assert_eq!(record["source"], "a1:b2:c3:d4:e5:f6");
            assert_eq!(record["timestamp"], entry.timestamp);
            assert_eq!(record["type"], "ping");
            assert_eq!(record["payload"], entry.payload);
        }
        assert!(api.all_requests_authorized().await);
    }

    #[tokio::test]
    async fn test_send_connection_refused_is_transient() {
        // port 9 (discard) is not listening in test environments
        let client =
            IngestClient::new("http://127.0.0.1:9/api/ingest", "t", Duration::from_secs(2)).unwrap();
        let entries = vec![entry(1)];
        let records: Vec<_> = entries.iter().map(|e| UploadRecord::from_entry("s", e)).collect();

        assert!(matches!(client.send(&records).await, UploadOutcome::Transient(_)));
    }
}
