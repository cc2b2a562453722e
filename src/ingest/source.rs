//! Catalog polling: where new transcripts are discovered.
//!
//! The catalog is an external HTTP API listing finished call transcripts.
//! Polling is windowed `[now - lookback, now]`; consecutive windows
//! overlap, and the seen-set downstream absorbs the duplicates.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::TranscriptRef;

/// Errors from a catalog poll.
///
/// Every variant is treated the same way by the poller: log, skip this
/// tick, try again next tick. The catalog being down must never stop the
/// pipeline for items already queued.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Anything that can report transcripts for a time window.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Lists transcripts recorded within `[from, to]`.
    ///
    /// May return the same id across calls; deduplication is not this
    /// trait's job.
    async fn poll(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TranscriptRef>, SourceError>;
}

/// HTTP client for the call catalog API.
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Response from the catalog list endpoint
#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    transcripts: Vec<CatalogEntry>,
}

/// One transcript as the catalog reports it
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    transcript_id: String,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    account_name: Option<String>,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
}

impl From<CatalogEntry> for TranscriptRef {
    fn from(entry: CatalogEntry) -> Self {
        TranscriptRef {
            transcript_id: entry.transcript_id,
            call_id: entry.call_id,
            account_name: entry.account_name,
            recorded_at: entry.recorded_at,
        }
    }
}

impl CatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self {
            client,
            base_url: trim_trailing_slash(base_url.into()),
            api_key: api_key.into(),
        })
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[async_trait]
impl TranscriptSource for CatalogClient {
    async fn poll(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TranscriptRef>, SourceError> {
        let url = format!("{}/v2/calls/transcripts", self.base_url);
        let from_param = from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let to_param = to.to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("fromDateTime", &from_param), ("toDateTime", &to_param)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let parsed: CatalogResponse = response.json().await?;
        debug!(
            from = %from_param,
            to = %to_param,
            count = parsed.transcripts.len(),
            "catalog poll returned"
        );

        Ok(parsed.transcripts.into_iter().map(Into::into).collect())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_entries_decode_with_optional_fields_missing() {
        let body = r#"{
            "transcripts": [
                {"transcriptId": "T1", "callId": "C1", "accountName": "Acme"},
                {"transcriptId": "T2"}
            ]
        }"#;
        let parsed: CatalogResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.transcripts.len(), 2);

        let refs: Vec<TranscriptRef> =
            parsed.transcripts.into_iter().map(Into::into).collect();
        assert_eq!(refs[0].transcript_id, "T1");
        assert_eq!(refs[0].account_name.as_deref(), Some("Acme"));
        assert_eq!(refs[1].transcript_id, "T2");
        assert!(refs[1].call_id.is_none());
    }

    #[test]
    fn empty_catalog_body_decodes_to_no_transcripts() {
        let parsed: CatalogResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.transcripts.is_empty());
    }

    #[test]
    fn base_url_loses_trailing_slashes() {
        assert_eq!(
            trim_trailing_slash("https://api.example.test//".into()),
            "https://api.example.test"
        );
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(500);
        let cut = truncate(&body, 200);
        assert_eq!(cut.len(), 203);
        assert!(cut.ends_with("..."));
    }
}
