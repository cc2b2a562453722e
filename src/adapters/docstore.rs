//! Document store client: publishes the per-account document pair.
//!
//! Each account keeps two documents. The "current summary" document is
//! replaced wholesale on every call; the history document gains one entry
//! per transcript. Both writes are PUTs keyed by account (and transcript id
//! for history), so re-running a transcript rewrites the same state instead
//! of duplicating it.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{classify_status, classify_transport, DocStore};
use crate::domain::{CallRecord, DocLinks, StageResult, Summary};

pub struct DocStoreClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    url: String,
}

/// History entry body, one per transcript, in the shape the running log
/// has always used.
fn history_entry(summary: &Summary) -> String {
    let stamp = summary.generated_at.format("%Y-%m-%d %H:%M");
    format!("--- {} ---\n{}\n", stamp, summary.text)
}

impl DocStoreClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build document store HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    async fn put_document(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> StageResult<DocumentResponse> {
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("document store", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("document store", status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| classify_transport("document store", e))
    }
}

#[async_trait]
impl DocStore for DocStoreClient {
    async fn publish(&self, record: &CallRecord, summary: &Summary) -> StageResult<DocLinks> {
        let account = &record.account_number;

        // Current summary: content replaced on every call for the account.
        let current_url = format!(
            "{}/accounts/{}/documents/current-summary",
            self.base_url, account
        );
        let current = self
            .put_document(
                current_url,
                json!({
                    "title": format!("Call Summary - {}", record.account_name),
                    "transcript_id": record.transcript_id,
                    "content": summary.text,
                    "updated_at": summary.generated_at,
                }),
            )
            .await?;

        // History: one entry per transcript, keyed by transcript id so a
        // re-run replaces its own entry.
        let history_url = format!(
            "{}/accounts/{}/documents/history/entries/{}",
            self.base_url, account, record.transcript_id
        );
        let history = self
            .put_document(
                history_url,
                json!({
                    "generated_at": summary.generated_at,
                    "content": history_entry(summary),
                }),
            )
            .await?;

        debug!(
            transcript_id = %record.transcript_id,
            account = %account,
            "documents published"
        );

        Ok(DocLinks {
            current_url: current.url,
            history_url: history.url,
        })
    }
}
