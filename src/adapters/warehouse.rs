//! Warehouse client: resolves a transcript id into its full call record.
//!
//! Talks to the warehouse's SQL-over-HTTP gateway. One statement, bound by
//! position, expected to yield at most one row of eight text columns.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{classify_status, classify_transport, Warehouse};
use crate::domain::{CallRecord, StageError, StageResult};

/// Join across transcripts, calls and accounts; one row per transcript id.
const LOOKUP_SQL: &str = "\
SELECT t.transcript_id, a.account_name, a.account_number, \
c.speaker_name, c.speaker_email, a.cs_email, a.am_email, t.transcript_text \
FROM transcripts t \
JOIN calls c ON t.call_id = c.call_id \
JOIN accounts a ON c.account_id = a.account_id \
WHERE t.transcript_id = ?";

pub struct WarehouseClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

/// Response from the statement endpoint: rows as arrays of nullable text,
/// in the column order of the statement.
#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

impl WarehouseClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build warehouse HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }
}

/// Maps one result row into a [`CallRecord`]. Null cells become empty
/// strings; the enrich stage rejects those with the column name.
fn record_from_row(row: Vec<Option<String>>) -> StageResult<CallRecord> {
    if row.len() != CallRecord::REQUIRED_COLUMNS.len() {
        return Err(StageError::permanent(anyhow!(
            "warehouse row has {} columns, expected {}",
            row.len(),
            CallRecord::REQUIRED_COLUMNS.len()
        )));
    }

    let mut cells = row.into_iter().map(|cell| cell.unwrap_or_default());
    // Order matches LOOKUP_SQL's select list.
    Ok(CallRecord {
        transcript_id: cells.next().unwrap_or_default(),
        account_name: cells.next().unwrap_or_default(),
        account_number: cells.next().unwrap_or_default(),
        speaker_name: cells.next().unwrap_or_default(),
        speaker_email: cells.next().unwrap_or_default(),
        cs_email: cells.next().unwrap_or_default(),
        am_email: cells.next().unwrap_or_default(),
        transcript_text: cells.next().unwrap_or_default(),
    })
}

#[async_trait]
impl Warehouse for WarehouseClient {
    async fn lookup(&self, transcript_id: &str) -> StageResult<CallRecord> {
        let url = format!("{}/api/v2/statements", self.base_url);
        let body = json!({
            "statement": LOOKUP_SQL,
            "bindings": {
                "1": { "type": "TEXT", "value": transcript_id }
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("warehouse", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("warehouse", status, &body));
        }

        let parsed: StatementResponse = response
            .json()
            .await
            .map_err(|e| classify_transport("warehouse", e))?;

        debug!(transcript_id, rows = parsed.data.len(), "warehouse lookup returned");

        let row = parsed.data.into_iter().next().ok_or_else(|| {
            StageError::permanent(anyhow!("no warehouse row for transcript {transcript_id}"))
        })?;

        record_from_row(row)
    }
}
