//! Adapter interfaces for external systems.
//!
//! Each downstream collaborator sits behind a small trait so the stages can
//! be driven against scripted fakes in tests. The real implementations are
//! thin HTTP clients; failure classification into transient/permanent
//! happens here, at the boundary, so the retry executor never has to guess.

pub mod docstore;
pub mod mailer;
pub mod summarizer;
pub mod warehouse;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use crate::domain::{CallRecord, DispatchReceipt, DocLinks, StageError, StageResult, Summary};

// Re-export the HTTP clients
pub use docstore::DocStoreClient;
pub use mailer::MailerClient;
pub use summarizer::SummarizerClient;
pub use warehouse::WarehouseClient;

/// Resolves a transcript id into the full warehouse record.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn lookup(&self, transcript_id: &str) -> StageResult<CallRecord>;
}

/// Generates a summary for an enriched call record.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, record: &CallRecord) -> StageResult<Summary>;
}

/// Publishes the summary into the per-account document pair.
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn publish(&self, record: &CallRecord, summary: &Summary) -> StageResult<DocLinks>;
}

/// Delivers the CS and AM notification messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn dispatch(
        &self,
        record: &CallRecord,
        summary: &Summary,
        docs: &DocLinks,
    ) -> StageResult<DispatchReceipt>;
}

/// Stable idempotency key for a side effect scoped to one transcript.
///
/// Derived from the channel name and the transcript id, so re-running the
/// same transcript produces the same key and downstream services can
/// suppress the duplicate.
pub fn idempotency_key(channel: &str, transcript_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_bytes());
    hasher.update(b":");
    hasher.update(transcript_id.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Classifies a non-success HTTP status from a collaborator.
///
/// 408, 429 and all 5xx are worth retrying; every other status means the
/// request itself is wrong and a retry would repeat the mistake.
pub(crate) fn classify_status(what: &str, status: StatusCode, body: &str) -> StageError {
    let retryable = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();

    let err = anyhow!("{what} returned {status}: {}", snippet(body));
    if retryable {
        StageError::Transient(err)
    } else {
        StageError::Permanent(err)
    }
}

/// Classifies a reqwest transport error.
///
/// Connection and timeout problems are transient. A decode error means the
/// collaborator answered 2xx with a body that does not match its contract,
/// which retrying will not fix.
pub(crate) fn classify_transport(what: &str, err: reqwest::Error) -> StageError {
    if err.is_decode() {
        StageError::Permanent(anyhow!(err).context(format!("{what}: unexpected response shape")))
    } else {
        StageError::Transient(anyhow!(err).context(format!("{what}: request failed")))
    }
}

fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
