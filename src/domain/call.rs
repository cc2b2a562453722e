//! Call-domain data carried through the pipeline.
//!
//! These are plain data shapes: what the catalog reports, what the warehouse
//! returns, and what the downstream stages produce from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transcript reference as reported by the catalog poll.
///
/// This is the opaque payload a work item carries until the enrich stage
/// resolves it into a full [`CallRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRef {
    /// Stable transcript identifier (unique across polls)
    pub transcript_id: String,

    /// Call identifier, when the catalog reports one
    #[serde(default)]
    pub call_id: Option<String>,

    /// Account name hint, when the catalog reports one
    #[serde(default)]
    pub account_name: Option<String>,

    /// When the call was recorded, per the catalog
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl TranscriptRef {
    /// Reference with only the identifier set (enough to run the pipeline).
    pub fn bare(transcript_id: impl Into<String>) -> Self {
        Self {
            transcript_id: transcript_id.into(),
            call_id: None,
            account_name: None,
            recorded_at: None,
        }
    }
}

/// The warehouse row for one transcript.
///
/// Every field is required downstream; the enrich stage rejects rows with
/// empty columns before they enter the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub transcript_id: String,
    pub account_name: String,
    pub account_number: String,
    pub speaker_name: String,
    pub speaker_email: String,
    pub cs_email: String,
    pub am_email: String,
    pub transcript_text: String,
}

impl CallRecord {
    /// Names of columns that must be non-empty, in warehouse column order.
    pub const REQUIRED_COLUMNS: [&'static str; 8] = [
        "transcript_id",
        "account_name",
        "account_number",
        "speaker_name",
        "speaker_email",
        "cs_email",
        "am_email",
        "transcript_text",
    ];

    /// Returns the first required column that is empty, if any.
    pub fn first_empty_column(&self) -> Option<&'static str> {
        let values = [
            self.transcript_id.as_str(),
            self.account_name.as_str(),
            self.account_number.as_str(),
            self.speaker_name.as_str(),
            self.speaker_email.as_str(),
            self.cs_email.as_str(),
            self.am_email.as_str(),
            self.transcript_text.as_str(),
        ];

        values
            .iter()
            .zip(Self::REQUIRED_COLUMNS.iter())
            .find(|(value, _)| value.trim().is_empty())
            .map(|(_, name)| *name)
    }
}

/// A generated call summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    /// Summary text as returned by the summarization service
    pub text: String,

    /// Model that produced the summary, when reported
    #[serde(default)]
    pub model: Option<String>,

    /// When the summary was generated
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(text: impl Into<String>, model: Option<String>) -> Self {
        Self {
            text: text.into(),
            model,
            generated_at: Utc::now(),
        }
    }
}

/// Shareable links to the two published documents for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocLinks {
    /// The "current summary" document (content replaced per call)
    pub current_url: String,

    /// The running history document (one entry appended per transcript)
    pub history_url: String,
}

/// Delivery receipt for the two notification messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Message id for the CS notification
    pub cs_message_id: String,

    /// Message id for the AM notification
    pub am_message_id: String,
}
