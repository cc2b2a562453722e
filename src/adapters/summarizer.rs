//! Summarization client: turns a call record into summary text.
//!
//! Chat-completions style API. The prompt is fixed: account context plus
//! the transcript, asking for the four sections the account teams expect.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{classify_status, classify_transport, Summarizer};
use crate::domain::{CallRecord, StageError, StageResult, Summary};

const SYSTEM_PROMPT: &str =
    "You summarize customer call transcripts for the account team. Be factual and concise.";

pub struct SummarizerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// The fixed user prompt: account context, transcript, requested sections.
fn build_prompt(record: &CallRecord) -> String {
    format!(
        "Please analyze this call transcript and provide a comprehensive summary.\n\
         \n\
         Account Information:\n\
         - Account Name: {}\n\
         - Account Number: {}\n\
         - Speaker: {} ({})\n\
         \n\
         Transcript:\n\
         {}\n\
         \n\
         Please provide a detailed summary including:\n\
         1. Key discussion points\n\
         2. Action items\n\
         3. Customer concerns or requests\n\
         4. Next steps",
        record.account_name,
        record.account_number,
        record.speaker_name,
        record.speaker_email,
        record.transcript_text,
    )
}

impl SummarizerClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build summarizer HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Summarizer for SummarizerClient {
    async fn summarize(&self, record: &CallRecord) -> StageResult<Summary> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(record) },
            ],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("summarizer", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("summarizer", status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| classify_transport("summarizer", e))?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            StageError::permanent(anyhow!("summarizer returned no choices"))
        })?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(StageError::permanent(anyhow!(
                "summarizer rejected transcript {} for content policy",
                record.transcript_id
            )));
        }

        let text = choice.message.content.unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(StageError::permanent(anyhow!(
                "summarizer returned an empty completion for transcript {}",
                record.transcript_id
            )));
        }

        debug!(
            transcript_id = %record.transcript_id,
            chars = text.len(),
            "summary generated"
        );

        Ok(Summary::new(text, parsed.model))
    }
}
