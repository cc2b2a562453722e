//! Mail relay client: delivers the CS and AM notification messages.
//!
//! Two HTML messages per completed call, one to the customer-success
//! contact and one to the account manager. Each send carries an
//! idempotency key derived from the transcript id, so the relay can
//! suppress duplicates if a transcript is ever re-run.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{classify_status, classify_transport, idempotency_key, Mailer};
use crate::domain::{CallRecord, DispatchReceipt, DocLinks, StageError, StageResult, Summary};

pub struct MailerClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    from: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message_id: String,
}

/// Checks the shape of a recipient address before anything is sent.
///
/// A malformed address can never be delivered, so it is a permanent
/// failure, and it is raised before the first send so the pair of messages
/// is not half-delivered over an address we already know is broken.
fn validate_recipient(label: &str, addr: &str) -> StageResult<()> {
    let well_formed = match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !addr.contains(char::is_whitespace)
        }
        None => false,
    };

    if well_formed {
        Ok(())
    } else {
        Err(StageError::permanent(anyhow!(
            "malformed {label} recipient address: {addr:?}"
        )))
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn render_cs_html(record: &CallRecord, summary: &Summary, docs: &DocLinks) -> String {
    format!(
        "<html><body>\
         <h2>Call Summary - {account}</h2>\
         <p>A new call with {speaker} has been summarized.</p>\
         <pre style=\"white-space: pre-wrap\">{summary}</pre>\
         <p><a href=\"{current}\">Current summary</a> · \
         <a href=\"{history}\">Summary history</a></p>\
         </body></html>",
        account = escape_html(&record.account_name),
        speaker = escape_html(&record.speaker_name),
        summary = escape_html(&summary.text),
        current = escape_html(&docs.current_url),
        history = escape_html(&docs.history_url),
    )
}

fn render_am_html(record: &CallRecord, summary: &Summary, docs: &DocLinks) -> String {
    format!(
        "<html><body>\
         <h2>Account Update - {account} ({number})</h2>\
         <p>Call with {speaker} ({email}).</p>\
         <pre style=\"white-space: pre-wrap\">{summary}</pre>\
         <p><a href=\"{current}\">Current summary</a> · \
         <a href=\"{history}\">Summary history</a></p>\
         </body></html>",
        account = escape_html(&record.account_name),
        number = escape_html(&record.account_number),
        speaker = escape_html(&record.speaker_name),
        email = escape_html(&record.speaker_email),
        summary = escape_html(&summary.text),
        current = escape_html(&docs.current_url),
        history = escape_html(&docs.history_url),
    )
}

impl MailerClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        from: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build mail relay HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            from: from.into(),
        })
    }

    async fn send(
        &self,
        to: &str,
        subject: String,
        html: String,
        dedup_key: String,
    ) -> StageResult<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "html": html,
            "idempotency_key": dedup_key,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("mail relay", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("mail relay", status, &body));
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| classify_transport("mail relay", e))?;

        Ok(parsed.message_id)
    }
}

#[async_trait]
impl Mailer for MailerClient {
    async fn dispatch(
        &self,
        record: &CallRecord,
        summary: &Summary,
        docs: &DocLinks,
    ) -> StageResult<DispatchReceipt> {
        // Both addresses are checked before either message goes out.
        validate_recipient("CS", &record.cs_email)?;
        validate_recipient("AM", &record.am_email)?;

        let cs_message_id = self
            .send(
                &record.cs_email,
                format!("Call Summary - {}", record.account_name),
                render_cs_html(record, summary, docs),
                idempotency_key("cs", &record.transcript_id),
            )
            .await?;

        let am_message_id = self
            .send(
                &record.am_email,
                format!("AM Call Summary - {}", record.account_name),
                render_am_html(record, summary, docs),
                idempotency_key("am", &record.transcript_id),
            )
            .await?;

        debug!(
            transcript_id = %record.transcript_id,
            cs = %record.cs_email,
            am = %record.am_email,
            "notifications dispatched"
        );

        Ok(DispatchReceipt {
            cs_message_id,
            am_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> CallRecord {
        CallRecord {
            transcript_id: "T1".into(),
            account_name: "Acme & Sons".into(),
            account_number: "ACCT-1".into(),
            speaker_name: "Dana".into(),
            speaker_email: "dana@acme.test".into(),
            cs_email: "cs@vendor.test".into(),
            am_email: "am@vendor.test".into(),
            transcript_text: "hello".into(),
        }
    }

    fn docs() -> DocLinks {
        DocLinks {
            current_url: "https://docs.test/current".into(),
            history_url: "https://docs.test/history".into(),
        }
    }

    #[test]
    fn well_formed_addresses_pass_validation() {
        assert!(validate_recipient("CS", "cs@vendor.test").is_ok());
    }

    #[test]
    fn malformed_addresses_fail_permanently() {
        for bad in ["", "no-at-sign", "@domain", "local@", "a b@c.d"] {
            let err = validate_recipient("CS", bad).unwrap_err();
            assert!(!err.is_transient(), "{bad:?} should be permanent");
        }
    }

    #[test]
    fn html_bodies_escape_summary_and_account_text() {
        let summary = Summary {
            text: "use <b>caution</b> & review".into(),
            model: None,
            generated_at: Utc::now(),
        };
        let html = render_cs_html(&record(), &summary, &docs());
        assert!(html.contains("Acme &amp; Sons"));
        assert!(html.contains("use &lt;b&gt;caution&lt;/b&gt; &amp; review"));
        assert!(html.contains("https://docs.test/current"));
    }

    #[test]
    fn am_body_includes_speaker_contact() {
        let summary = Summary {
            text: "s".into(),
            model: None,
            generated_at: Utc::now(),
        };
        let html = render_am_html(&record(), &summary, &docs());
        assert!(html.contains("dana@acme.test"));
        assert!(html.contains("ACCT-1"));
    }
}
