use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::EmailDraft;

/// Produces message bodies for the warm-up traffic. Stateless from the
/// orchestrator's perspective; a failure is fatal for the current send
/// step.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short introductory message, varied each call.
    async fn outbound(
        &self,
        sender_name: &str,
        recipient_name: &str,
        sender_address: &str,
    ) -> Result<EmailDraft>;

    /// Short reply to a previously generated message; the subject carries
    /// a "Re: " prefix.
    async fn reply(
        &self,
        replier_name: &str,
        original_sender_name: &str,
        original_subject: &str,
        original_body: &str,
    ) -> Result<EmailDraft>;
}

const SYSTEM_PROMPT: &str = "You write short, natural-sounding business emails between colleagues. \
Respond with STRICT JSON only, no markdown, of the shape {\"subject\": \"...\", \"body\": \"...\"}. \
Keep the body under 80 words, friendly and unremarkable.";

/// OpenAI-compatible chat-completions client.
pub struct LlmTextGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl LlmTextGenerator {
    pub fn new(
        api_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build text generator http client")?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/chat/completions",
                api_url.trim_end_matches('/')
            ),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn complete(&self, prompt: String) -> Result<EmailDraft> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT.to_string() },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: 0.9,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("text generator request failed")?
            .error_for_status()
            .context("text generator returned an error status")?;

        let payload: ChatResponse = response
            .json()
            .await
            .context("text generator response is not valid JSON")?;

        let content = payload
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .context("text generator returned no choices")?;

        debug!("text generator draft received: bytes={}", content.len());
        parse_draft(content)
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn outbound(
        &self,
        sender_name: &str,
        recipient_name: &str,
        sender_address: &str,
    ) -> Result<EmailDraft> {
        let prompt = format!(
            "Write a short introductory email from {sender_name} ({sender_address}) \
             to {recipient_name}. Pick a fresh everyday topic so repeated calls differ."
        );
        self.complete(prompt).await
    }

    async fn reply(
        &self,
        replier_name: &str,
        original_sender_name: &str,
        original_subject: &str,
        original_body: &str,
    ) -> Result<EmailDraft> {
        let prompt = format!(
            "Write a brief, positive reply from {replier_name} to this email from \
             {original_sender_name}.\nSubject: {original_subject}\n\n{original_body}"
        );
        let draft = self.complete(prompt).await?;
        Ok(ensure_reply_subject(draft, original_subject))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawDraft {
    subject: String,
    body: String,
}

/// Parses the strict-JSON draft contract, tolerating a markdown fence
/// around the payload. Empty or non-conforming responses are errors.
fn parse_draft(content: &str) -> Result<EmailDraft> {
    let trimmed = strip_code_fence(content.trim());

    let raw: RawDraft = serde_json::from_str(trimmed).with_context(|| {
        format!("text generator response is not the expected JSON shape: {trimmed}")
    })?;

    let subject = raw.subject.trim().to_string();
    let body = raw.body.trim().to_string();
    if subject.is_empty() || body.is_empty() {
        bail!("text generator returned an empty subject or body");
    }

    Ok(EmailDraft { subject, body })
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn ensure_reply_subject(draft: EmailDraft, original_subject: &str) -> EmailDraft {
    if draft.subject.starts_with("Re:") {
        return draft;
    }
    let base = original_subject.strip_prefix("Re: ").unwrap_or(original_subject);
    EmailDraft {
        subject: format!("Re: {base}"),
        body: draft.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_json_draft() {
        let draft =
            parse_draft(r#"{"subject": "Quick hello", "body": "Hi there"}"#)
                .unwrap();
        assert_eq!(draft.subject, "Quick hello");
        assert_eq!(draft.body, "Hi there");
    }

    #[test]
    fn tolerates_markdown_fence() {
        let draft = parse_draft(
            "```json\n{\"subject\": \"Hello\", \"body\": \"Text\"}\n```",
        )
        .unwrap();
        assert_eq!(draft.subject, "Hello");
    }

    #[test]
    fn empty_fields_are_non_conforming() {
        assert!(parse_draft(r#"{"subject": "  ", "body": "x"}"#).is_err());
        assert!(parse_draft(r#"{"subject": "x", "body": ""}"#).is_err());
        assert!(parse_draft("not json at all").is_err());
    }

    #[test]
    fn reply_subject_gets_re_prefix_once() {
        let fixed = ensure_reply_subject(
            EmailDraft { subject: "Hello".into(), body: "b".into() },
            "Quick hello",
        );
        assert_eq!(fixed.subject, "Re: Quick hello");

        let kept = ensure_reply_subject(
            EmailDraft { subject: "Re: Quick hello".into(), body: "b".into() },
            "Quick hello",
        );
        assert_eq!(kept.subject, "Re: Quick hello");

        let unstacked = ensure_reply_subject(
            EmailDraft { subject: "Sure".into(), body: "b".into() },
            "Re: Quick hello",
        );
        assert_eq!(unstacked.subject, "Re: Quick hello");
    }
}
