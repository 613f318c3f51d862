//! The LLM provider seam.
//!
//! The router, decomposer, and oracle accept an optional
//! `Arc<dyn LanguageModel>`; when the provider is absent or misbehaves
//! they degrade silently to their heuristic paths. Every call carries a
//! deadline.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::json;

/// Capability for answering a single prompt.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Answer `prompt` within `deadline`.
    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String>;
}

/// HTTP provider speaking the common `chat/completions` shape.
pub struct HttpLanguageModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpLanguageModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, prompt: &str, deadline: Duration) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM returned {status}: {text}"));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("LLM response was not JSON")?;
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("LLM response missing choices[0].message.content"))?;

        Ok(content.to_owned())
    }
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence.
    let rest = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_handles_tagged_fences() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\": 1}");
    }

    #[test]
    fn strip_code_fence_leaves_plain_text() {
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
