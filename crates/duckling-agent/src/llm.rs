//! Concrete `LlmUtility` (C8): calls an OpenAI-compatible chat completions
//! endpoint for the five short-text generation capabilities. Every method
//! falls back to `duckling_core::llm`'s deterministic helpers on any
//! request failure, non-success status, or empty completion — the pipeline
//! must never block on this for bookkeeping text.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use duckling_core::llm::{fallback_commit_message, fallback_summary, slugify, LlmUtility};
use duckling_core::retry::{retry_async, RetryConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct OpenaiLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenaiLlm {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS)).build().unwrap_or_default(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Bounded-retry (C3) chat completion call; falls back to `None` once
    /// every attempt has been exhausted, leaving the fallback decision to
    /// the caller's deterministic helper.
    async fn complete(&self, system: &str, user: &str) -> Option<String> {
        if self.api_key.is_empty() {
            return None;
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user.to_string() },
            ],
        };
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let retry_cfg = RetryConfig::default();

        let result = retry_async(&retry_cfg, "llm:complete", || async {
            let response = self.client.post(&url).bearer_auth(&self.api_key).json(&request).send().await.context("llm utility request failed")?;
            if !response.status().is_success() {
                bail!("llm utility returned non-success status: {}", response.status());
            }
            let parsed: ChatResponse = response.json().await.context("llm utility response did not parse")?;
            Ok(parsed)
        })
        .await;

        match result {
            Ok(parsed) => parsed.choices.into_iter().next().map(|c| c.message.content.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                warn!("llm utility request failed after retries: {e}");
                None
            }
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
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

#[async_trait]
impl LlmUtility for OpenaiLlm {
    async fn generate_branch_slug(&self, description: &str) -> String {
        let system = "Reply with a short git branch slug (lowercase, words separated by hyphens, no prefix) summarizing the task. Nothing else.";
        match self.complete(system, description).await {
            Some(text) => slugify(&text),
            None => String::new(),
        }
    }

    async fn generate_pr_title(&self, description: &str) -> String {
        let system = "Reply with a single-line pull request title summarizing the task. Nothing else.";
        self.complete(system, description).await.unwrap_or_else(|| fallback_summary(description))
    }

    async fn generate_pr_body(&self, description: &str, branch_name: &str) -> String {
        let system = "Reply with a short pull request description (a few sentences) summarizing the task and noting the branch it was implemented on. Nothing else.";
        let user = format!("Branch: {branch_name}\n\n{description}");
        self.complete(system, &user).await.unwrap_or_else(|| description.to_string())
    }

    async fn generate_task_summary(&self, description: &str) -> String {
        let system = "Reply with a short one-line summary of this task. Nothing else.";
        self.complete(system, description).await.unwrap_or_else(|| fallback_summary(description))
    }

    async fn generate_commit_message(&self, description: &str, changed_files: &[String]) -> String {
        let system = "Reply with a single-line git commit message (imperative mood) summarizing the task and the changed files. Nothing else.";
        let user = format!("{description}\n\nChanged files:\n{}", changed_files.join("\n"));
        self.complete(system, &user).await.unwrap_or_else(|| fallback_commit_message(description, changed_files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_falls_back_without_a_network_call() {
        let llm = OpenaiLlm::new("", "gpt-4o-mini");
        assert_eq!(llm.generate_branch_slug("fix the login bug").await, "");
        assert_eq!(llm.generate_pr_title("fix the login bug").await, fallback_summary("fix the login bug"));
        assert_eq!(llm.generate_task_summary("fix the login bug").await, fallback_summary("fix the login bug"));
    }
}
