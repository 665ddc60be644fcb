//! LLM backends for summary generation.
//!
//! Two clients behind one trait: the Anthropic Messages API and any
//! OpenAI-compatible chat completions server. Sampling knobs are omitted
//! from request bodies when unset so each backend applies its own defaults
//! (Anthropic additionally rejects `temperature` and `top_p` together).

use crate::config::SummaryConfig;
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Per-call sampling overrides. `None` leaves the backend default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A text generation backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion. `Ok(None)` means the backend returned no
    /// usable text; transport and API errors are `Err`.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Option<String>>;

    /// Short backend description for startup logging.
    fn backend_info(&self) -> String;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ScribeError::Llm(format!("failed to build HTTP client: {e}")))
}

/// Anthropic Messages API client.
pub struct ClaudeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    /// Build a client from the summary config.
    ///
    /// # Errors
    ///
    /// Returns a config error when no API key is available from the config
    /// or the `ANTHROPIC_API_KEY` environment variable.
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let api_key = config.resolve_claude_api_key().ok_or_else(|| {
            ScribeError::Config(
                "claude backend requires an API key (summary.anthropic_api_key or \
                 ANTHROPIC_API_KEY)"
                    .to_owned(),
            )
        })?;
        Ok(Self {
            http: http_client()?,
            base_url: "https://api.anthropic.com".to_owned(),
            api_key,
            model: config.claude_model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Point the client at a different server (mock servers in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Option<String>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_prompt}],
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ScribeError::Llm(format!("Claude request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScribeError::Llm(format!("Claude response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(ScribeError::Llm(format!(
                "Claude API error {status}: {payload}"
            )));
        }

        let text = payload["content"]
            .get(0)
            .filter(|block| block["type"] == "text")
            .and_then(|block| block["text"].as_str())
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        Ok(text)
    }

    fn backend_info(&self) -> String {
        format!("Claude ({})", self.model)
    }
}

/// OpenAI-compatible chat completions client (vLLM and similar servers).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompatClient {
    /// Build a client from the summary config.
    ///
    /// # Errors
    ///
    /// Returns a config error when no model name is configured.
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let model = config
            .vllm_model
            .clone()
            .ok_or_else(|| ScribeError::Config("summary.vllm_model is not set".to_owned()))?;
        Ok(Self {
            http: http_client()?,
            base_url: config.vllm_base_url.trim_end_matches('/').to_owned(),
            api_key: config.vllm_api_key.clone(),
            model,
            max_tokens: config.max_tokens,
        })
    }

    /// Point the client at a different server (mock servers in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Option<String>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ScribeError::Llm(format!("chat completion request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScribeError::Llm(format!("chat completion response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(ScribeError::Llm(format!("API error {status}: {payload}")));
        }

        let text = payload["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .map(|content| extract_markdown_block(content.trim()))
            .filter(|t| !t.is_empty());
        Ok(text)
    }

    fn backend_info(&self) -> String {
        format!("vLLM ({} @ {})", self.model, self.base_url)
    }
}

static THINK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static pattern compiles"));
static MARKDOWN_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```markdown\s*\n(.*?)\n```").expect("static pattern compiles")
});

/// Clean a reasoning-model response: drop `<think>` spans, then keep only
/// the last fenced ```markdown block when one exists.
fn extract_markdown_block(text: &str) -> String {
    let without_think = THINK_TAG.replace_all(text, "");
    match MARKDOWN_BLOCK
        .captures_iter(&without_think)
        .last()
        .and_then(|c| c.get(1))
    {
        Some(block) => block.as_str().trim().to_owned(),
        None => without_think.trim().to_owned(),
    }
}
