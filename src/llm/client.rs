use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::LlmFailureKind;

use super::{LlmClient, LlmError, Prompt, RawPlan};

/// Generic chat-completions-shaped client. Works against any OpenAI-compatible
/// endpoint; the exact vendor is a deployment detail (`LLM_API_BASE`/
/// `LLM_API_KEY`), not a compile-time choice.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, api_base: api_base.into(), api_key: api_key.into(), model: model.into() }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("LLM_API_KEY").ok()?;
        let api_base = std::env::var("LLM_BASE_URL")
            .or_else(|_| std::env::var("LLM_API_BASE"))
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Some(Self::new(api_base, api_key, model))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn propose_plan(&self, prompt: &Prompt) -> Result<RawPlan, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "temperature": 0.2,
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::new(LlmFailureKind::Timeout, e.to_string())
                } else {
                    LlmError::new(LlmFailureKind::Transport, e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(LlmError::new(LlmFailureKind::RateLimit, "rate limited by provider"));
        }
        if !response.status().is_success() {
            return Err(LlmError::new(
                LlmFailureKind::Transport,
                format!("provider returned {}", response.status()),
            ));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::new(LlmFailureKind::Format, format!("unparseable provider response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::new(LlmFailureKind::Format, "provider returned no choices"))?;
        Ok(RawPlan(content))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Deterministic client used in tests and as the default when no API key is
/// configured (§4.3 Rust-native additions). `valid` selects between a
/// fixed well-formed plan and a fixed malformed payload, so propose/fallback
/// behavior stays reproducible without a network call.
pub struct StubLlmClient {
    valid: bool,
    model: String,
}

impl StubLlmClient {
    pub fn valid() -> Self {
        Self { valid: true, model: "stub-llm".to_string() }
    }

    pub fn malformed() -> Self {
        Self { valid: false, model: "stub-llm".to_string() }
    }
}

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn propose_plan(&self, _prompt: &Prompt) -> Result<RawPlan, LlmError> {
        if self.valid {
            Ok(RawPlan(
                r#"{"ticker":"STUB","entry_type":"limit","entry_price":100.0,"stop_price":98.0,
                "target_prices":[103.0],"timeout_days":5,"confidence":0.7,"reason":"stub plan",
                "schema_version":"ProposeResponseV1"}"#
                    .to_string(),
            ))
        } else {
            Ok(RawPlan("not json at all".to_string()))
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
