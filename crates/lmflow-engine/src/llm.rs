//! The language-model collaborator.
//!
//! [`LlmClient`] is the boundary the `llm` operation calls through.
//! [`OpenAiCompatClient`] talks to any OpenAI-compatible chat-completions
//! endpoint (bearer auth, JSON body); [`EchoLlm`] is the deterministic
//! test double that returns its user prompt unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Model selector carried in `llm` step settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmModel {
    Small,
    Large,
    Reasoning,
}

impl LlmModel {
    /// The provider-side model id this selector maps to.
    pub fn provider_slug(&self) -> &'static str {
        match self {
            LlmModel::Small => "openai/gpt-4o-mini",
            LlmModel::Large => "anthropic/claude-sonnet-4",
            LlmModel::Reasoning => "openai/o3-mini",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: LlmModel,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub output_tokens: Option<u64>,
}

/// Errors reported by LLM collaborators.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider response invalid: {0}")]
    InvalidResponse(String),
}

/// The model collaborator boundary.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Chat client for OpenAI-compatible providers.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        OpenAiCompatClient {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": request.model.provider_slug(),
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
        });

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body_text)
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                LlmError::InvalidResponse("missing assistant content".to_string())
            })?;

        Ok(LlmResponse {
            text,
            output_tokens: parsed.usage.map(|u| u.completion_tokens),
        })
    }
}

/// Test double: replies with the user prompt unchanged and a token count
/// equal to its whitespace-separated word count.
pub struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            text: request.user_prompt.clone(),
            output_tokens: Some(request.user_prompt.split_whitespace().count() as u64),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    completion_tokens: u64,
}
