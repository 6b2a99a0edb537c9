//! Model service boundary: the Messages-API data model and an HTTP client.
//!
//! The rest of the workspace treats the model as an opaque call-and-response
//! service behind [`ModelClient`]; anything obeying the request/response
//! contract can stand in (tests use a scripted client).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// User turn carrying tool results, each tagged with the invocation id
    /// it answers.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::User,
            content: results
                .into_iter()
                .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("missing {API_KEY_ENV} in environment")]
    MissingApiKey,
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model service returned status {status}: {body}")]
    Api { status: u16, body: String },
}

#[allow(async_fn_in_trait)]
pub trait ModelClient {
    async fn complete(&self, request: &MessagesRequest) -> Result<MessagesResponse, ModelError>;
}

impl<T: ModelClient> ModelClient for &T {
    async fn complete(&self, request: &MessagesRequest) -> Result<MessagesResponse, ModelError> {
        (**self).complete(request).await
    }
}

impl<T: ModelClient> ModelClient for std::sync::Arc<T> {
    async fn complete(&self, request: &MessagesRequest) -> Result<MessagesResponse, ModelError> {
        (**self).complete(request).await
    }
}

/// HTTP client for the Anthropic Messages endpoint. No retry and no
/// client-side timeout: a stalled call stalls the owning trial, which the
/// operator handles by rerunning (typically in sequential mode).
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn from_env() -> Result<Self, ModelError> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| ModelError::MissingApiKey)?;
        Ok(Self::new(ANTHROPIC_API_URL, api_key))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &MessagesRequest) -> Result<MessagesResponse, ModelError> {
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
