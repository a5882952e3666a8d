//! The model endpoint seam and an OpenAI-compatible chat-completions
//! client behind it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::time::Duration;

use crate::error::ModelError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

/// One completion from the endpoint: free text the action decoder turns
/// into a [`crate::action::ModelDecision`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
}

/// The model as a pure function over a structured prompt. Network-bound
/// and fallible; the step loop owns retry and timeout policy.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelReply, ModelError>;
}

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("WEBPILOT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: 0.0,
            request_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> Result<Self, ModelError> {
        if cfg.api_key.is_empty() {
            return Err(ModelError::refused("OPENAI_API_KEY missing"));
        }
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| ModelError::refused(format!("http client: {e}")))?;
        Ok(Self { http, cfg })
    }

    fn role_str(role: &Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        let url = format!("{}/chat/completions", self.cfg.api_base);
        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|m| json!({ "role": Self::role_str(&m.role), "content": m.content }))
            .collect();
        let body = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "messages": messages,
        });

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::timeout(format!("request timed out: {e}"))
                } else {
                    ModelError::refused(format!("request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::malformed(format!("body read: {e}")))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::rate_limited(text));
        }
        if !status.is_success() {
            return Err(ModelError::refused(format!("endpoint returned {status}: {text}")));
        }

        let v: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ModelError::malformed(format!("response JSON: {e}")))?;
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .ok_or_else(|| ModelError::malformed("response missing message content"))?;
        Ok(ModelReply { text: content.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_refused() {
        let cfg = OpenAiConfig {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".into(),
            model: "m".into(),
            temperature: 0.0,
            request_timeout: Duration::from_secs(1),
        };
        let err = OpenAiClient::new(cfg).err().expect("should refuse");
        assert_eq!(err.kind, crate::error::ModelErrorKind::Refused);
    }

    #[test]
    fn message_constructors() {
        let m = ChatMessage::system("s");
        assert_eq!(m.role, Role::System);
        assert_eq!(OpenAiClient::role_str(&m.role), "system");
    }
}
