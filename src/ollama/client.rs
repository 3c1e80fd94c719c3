//! Ollama HTTP client
//!
//! [`ModelEndpoint`] is the seam the agent loop talks to; [`ChatClient`] is
//! the real implementation over `/api/chat`. Tests drive the loop with a
//! scripted endpoint instead.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::tool_use::{ChatMessage, ChatResponse, Tool};
use crate::config::ModelConfig;

/// Error type for model endpoint calls
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("empty response from model endpoint")]
    EmptyResponse,
}

impl ChatError {
    /// Worth one retry: the endpoint was unreachable, slow, or briefly overloaded
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ChatError::Status { status, .. } => *status >= 500,
            ChatError::Parse(_) | ChatError::EmptyResponse => false,
        }
    }
}

/// Anything that can answer a chat request with optional tool calls
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Tool]) -> Result<ChatResponse, ChatError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            client,
        })
    }

    /// Use a different model than the configured one
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Names of locally available models (`/api/tags`)
    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Status { status: status.as_u16(), body: text });
        }
        let tags: TagsResponse = serde_json::from_str(&text)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pull a model (`/api/pull`, non-streaming). Can take many minutes.
    pub async fn pull_model(&self, model: &str) -> Result<(), ChatError> {
        info!(model, "Pulling model");
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .timeout(Duration::from_secs(3600))
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status { status: status.as_u16(), body });
        }
        info!(model, "Model pulled");
        Ok(())
    }

    /// Make sure a usable model exists locally
    ///
    /// Returns the model that should be used: the configured one if present,
    /// else `fallback` (pulled if missing).
    pub async fn ensure_model(&self, fallback: &str) -> Result<String, ChatError> {
        let available = self.list_models().await?;
        if has_model(&available, &self.model) {
            return Ok(self.model.clone());
        }
        if !has_model(&available, fallback) {
            warn!(model = %self.model, fallback, "Configured model missing, pulling fallback");
            self.pull_model(fallback).await?;
        }
        Ok(fallback.to_string())
    }
}

/// `chi` matches `chi:latest`; an explicit tag must match exactly
pub fn has_model(available: &[String], wanted: &str) -> bool {
    available.iter().any(|name| {
        name == wanted || (!wanted.contains(':') && name.split(':').next() == Some(wanted))
    })
}

#[async_trait]
impl ModelEndpoint for ChatClient {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Tool]) -> Result<ChatResponse, ChatError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": self.temperature
            }
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ChatError::Status { status: status.as_u16(), body: text });
        }
        if text.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        Ok(chat_response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_model_tag_matching() {
        let available = vec!["chi:latest".to_string(), "qwen3:8b".to_string()];
        assert!(has_model(&available, "chi"));
        assert!(has_model(&available, "qwen3:8b"));
        assert!(!has_model(&available, "qwen3:14b"));
        assert!(!has_model(&available, "llama3.2"));
    }

    #[test]
    fn test_status_errors_transient_only_for_5xx() {
        assert!(ChatError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!ChatError::Status { status: 404, body: String::new() }.is_transient());
        assert!(!ChatError::EmptyResponse.is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let config = ModelConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ModelConfig::default()
        };
        let client = ChatClient::new(&config).unwrap();
        let err = client.chat(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
