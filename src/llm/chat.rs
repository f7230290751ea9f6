//! Synchronous chat-completion client.
//!
//! A `ChatSession` is an append-only message log owned by exactly one run:
//! created once with the system message, extended after every exchange, and
//! discarded at process exit. The `ChatApi` trait is the seam that lets the
//! retry and multi-pass machinery run against a fake in tests.

use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

use super::{ChatApiErrorBody, ChatApiResponse, ChatMessage};

const CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Api {
        status: u16,
        message: String,
        /// Server-suggested wait, from the Retry-After header.
        retry_after_secs: Option<f64>,
    },

    #[error("malformed chat response: {0}")]
    Malformed(String),
}

impl ChatError {
    /// Rate-limit signature: HTTP 429, or a textual "rate limit" marker in
    /// the error body.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            ChatError::Api {
                status, message, ..
            } => *status == 429 || message.to_lowercase().contains("rate limit"),
            ChatError::Transport(e) => e.status() == Some(StatusCode::TOO_MANY_REQUESTS),
            ChatError::Malformed(_) => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<f64> {
        match self {
            ChatError::Api {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Append-only conversation log. Never shared across concurrent runs.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub model: String,
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(model: impl Into<String>, system_message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::system(system_message)],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

pub trait ChatApi {
    /// Append the user message to the session, make one chat call, and on
    /// success append and return the assistant text. Raises on 429s,
    /// timeouts, and non-200s so the caller can retry with backoff.
    fn ask(
        &self,
        session: &mut ChatSession,
        user_message: &str,
    ) -> impl std::future::Future<Output = Result<String, ChatError>> + Send;
}

#[derive(Clone)]
pub struct OpenAiChat {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
        }
    }
}

impl ChatApi for OpenAiChat {
    async fn ask(
        &self,
        session: &mut ChatSession,
        user_message: &str,
    ) -> Result<String, ChatError> {
        session.push_user(user_message);

        let resp = self
            .http
            .post(CHAT_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": session.model,
                "messages": session.messages(),
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after_secs = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChatApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(ChatError::Api {
                status: status.as_u16(),
                message,
                retry_after_secs,
            });
        }

        let parsed = resp.json::<ChatApiResponse>().await?;
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| ChatError::Malformed("no choices in response".to_string()))?;
        let answer = choice.message.content.trim().to_string();
        session.push_assistant(answer.clone());
        Ok(answer)
    }
}
