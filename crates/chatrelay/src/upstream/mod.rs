//! Upstream chat providers
//!
//! Each provider turns a provider-neutral [`ChatRequest`] into its own wire
//! format and decodes the answer, either as one complete message or as a
//! stream of [`UpstreamEvent`]s.

mod coze;
mod zhipu;

pub use coze::{CozeProvider, decode_coze_frame};
pub use zhipu::{ZhipuProvider, decode_zhipu_frame};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::sse::{self, SseFrame};

/// Stream of decoded upstream events for one request
pub type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<UpstreamEvent, UpstreamError>> + Send>>;

/// Errors raised while talking to an upstream provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Connect or read timed out
    #[error("Upstream request timed out: {0}")]
    Timeout(String),

    /// Upstream answered with a non-2xx status
    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded
    #[error("Malformed upstream response: {0}")]
    Protocol(String),

    /// Connection-level failure other than a timeout
    #[error("Upstream network error: {0}")]
    Network(String),

    /// Upstream reported an error inside an otherwise successful response
    #[error("Upstream error{}: {message}", fmt_code(.code))]
    Provider {
        code: Option<String>,
        message: String,
    },
}

fn fmt_code(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" {c}")).unwrap_or_default()
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout(e.to_string())
        } else if e.is_decode() {
            UpstreamError::Protocol(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// How a message's content is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
}

/// One message sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            content_type: ContentType::Text,
        }
    }
}

/// Build the ordered `[system, user]` conversation
pub fn build_conversation(system_prompt: &str, query: &str) -> Vec<Message> {
    vec![
        Message::text(Role::System, system_prompt),
        Message::text(Role::User, query),
    ]
}

/// Knowledge-base retrieval tool attached to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalTool {
    pub knowledge_id: String,
    pub prompt_template: String,
}

/// Provider-neutral chat request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub bot_id: Option<String>,
    pub retrieval: Option<RetrievalTool>,
}

impl ChatRequest {
    pub fn new(system_prompt: &str, query: &str) -> Self {
        Self {
            messages: build_conversation(system_prompt, query),
            model: None,
            bot_id: None,
            retrieval: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_bot_id(mut self, bot_id: Option<String>) -> Self {
        self.bot_id = bot_id;
        self
    }

    pub fn with_retrieval(mut self, retrieval: Option<RetrievalTool>) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Content of the last user message
    pub fn user_query(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Content of the system message, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Kind of a streamed message fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Answer,
    Other(String),
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        if kind == "answer" {
            MessageKind::Answer
        } else {
            MessageKind::Other(kind.to_string())
        }
    }
}

/// Incremental message fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub reasoning: Option<String>,
}

impl Delta {
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            kind: MessageKind::Answer,
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            kind: MessageKind::Answer,
            content: String::new(),
            reasoning: Some(reasoning.into()),
        }
    }

    /// Answer content from the assistant, non-empty
    pub fn answer_content(&self) -> Option<&str> {
        let is_answer = self.role == Role::Assistant && self.kind == MessageKind::Answer;
        (is_answer && !self.content.is_empty()).then_some(self.content.as_str())
    }

    pub fn reasoning_content(&self) -> Option<&str> {
        self.reasoning.as_deref().filter(|r| !r.is_empty())
    }
}

/// Provider-neutral decoding of one SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Delta(Delta),
    Error {
        code: Option<String>,
        message: String,
    },
    Done,
}

/// Decodes one frame; `Ok(None)` for frames that carry nothing relevant
pub type FrameDecoder = fn(&SseFrame) -> std::result::Result<Option<UpstreamEvent>, serde_json::Error>;

/// An upstream chat-completion API
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run a non-streaming completion and return the answer text
    async fn complete(&self, request: &ChatRequest) -> std::result::Result<String, UpstreamError>;

    /// Start a streaming completion
    ///
    /// Resolves once the response headers are in, so status failures are
    /// reported here rather than inside the stream.
    async fn stream(&self, request: &ChatRequest) -> std::result::Result<EventStream, UpstreamError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Build the HTTP client shared by all providers
pub fn build_http_client(config: &ServerConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .build()
        .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))
}

/// Join an API path onto a configured base URL
pub(crate) fn endpoint(base_url: &str, path: &str) -> Result<Url> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&base)
        .and_then(|url| url.join(path.trim_start_matches('/')))
        .map_err(|e| RelayError::Config(format!("Invalid provider base URL '{base_url}': {e}")))
}

/// Turn a non-2xx response into [`UpstreamError::Status`]
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Provider error codes arrive as numbers or strings
pub(crate) fn value_to_code(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode a streaming response body into events
///
/// Malformed frames are logged and skipped; transport failures end the
/// stream with an error item.
pub(crate) fn decode_stream<S>(provider: &'static str, body: S, decoder: FrameDecoder) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let events = sse::frames(body).filter_map(move |item| {
        let decoded = match item {
            Ok(frame) => match decoder(&frame) {
                Ok(event) => event.map(Ok),
                Err(e) => {
                    tracing::warn!(
                        provider,
                        error_type = "upstream_protocol",
                        error_message = %e,
                        data = %frame.data,
                        "Could not decode upstream data line, skipping"
                    );
                    None
                }
            },
            Err(e) => Some(Err(UpstreamError::from(e))),
        };
        futures::future::ready(decoded)
    });

    Box::pin(events)
}
