//! Zhipu (GLM) chat completion provider
//!
//! OpenAI-style `/chat/completions` with an optional `retrieval` tool that
//! grounds answers in a Zhipu knowledge base.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{
    ChatProvider, ChatRequest, Delta, EventStream, Message, UpstreamError, UpstreamEvent,
    check_status, decode_stream, endpoint, value_to_code,
};
use crate::config::ZhipuConfig;
use crate::error::Result;
use crate::sse::SseFrame;

/// Zhipu chat completion request body
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool<'a>>,
}

/// Zhipu messages carry no content type
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: super::Role,
    content: &'a str,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: message.role,
            content: &message.content,
        }
    }
}

#[derive(Debug, Serialize)]
struct Tool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    retrieval: Retrieval<'a>,
}

#[derive(Debug, Serialize)]
struct Retrieval<'a> {
    knowledge_id: &'a str,
    prompt_template: &'a str,
}

pub struct ZhipuProvider {
    client: Client,
    url: Url,
    api_key: String,
    request_timeout: Duration,
}

impl ZhipuProvider {
    pub fn new(client: Client, config: &ZhipuConfig, request_timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let url = endpoint(&config.base_url, "chat/completions")?;

        tracing::info!("Zhipu provider initialized with endpoint: {}", url);

        Ok(Self {
            client,
            url,
            api_key,
            request_timeout,
        })
    }

    fn body<'a>(
        &self,
        request: &'a ChatRequest,
        stream: bool,
    ) -> std::result::Result<CompletionRequest<'a>, UpstreamError> {
        let model = request.model.as_deref().ok_or_else(|| {
            UpstreamError::Protocol("No model selected for zhipu request".to_string())
        })?;

        let tools = request
            .retrieval
            .as_ref()
            .map(|r| Tool {
                kind: "retrieval",
                retrieval: Retrieval {
                    knowledge_id: &r.knowledge_id,
                    prompt_template: &r.prompt_template,
                },
            })
            .into_iter()
            .collect();

        Ok(CompletionRequest {
            model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            stream,
            tools,
        })
    }
}

#[async_trait]
impl ChatProvider for ZhipuProvider {
    async fn complete(&self, request: &ChatRequest) -> std::result::Result<String, UpstreamError> {
        let body = self.body(request, false)?;
        tracing::debug!("Calling zhipu at: {}", self.url);

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        let response = check_status(response).await?;
        let json: Value = response.json().await?;
        parse_completion(&json)
    }

    async fn stream(&self, request: &ChatRequest) -> std::result::Result<EventStream, UpstreamError> {
        let body = self.body(request, true)?;
        tracing::debug!("Streaming from zhipu at: {}", self.url);

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(decode_stream(self.name(), response.bytes_stream(), decode_zhipu_frame))
    }

    fn name(&self) -> &'static str {
        "zhipu"
    }
}

/// Extract the answer from a non-streaming completion body
fn parse_completion(json: &Value) -> std::result::Result<String, UpstreamError> {
    if let Some(UpstreamEvent::Error { code, message }) = error_event(json) {
        return Err(UpstreamError::Provider { code, message });
    }

    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            UpstreamError::Protocol("Completion has no choices[0].message.content".to_string())
        })
}

fn error_event(json: &Value) -> Option<UpstreamEvent> {
    let error = json.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown zhipu API error")
        .to_string();
    let code = error.get("code").and_then(value_to_code);
    Some(UpstreamEvent::Error { code, message })
}

/// Decode one `data:` line of a zhipu stream
pub fn decode_zhipu_frame(
    frame: &SseFrame,
) -> std::result::Result<Option<UpstreamEvent>, serde_json::Error> {
    if frame.is_done_sentinel() {
        return Ok(Some(UpstreamEvent::Done));
    }

    let json: Value = serde_json::from_str(&frame.data)?;

    if let Some(event) = error_event(&json) {
        return Ok(Some(event));
    }

    let Some(delta) = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
    else {
        return Ok(None);
    };

    let content = delta
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reasoning = delta
        .get("reasoning_content")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Some(UpstreamEvent::Delta(Delta {
        reasoning,
        ..Delta::answer(content)
    })))
}
