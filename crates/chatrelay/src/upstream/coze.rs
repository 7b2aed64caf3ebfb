//! Coze agent platform provider (`/v3/chat`)

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{
    ChatProvider, ChatRequest, ContentType, Delta, EventStream, MessageKind, Role, UpstreamError,
    UpstreamEvent, check_status, decode_stream, endpoint, value_to_code,
};
use crate::config::CozeConfig;
use crate::error::Result;
use crate::relay::collect_answer;
use crate::sse::SseFrame;

const EVENT_DELTA: &str = "conversation.message.delta";
const EVENT_FAILED: &str = "conversation.chat.failed";
const EVENT_ERROR: &str = "error";
const EVENT_DONE: &str = "done";

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    bot_id: &'a str,
    user_id: &'a str,
    stream: bool,
    auto_save_history: bool,
    additional_messages: Vec<AdditionalMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AdditionalMessage<'a> {
    role: Role,
    content: &'a str,
    content_type: ContentType,
}

pub struct CozeProvider {
    client: Client,
    url: Url,
    api_key: String,
    user_id: String,
    request_timeout: Duration,
}

impl CozeProvider {
    pub fn new(client: Client, config: &CozeConfig, request_timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let url = endpoint(&config.base_url, "v3/chat")?;

        tracing::info!("Coze provider initialized with endpoint: {}", url);

        Ok(Self {
            client,
            url,
            api_key,
            user_id: config.user_id.clone(),
            request_timeout,
        })
    }

    // The bot carries its own persona, so the system message is not forwarded.
    fn body<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> std::result::Result<ChatBody<'a>, UpstreamError> {
        let bot_id = request.bot_id.as_deref().ok_or_else(|| {
            UpstreamError::Protocol("No bot_id selected for coze request".to_string())
        })?;
        let query = request.user_query().unwrap_or_default();

        Ok(ChatBody {
            bot_id,
            user_id: &self.user_id,
            stream: true,
            auto_save_history: false,
            additional_messages: vec![AdditionalMessage {
                role: Role::User,
                content: query,
                content_type: ContentType::Text,
            }],
        })
    }
}

#[async_trait]
impl ChatProvider for CozeProvider {
    /// Coze only streams; the answer is collected from the event stream
    async fn complete(&self, request: &ChatRequest) -> std::result::Result<String, UpstreamError> {
        let collect = async {
            let events = self.stream(request).await?;
            collect_answer(events).await
        };

        tokio::time::timeout(self.request_timeout, collect)
            .await
            .map_err(|_| {
                UpstreamError::Timeout(format!(
                    "Coze answer not complete after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
    }

    async fn stream(&self, request: &ChatRequest) -> std::result::Result<EventStream, UpstreamError> {
        let body = self.body(request)?;
        tracing::debug!(bot_id = body.bot_id, "Streaming from coze at: {}", self.url);

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(decode_stream(self.name(), response.bytes_stream(), decode_coze_frame))
    }

    fn name(&self) -> &'static str {
        "coze"
    }
}

/// Decode one Coze frame using its `event:` name
pub fn decode_coze_frame(
    frame: &SseFrame,
) -> std::result::Result<Option<UpstreamEvent>, serde_json::Error> {
    let event = frame.event.as_deref();
    if frame.is_done_sentinel() || event == Some(EVENT_DONE) {
        return Ok(Some(UpstreamEvent::Done));
    }

    match event {
        Some(EVENT_DELTA) => {
            let data: Value = serde_json::from_str(&frame.data)?;
            Ok(decode_delta(&data).map(UpstreamEvent::Delta))
        }
        Some(EVENT_ERROR) => {
            let data: Value = serde_json::from_str(&frame.data)?;
            let error = data.get("error").unwrap_or(&data);
            Ok(Some(error_event(error, "Unknown Coze API error")))
        }
        Some(EVENT_FAILED) => {
            let data: Value = serde_json::from_str(&frame.data)?;
            let error = data.get("last_error").unwrap_or(&data);
            Ok(Some(error_event(error, "Coze chat failed")))
        }
        _ => Ok(None),
    }
}

fn decode_delta(data: &Value) -> Option<Delta> {
    let role = match data.get("role").and_then(Value::as_str)? {
        "assistant" => Role::Assistant,
        "user" => Role::User,
        "system" => Role::System,
        _ => return None,
    };
    let kind = MessageKind::parse(data.get("type").and_then(Value::as_str).unwrap_or_default());

    Some(Delta {
        role,
        kind,
        content: data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        reasoning: data
            .get("reasoning_content")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn error_event(error: &Value, fallback: &str) -> UpstreamEvent {
    let message = error
        .get("message")
        .or_else(|| error.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string();
    let code = error.get("code").and_then(value_to_code);
    UpstreamEvent::Error { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    fn provider() -> CozeProvider {
        let config = CozeConfig {
            api_key: Some("cz".to_string()),
            user_id: "kiosk".to_string(),
            ..CozeConfig::default()
        };
        CozeProvider::new(Client::new(), &config, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_body_sends_only_the_user_message() {
        let provider = provider();
        let request = ChatRequest::new("ignored persona", "门票多少钱")
            .with_bot_id(Some("7474949068725518386".to_string()));

        let body = serde_json::to_value(provider.body(&request).unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "bot_id": "7474949068725518386",
                "user_id": "kiosk",
                "stream": true,
                "auto_save_history": false,
                "additional_messages": [
                    {"role": "user", "content": "门票多少钱", "content_type": "text"}
                ]
            })
        );
    }

    #[test]
    fn test_body_requires_bot_id() {
        assert!(provider().body(&ChatRequest::new("s", "q")).is_err());
    }

    #[test]
    fn test_decode_answer_delta() {
        let event = decode_coze_frame(&frame(
            EVENT_DELTA,
            r#"{"role":"assistant","type":"answer","content":"你好","content_type":"text"}"#,
        ))
        .unwrap();
        assert_eq!(event, Some(UpstreamEvent::Delta(Delta::answer("你好"))));
    }

    #[test]
    fn test_decode_reasoning_delta() {
        let event = decode_coze_frame(&frame(
            EVENT_DELTA,
            r#"{"role":"assistant","type":"answer","content":"","reasoning_content":"想一想"}"#,
        ))
        .unwrap();
        let Some(UpstreamEvent::Delta(delta)) = event else {
            panic!("Expected delta");
        };
        assert_eq!(delta.reasoning_content(), Some("想一想"));
        assert_eq!(delta.answer_content(), None);
    }

    #[test]
    fn test_decode_follow_up_is_not_an_answer() {
        let event = decode_coze_frame(&frame(
            EVENT_DELTA,
            r#"{"role":"assistant","type":"follow_up","content":"还想了解什么？"}"#,
        ))
        .unwrap();
        let Some(UpstreamEvent::Delta(delta)) = event else {
            panic!("Expected delta");
        };
        assert_eq!(delta.kind, MessageKind::Other("follow_up".to_string()));
        assert_eq!(delta.answer_content(), None);
    }

    #[test]
    fn test_decode_unknown_role_is_ignored() {
        let event =
            decode_coze_frame(&frame(EVENT_DELTA, r#"{"role":"tool","type":"answer","content":"x"}"#))
                .unwrap();
        assert_eq!(event, None);
    }

    #[test]
    fn test_decode_done_variants() {
        assert_eq!(
            decode_coze_frame(&frame(EVENT_DONE, "\"[DONE]\"")).unwrap(),
            Some(UpstreamEvent::Done)
        );
        assert_eq!(
            decode_coze_frame(&frame(EVENT_DONE, "{}")).unwrap(),
            Some(UpstreamEvent::Done)
        );
        let bare = SseFrame {
            event: None,
            data: "[DONE]".to_string(),
        };
        assert_eq!(decode_coze_frame(&bare).unwrap(), Some(UpstreamEvent::Done));
    }

    #[test]
    fn test_decode_error_event() {
        let event = decode_coze_frame(&frame(
            EVENT_ERROR,
            r#"{"error":{"code":4011,"message":"quota exceeded"}}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            Some(UpstreamEvent::Error {
                code: Some("4011".to_string()),
                message: "quota exceeded".to_string()
            })
        );
    }

    #[test]
    fn test_decode_error_event_flat_msg() {
        let event =
            decode_coze_frame(&frame(EVENT_ERROR, r#"{"code":4100,"msg":"bad token"}"#)).unwrap();
        assert_eq!(
            event,
            Some(UpstreamEvent::Error {
                code: Some("4100".to_string()),
                message: "bad token".to_string()
            })
        );
    }

    #[test]
    fn test_decode_chat_failed() {
        let event = decode_coze_frame(&frame(
            EVENT_FAILED,
            r#"{"id":"1","status":"failed","last_error":{"code":5000,"msg":"bot offline"}}"#,
        ))
        .unwrap();
        assert_eq!(
            event,
            Some(UpstreamEvent::Error {
                code: Some("5000".to_string()),
                message: "bot offline".to_string()
            })
        );
    }

    #[test]
    fn test_other_events_ignored() {
        let event = decode_coze_frame(&frame(
            "conversation.message.completed",
            r#"{"role":"assistant","type":"answer","content":"full text"}"#,
        ))
        .unwrap();
        assert_eq!(event, None);
        assert_eq!(
            decode_coze_frame(&frame("conversation.chat.created", "{not json")).unwrap(),
            None
        );
    }

    #[test]
    fn test_malformed_delta() {
        assert!(decode_coze_frame(&frame(EVENT_DELTA, "{oops")).is_err());
    }
}
