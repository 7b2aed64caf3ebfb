//! Upstream event relay
//!
//! Turns provider-neutral [`UpstreamEvent`]s into the text fragments sent to
//! the client. Reasoning is buffered and emitted once, between the open and
//! close markers, just before the first answer fragment.

use futures::stream::{Stream, StreamExt};

use crate::config::RelayConfig;
use crate::upstream::{EventStream, UpstreamError, UpstreamEvent};

/// Joins buffered reasoning fragments
const REASONING_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RelayState {
    #[default]
    Idle,
    /// Open marker sent; fragments buffered until the answer starts
    Reasoning(Vec<String>),
    Answer,
    Done,
    Error,
}

/// Per-request relay state machine
#[derive(Debug)]
pub struct Relay {
    state: RelayState,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RelayState::Idle,
            config,
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RelayState::Done | RelayState::Error)
    }

    /// Feed one event; returns the tokens to emit, in order
    pub fn push(&mut self, event: UpstreamEvent) -> Vec<String> {
        if self.is_finished() {
            return Vec::new();
        }

        match event {
            UpstreamEvent::Delta(delta) => {
                let mut tokens = Vec::new();

                if let Some(reasoning) = delta.reasoning_content() {
                    self.push_reasoning(reasoning, &mut tokens);
                }

                if let Some(content) = delta.answer_content() {
                    if self.state != RelayState::Answer {
                        self.flush_reasoning(&mut tokens);
                        self.state = RelayState::Answer;
                    }
                    tokens.push(content.to_string());
                }

                tokens
            }
            UpstreamEvent::Error { code, message } => self.error_tokens(&message, code.as_deref()),
            UpstreamEvent::Done => self.finish(),
        }
    }

    /// Stop on a transport or protocol failure
    pub fn fail(&mut self, error: &UpstreamError) -> Vec<String> {
        if self.is_finished() {
            return Vec::new();
        }

        match error {
            UpstreamError::Provider { code, message } => {
                self.error_tokens(message, code.as_deref())
            }
            other => self.error_tokens(&other.to_string(), None),
        }
    }

    /// End of stream; flushes any pending reasoning
    pub fn finish(&mut self) -> Vec<String> {
        if self.is_finished() {
            return Vec::new();
        }

        let mut tokens = Vec::new();
        self.flush_reasoning(&mut tokens);
        self.state = RelayState::Done;
        tokens
    }

    fn push_reasoning(&mut self, reasoning: &str, tokens: &mut Vec<String>) {
        if let RelayState::Reasoning(buffer) = &mut self.state {
            buffer.push(reasoning.to_string());
        } else if self.state == RelayState::Idle {
            tokens.push(self.config.reasoning_open.clone());
            self.state = RelayState::Reasoning(vec![reasoning.to_string()]);
        } else {
            tracing::debug!("Dropping reasoning fragment received after the answer started");
        }
    }

    fn flush_reasoning(&mut self, tokens: &mut Vec<String>) {
        if let RelayState::Reasoning(buffer) = &self.state {
            let joined = buffer.join(REASONING_SEPARATOR);
            if !joined.is_empty() {
                tokens.push(joined);
            }
            tokens.push(self.config.reasoning_close.clone());
            self.state = RelayState::Idle;
        }
    }

    fn error_tokens(&mut self, message: &str, code: Option<&str>) -> Vec<String> {
        let mut tokens = Vec::new();
        self.flush_reasoning(&mut tokens);
        tokens.push(error_token(message, code));
        self.state = RelayState::Error;
        tokens
    }
}

/// In-band error marker appended to a stream that already started
pub fn error_token(message: &str, code: Option<&str>) -> String {
    match code {
        Some(code) => format!("[ERROR: {message} (code {code})]"),
        None => format!("[ERROR: {message}]"),
    }
}

/// Relay an upstream event stream as client-facing text fragments
pub fn relay_stream(mut events: EventStream, config: RelayConfig) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        let mut relay = Relay::new(config);

        while let Some(item) = events.next().await {
            let tokens = match item {
                Ok(event) => relay.push(event),
                Err(e) => {
                    tracing::error!(
                        error_type = "upstream_stream",
                        error_message = %e,
                        "Upstream stream failed mid-response"
                    );
                    relay.fail(&e)
                }
            };

            for token in tokens {
                yield token;
            }

            if relay.is_finished() {
                break;
            }
        }

        for token in relay.finish() {
            yield token;
        }
    }
}

/// Drain a stream and return only the answer text
///
/// Reasoning is discarded. An error event or transport failure fails the
/// whole answer.
pub async fn collect_answer(mut events: EventStream) -> Result<String, UpstreamError> {
    let mut answer = String::new();

    while let Some(item) = events.next().await {
        match item? {
            UpstreamEvent::Delta(delta) => {
                if let Some(content) = delta.answer_content() {
                    answer.push_str(content);
                }
            }
            UpstreamEvent::Error { code, message } => {
                return Err(UpstreamError::Provider { code, message });
            }
            UpstreamEvent::Done => break,
        }
    }

    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Delta;
    use futures::stream;

    fn events(items: Vec<Result<UpstreamEvent, UpstreamError>>) -> EventStream {
        Box::pin(stream::iter(items))
    }

    fn reasoning(text: &str) -> UpstreamEvent {
        UpstreamEvent::Delta(Delta::reasoning(text))
    }

    fn answer(text: &str) -> UpstreamEvent {
        UpstreamEvent::Delta(Delta::answer(text))
    }

    fn run(items: Vec<UpstreamEvent>) -> Vec<String> {
        let mut relay = Relay::new(RelayConfig::default());
        let mut out = Vec::new();
        for item in items {
            out.extend(relay.push(item));
        }
        out.extend(relay.finish());
        out
    }

    #[test]
    fn test_reasoning_then_answer() {
        let out = run(vec![
            reasoning("a"),
            reasoning("b"),
            answer("hello"),
            answer(" world"),
            UpstreamEvent::Done,
        ]);
        assert_eq!(out, vec!["<think>", "a\nb", "</think>", "hello", " world"]);
    }

    #[test]
    fn test_answer_only() {
        let out = run(vec![answer("A"), answer("B"), UpstreamEvent::Done]);
        assert_eq!(out, vec!["A", "B"]);
    }

    #[test]
    fn test_reasoning_flushed_on_done() {
        let out = run(vec![reasoning("only thinking"), UpstreamEvent::Done]);
        assert_eq!(out, vec!["<think>", "only thinking", "</think>"]);
    }

    #[test]
    fn test_reasoning_flushed_on_exhaustion() {
        let out = run(vec![reasoning("x")]);
        assert_eq!(out, vec!["<think>", "x", "</think>"]);
    }

    #[test]
    fn test_late_reasoning_is_dropped() {
        let out = run(vec![answer("A"), reasoning("late"), answer("B")]);
        assert_eq!(out, vec!["A", "B"]);
    }

    #[test]
    fn test_delta_with_reasoning_and_answer() {
        let mut delta = Delta::answer("go");
        delta.reasoning = Some("why".to_string());
        let out = run(vec![UpstreamEvent::Delta(delta)]);
        assert_eq!(out, vec!["<think>", "why", "</think>", "go"]);
    }

    #[test]
    fn test_empty_fragments_never_emitted() {
        let out = run(vec![reasoning(""), answer(""), answer("x"), answer("")]);
        assert_eq!(out, vec!["x"]);
    }

    #[test]
    fn test_markers_balanced_and_single() {
        let out = run(vec![
            reasoning("1"),
            reasoning("2"),
            reasoning("3"),
            answer("a"),
            reasoning("4"),
            answer("b"),
        ]);
        assert_eq!(out.iter().filter(|t| *t == "<think>").count(), 1);
        assert_eq!(out.iter().filter(|t| *t == "</think>").count(), 1);
        assert_eq!(out[1], "1\n2\n3");
    }

    #[test]
    fn test_error_event_stops_relay() {
        let mut relay = Relay::new(RelayConfig::default());
        assert_eq!(relay.push(reasoning("r")), vec!["<think>"]);

        let tokens = relay.push(UpstreamEvent::Error {
            code: Some("4011".to_string()),
            message: "quota".to_string(),
        });
        assert_eq!(tokens, vec!["r", "</think>", "[ERROR: quota (code 4011)]"]);
        assert_eq!(relay.state(), &RelayState::Error);
        assert!(relay.push(answer("ignored")).is_empty());
        assert!(relay.finish().is_empty());
    }

    #[test]
    fn test_fail_on_transport_error() {
        let mut relay = Relay::new(RelayConfig::default());
        relay.push(answer("partial"));
        let tokens = relay.fail(&UpstreamError::Network("reset".to_string()));
        assert_eq!(tokens, vec!["[ERROR: Upstream network error: reset]"]);
        assert!(relay.is_finished());
    }

    #[test]
    fn test_state_transitions() {
        let mut relay = Relay::new(RelayConfig::default());
        assert_eq!(relay.state(), &RelayState::Idle);

        relay.push(reasoning("a"));
        assert_eq!(relay.state(), &RelayState::Reasoning(vec!["a".to_string()]));

        relay.push(answer("b"));
        assert_eq!(relay.state(), &RelayState::Answer);

        relay.push(UpstreamEvent::Done);
        assert_eq!(relay.state(), &RelayState::Done);
        assert!(relay.push(answer("after done")).is_empty());
    }

    #[test]
    fn test_custom_markers() {
        let config = RelayConfig {
            reasoning_open: "[[".to_string(),
            reasoning_close: "]]".to_string(),
        };
        let mut relay = Relay::new(config);
        let mut out = relay.push(reasoning("x"));
        out.extend(relay.push(answer("y")));
        assert_eq!(out, vec!["[[", "x", "]]", "y"]);
    }

    #[test]
    fn test_error_token_format() {
        assert_eq!(error_token("boom", None), "[ERROR: boom]");
        assert_eq!(error_token("boom", Some("7")), "[ERROR: boom (code 7)]");
    }

    #[tokio::test]
    async fn test_relay_stream_is_deterministic() {
        let items = || {
            events(vec![
                Ok(reasoning("a")),
                Ok(reasoning("b")),
                Ok(answer("hello")),
                Ok(answer(" world")),
                Ok(UpstreamEvent::Done),
                Ok(answer("never")),
            ])
        };

        let first: Vec<String> = relay_stream(items(), RelayConfig::default()).collect().await;
        let second: Vec<String> = relay_stream(items(), RelayConfig::default()).collect().await;
        assert_eq!(first, vec!["<think>", "a\nb", "</think>", "hello", " world"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_relay_stream_transport_error() {
        let out: Vec<String> = relay_stream(
            events(vec![
                Ok(reasoning("thinking")),
                Err(UpstreamError::Timeout("read".to_string())),
                Ok(answer("never")),
            ]),
            RelayConfig::default(),
        )
        .collect()
        .await;

        assert_eq!(
            out,
            vec![
                "<think>",
                "thinking",
                "</think>",
                "[ERROR: Upstream request timed out: read]"
            ]
        );
    }

    #[tokio::test]
    async fn test_collect_answer_skips_reasoning() {
        let answer_text = collect_answer(events(vec![
            Ok(reasoning("hmm")),
            Ok(answer("你")),
            Ok(answer("好")),
            Ok(UpstreamEvent::Done),
        ]))
        .await
        .unwrap();
        assert_eq!(answer_text, "你好");
    }

    #[tokio::test]
    async fn test_collect_answer_error_event() {
        let result = collect_answer(events(vec![
            Ok(answer("partial")),
            Ok(UpstreamEvent::Error {
                code: None,
                message: "bot offline".to_string(),
            }),
        ]))
        .await;
        assert_eq!(
            result,
            Err(UpstreamError::Provider {
                code: None,
                message: "bot offline".to_string()
            })
        );
    }
}
