//! Line-level SSE decoding for upstream chat streams
//!
//! Upstream providers frame their streams as `event:` / `data:` lines. Each
//! `data:` line is dispatched as soon as it is complete, tagged with the most
//! recent `event:` name, so a single bad line never holds up or ends the
//! stream.

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};

/// One `data:` line together with the event name in effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// True for the `[DONE]` end-of-stream sentinel, quoted or bare
    pub fn is_done_sentinel(&self) -> bool {
        let data = self.data.trim();
        data == "[DONE]" || data == "\"[DONE]\""
    }
}

/// Stateful parser fed one line at a time
#[derive(Debug, Default)]
pub struct SseLineParser {
    event: Option<String>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its newline); returns a frame for `data:` lines
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        if let Some(value) = field_value(line, "event") {
            self.event = Some(value.trim().to_string());
            return None;
        }

        if let Some(value) = field_value(line, "data") {
            return Some(SseFrame {
                event: self.event.clone(),
                data: value.to_string(),
            });
        }

        None
    }

    /// Feed one raw line; lines that are not valid UTF-8 are skipped
    pub fn push_raw_line(&mut self, line: &[u8]) -> Option<SseFrame> {
        match std::str::from_utf8(line) {
            Ok(text) => self.push_line(text),
            Err(e) => {
                tracing::warn!(
                    error_type = "upstream_protocol",
                    error_message = %e,
                    "Skipping SSE line that is not valid UTF-8"
                );
                None
            }
        }
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Splits arbitrary byte chunks into `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos).freeze();
            self.buffer.advance(1);
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line once the input is exhausted
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}

/// Turn an upstream byte stream into a stream of frames
///
/// A transport error is forwarded once and ends the stream.
pub fn frames<S, E>(body: S) -> impl Stream<Item = Result<SseFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut splitter = LineSplitter::new();
        let mut parser = SseLineParser::new();
        let mut failed = false;

        futures::pin_mut!(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in splitter.push(&bytes) {
                        if let Some(frame) = parser.push_raw_line(&line) {
                            yield Ok(frame);
                        }
                    }
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }

        if !failed {
            if let Some(line) = splitter.finish() {
                if let Some(frame) = parser.push_raw_line(&line) {
                    yield Ok(frame);
                }
            }
        }
    }
}
