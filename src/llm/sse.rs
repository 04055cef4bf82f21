//! Streaming event parser for provider server-sent events
//!
//! Pure push parser: feed it byte chunks, get typed [`StreamEvent`]s back.
//! Buffering is internal, so event frames that span chunk boundaries are
//! handled transparently and any splitting of the same byte log yields the
//! same event sequence.

use std::collections::HashMap;

use super::types::{StopReason, StreamErrorKind, StreamEvent, TokenUsage};

/// What kind of content block a given wire index carries
#[derive(Debug, Clone)]
enum BlockKind {
    Text,
    ToolUse { id: String },
}

/// Incremental SSE parser for one provider response
#[derive(Debug, Default)]
pub struct SseParser {
    /// Raw bytes; frames are cut at blank lines (ASCII), so a multibyte
    /// character split across chunks reassembles before decoding
    buffer: Vec<u8>,
    /// Wire block index -> block kind, so content_block_stop can be
    /// attributed to the right tool call
    blocks: HashMap<usize, BlockKind>,
    /// Stop reason from message_delta, reported at message_stop
    pending_stop: Option<StopReason>,
    saw_message_stop: bool,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns all events completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((pos, sep_len)) = find_frame_end(&self.buffer) {
            let frame = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
            self.buffer.drain(..pos + sep_len);
            self.parse_frame(&frame, &mut events);
        }
        events
    }

    /// Signal end of the byte stream. Drains any residual frame and, if no
    /// message_stop was ever seen, synthesizes a truncation error.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        let residual = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        if !residual.trim().is_empty() {
            self.parse_frame(&residual, &mut events);
        }

        if !self.saw_message_stop {
            events.push(StreamEvent::Error {
                kind: StreamErrorKind::Truncated,
                message: "stream ended before message_stop".to_string(),
            });
        }
        events
    }

    fn parse_frame(&mut self, frame: &str, events: &mut Vec<StreamEvent>) {
        let mut event_type = String::new();
        let mut data = String::new();

        for line in frame.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(et) = line.strip_prefix("event: ") {
                event_type = et.to_string();
            } else if let Some(d) = line.strip_prefix("data: ") {
                data = d.to_string();
            }
        }

        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let Ok(json) = serde_json::from_str::<serde_json::Value>(&data) else {
            return;
        };

        // Some providers omit the event: line; fall back to the type field.
        let kind = if event_type.is_empty() {
            json["type"].as_str().unwrap_or_default().to_string()
        } else {
            event_type
        };

        match kind.as_str() {
            "message_start" => {
                let model = json["message"]["model"].as_str().map(str::to_string);
                events.push(StreamEvent::MessageStart { model });
                if let Some(usage) = parse_usage(&json["message"]["usage"]) {
                    events.push(StreamEvent::Usage(usage));
                }
            }
            "content_block_start" => {
                let Some(index) = json["index"].as_u64() else {
                    return;
                };
                let block = &json["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        self.blocks
                            .insert(index as usize, BlockKind::ToolUse { id: id.clone() });
                        events.push(StreamEvent::ToolCallStart { id, name });
                    }
                    _ => {
                        self.blocks.insert(index as usize, BlockKind::Text);
                    }
                }
            }
            "content_block_delta" => {
                let delta = &json["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        let index = json["index"].as_u64().unwrap_or_default() as usize;
                        if let Some(BlockKind::ToolUse { id }) = self.blocks.get(&index) {
                            if let Some(fragment) = delta["partial_json"].as_str() {
                                events.push(StreamEvent::ToolCallArgDelta {
                                    id: id.clone(),
                                    fragment: fragment.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = json["index"].as_u64().unwrap_or_default() as usize;
                if let Some(BlockKind::ToolUse { id }) = self.blocks.get(&index) {
                    events.push(StreamEvent::ToolCallEnd { id: id.clone() });
                }
            }
            "message_delta" => {
                if let Some(reason) = json["delta"]["stop_reason"].as_str() {
                    self.pending_stop = Some(match reason {
                        "tool_use" => StopReason::ToolUse,
                        "max_tokens" => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    });
                }
                if let Some(usage) = parse_usage(&json["usage"]) {
                    events.push(StreamEvent::Usage(usage));
                }
            }
            "message_stop" => {
                self.saw_message_stop = true;
                events.push(StreamEvent::MessageStop {
                    stop_reason: self.pending_stop.unwrap_or(StopReason::EndTurn),
                });
            }
            "ping" => {}
            "error" => {
                let message = json["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown provider error")
                    .to_string();
                events.push(StreamEvent::Error {
                    kind: StreamErrorKind::Protocol,
                    message,
                });
            }
            _ => {}
        }
    }
}

/// Position and length of the next blank-line frame separator, accepting
/// both LF and CRLF line endings.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let obj = value.as_object()?;
    let get = |key: &str| obj.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let usage = TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_tokens: get("cache_read_input_tokens"),
        cache_creation_tokens: get("cache_creation_input_tokens"),
    };
    if usage == TokenUsage::default() {
        None
    } else {
        Some(usage)
    }
}
