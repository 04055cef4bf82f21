//! Mock provider - scripted SSE streams for demo mode and tests

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::client::{ModelClient, ProviderStream};
use super::types::{ChatRequest, StreamError};

/// Builder for an SSE byte log in the provider's wire dialect
#[derive(Debug, Default)]
pub struct MockScript {
    frames: Vec<String>,
    next_block: usize,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame(mut self, event: &str, data: serde_json::Value) -> Self {
        self.frames.push(format!("event: {event}\ndata: {data}\n\n"));
        self
    }

    pub fn start(self, model: &str) -> Self {
        let data = serde_json::json!({
            "type": "message_start",
            "message": {"id": "msg_mock", "model": model, "usage": {}}
        });
        self.frame("message_start", data)
    }

    pub fn text(self, text: &str) -> Self {
        let data = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": text}
        });
        self.frame("content_block_delta", data)
    }

    /// Emit a complete tool call: block start, argument fragments, block stop
    pub fn tool_call(mut self, id: &str, name: &str, arguments: &str) -> Self {
        self.next_block += 1;
        let index = self.next_block;
        let mut script = self.frame(
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": id, "name": name}
            }),
        );
        // Split the arguments so consumers must reassemble fragments.
        let mut mid = arguments.len() / 2;
        while mid > 0 && !arguments.is_char_boundary(mid) {
            mid -= 1;
        }
        let (head, tail) = arguments.split_at(mid);
        for fragment in [head, tail] {
            if fragment.is_empty() {
                continue;
            }
            script = script.frame(
                "content_block_delta",
                serde_json::json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": fragment}
                }),
            );
        }
        script.frame(
            "content_block_stop",
            serde_json::json!({"type": "content_block_stop", "index": index}),
        )
    }

    pub fn usage(self, input_tokens: u64, output_tokens: u64) -> Self {
        self.frame(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {},
                "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
            }),
        )
    }

    pub fn stop(self, stop_reason: &str) -> Self {
        let with_reason = self.frame(
            "message_delta",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason}
            }),
        );
        with_reason.frame("message_stop", serde_json::json!({"type": "message_stop"}))
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.frames.concat())
    }
}

/// Scripted provider. Each `open_stream` pops the next queued script; when
/// the queue is empty a canned demo reply is streamed instead, so the app
/// works end to end without an API key.
pub struct MockClient {
    scripts: Mutex<VecDeque<Vec<Bytes>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_script(&self, script: MockScript) {
        self.push_chunks(vec![script.into_bytes()]);
    }

    /// Queue a response delivered as the given chunk sequence, so tests can
    /// interleave reads with cancellation or exercise chunk boundaries.
    pub fn push_chunks(&self, chunks: Vec<Bytes>) {
        self.scripts
            .lock()
            .expect("mock client lock poisoned")
            .push_back(chunks);
    }

    /// Raw bytes variant, for malformed or truncated streams
    pub fn push_raw(&self, bytes: impl Into<Bytes>) {
        self.push_chunks(vec![bytes.into()]);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("mock client lock poisoned").len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests
            .lock()
            .expect("mock client lock poisoned")
            .last()
            .cloned()
    }

    fn demo_reply() -> Vec<Bytes> {
        vec![MockScript::new()
            .start("mock-model")
            .text("Demo mode is active: no API key is configured, so this canned reply ")
            .text("exercises the streaming pipeline end to end.")
            .usage(12, 24)
            .stop("end_turn")
            .into_bytes()]
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ProviderStream, StreamError> {
        self.requests
            .lock()
            .expect("mock client lock poisoned")
            .push(request.clone());

        let chunks = self
            .scripts
            .lock()
            .expect("mock client lock poisoned")
            .pop_front()
            .unwrap_or_else(Self::demo_reply);

        Ok(ProviderStream::new(futures::stream::iter(
            chunks.into_iter().map(Ok),
        )))
    }
}
