//! Run context - explicit configuration and callbacks passed down at startup
//!
//! Replaces ambient globals: the model selection, system prompt, and the
//! upward-facing event callbacks all live here and travel by reference.

use std::sync::Arc;

use crate::limit::bucket::LimitKind;
use crate::llm::types::{ChatRequest, RequestEstimate, WireBlock, WireMessage};

/// Pre-flight estimate for a composed request: roughly four characters per
/// token. Good enough for limiter debits; realized usage comes from the
/// provider afterwards.
pub fn estimate_request(request: &ChatRequest) -> RequestEstimate {
    let mut chars: u64 = request
        .system
        .as_deref()
        .map(|s| s.chars().count() as u64)
        .unwrap_or(0);

    for message in &request.messages {
        for block in &message.content {
            chars += match block {
                WireBlock::Text(text) => text.chars().count() as u64,
                WireBlock::ToolUse { input, .. } => input.to_string().chars().count() as u64,
                WireBlock::ToolResult { content, .. } => content.chars().count() as u64,
            };
        }
    }
    for tool in &request.tools {
        chars += tool.description.chars().count() as u64;
        chars += tool.input_schema.to_string().chars().count() as u64;
    }

    RequestEstimate {
        input_tokens: (chars / 4).max(1),
        output_tokens: request.max_tokens as u64,
    }
}

/// Rate-limit event surfaced to the UI
#[derive(Debug, Clone)]
pub struct RateLimitNotice {
    pub kind: LimitKind,
    pub wait_ms: u64,
    pub queue_position: usize,
}

pub type RateLimitedCallback = Arc<dyn Fn(RateLimitNotice) + Send + Sync>;

/// Everything the agent loop needs that is decided at startup
#[derive(Clone)]
pub struct RunContext {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub on_rate_limited: Option<RateLimitedCallback>,
}

impl RunContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_tokens: 4096,
            on_rate_limited: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn notify_rate_limited(&self, notice: RateLimitNotice) {
        if let Some(cb) = &self.on_rate_limited {
            cb(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_estimates_at_least_one_token() {
        let estimate = estimate_request(&ChatRequest::default());
        assert_eq!(estimate.input_tokens, 1);
    }

    #[test]
    fn request_estimate_counts_all_blocks() {
        let request = ChatRequest {
            system: Some("s".repeat(40)),
            messages: vec![
                WireMessage::user("u".repeat(40)),
                WireMessage::assistant("a".repeat(40)),
            ],
            max_tokens: 512,
            ..Default::default()
        };
        let estimate = estimate_request(&request);
        assert_eq!(estimate.input_tokens, 30);
        assert_eq!(estimate.output_tokens, 512);
    }
}
