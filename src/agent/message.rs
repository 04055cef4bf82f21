//! Transcript data model - messages, tool calls, and the transient
//! per-stream turn accumulator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::types::{StopReason, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolResult,
}

/// One transcript entry. Assistant messages are appended to incrementally
/// while streaming; the partial state is observable through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// For tool_result messages: the tool call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Deleted on next process start (demo notices and the like)
    #[serde(default)]
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("M-{}", Uuid::new_v4()),
            role,
            content: content.into(),
            tool_call_id: None,
            ephemeral: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::ToolResult, content)
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

/// A tool invocation emitted by the assistant. Owned by the turn that
/// emitted it; its lifetime ends when the continuation that consumed the
/// result completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments, reassembled from stream fragments
    pub arguments: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Parse the accumulated arguments; empty arguments parse as `{}`.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Transient accumulator for one provider stream
#[derive(Debug, Clone, Default)]
pub struct StreamingTurn {
    pub accumulated_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub is_done: bool,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<StopReason>,
    pub model: Option<String>,
}

impl StreamingTurn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|t| t.id == id)
    }

    /// Merge a usage event; providers report input tokens at message_start
    /// and output tokens at message_delta, so nonzero fields win.
    pub fn merge_usage(&mut self, usage: TokenUsage) {
        let merged = self.usage.get_or_insert_with(TokenUsage::default);
        if usage.input_tokens > 0 {
            merged.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            merged.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_tokens > 0 {
            merged.cache_read_tokens = usage.cache_read_tokens;
        }
        if usage.cache_creation_tokens > 0 {
            merged.cache_creation_tokens = usage.cache_creation_tokens;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::user("hi").role, Role::User);
        assert_eq!(ChatMessage::assistant("yo").role, Role::Assistant);
        assert_eq!(ChatMessage::system("note").role, Role::System);

        let result = ChatMessage::tool_result("tu_1", "sunny");
        assert_eq!(result.role, Role::ToolResult);
        assert_eq!(result.tool_call_id.as_deref(), Some("tu_1"));
    }

    #[test]
    fn ephemeral_builder_marks_message() {
        let msg = ChatMessage::system("demo mode").ephemeral();
        assert!(msg.ephemeral);
    }

    #[test]
    fn tool_call_arguments_parse() {
        let mut call = ToolCall::new("tu_1", "get_weather");
        call.arguments.push_str("{\"city\":");
        call.arguments.push_str("\"A\"}");
        let value = call.parsed_arguments().unwrap();
        assert_eq!(value["city"], "A");
    }

    #[test]
    fn empty_tool_call_arguments_parse_as_object() {
        let call = ToolCall::new("tu_1", "current_time");
        assert_eq!(call.parsed_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn merge_usage_keeps_nonzero_fields() {
        let mut turn = StreamingTurn::new();
        turn.merge_usage(TokenUsage {
            input_tokens: 12,
            ..Default::default()
        });
        turn.merge_usage(TokenUsage {
            output_tokens: 9,
            ..Default::default()
        });
        let usage = turn.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 9);
    }
}
