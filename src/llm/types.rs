use serde::{Deserialize, Serialize};

/// Request sent to the model provider
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier (e.g., "claude-sonnet-4-20250514")
    pub model: String,

    /// System prompt (positioned appropriately per provider)
    pub system: Option<String>,

    /// Conversation messages in wire form
    pub messages: Vec<WireMessage>,

    /// Available tools for this request
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            system: None,
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
        }
    }
}

/// A message in wire form. Providers only distinguish user and assistant
/// turns; tool results travel inside user messages.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: Vec<WireBlock>,
}

impl WireMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::User,
            content: vec![WireBlock::Text(text.into())],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::Assistant,
            content: vec![WireBlock::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    User,
    Assistant,
}

/// Content block within a wire message
#[derive(Debug, Clone)]
pub enum WireBlock {
    /// Plain text
    Text(String),

    /// Tool invocation emitted by the assistant
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool result carried back to the assistant
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for input parameters
    pub input_schema: serde_json::Value,
}

/// Typed event produced by the streaming parser
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Stream opened; model id if the provider reports one
    MessageStart { model: Option<String> },

    /// Text content delta for the assistant message
    TextDelta { text: String },

    /// A tool call began; arguments follow as fragments
    ToolCallStart { id: String, name: String },

    /// Partial JSON for a tool call's arguments, in order per id
    ToolCallArgDelta { id: String, fragment: String },

    /// The tool call's argument stream is complete
    ToolCallEnd { id: String },

    /// Token usage reported by the provider
    Usage(TokenUsage),

    /// Generation finished
    MessageStop { stop_reason: StopReason },

    /// Stream-level failure
    Error { kind: StreamErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of response
    EndTurn,
    /// Model requested tool execution
    ToolUse,
    /// Max tokens reached
    MaxTokens,
    /// Provider-side error terminated the message
    Error,
}

/// Realized token usage for one provider response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Stream ended without a message_stop
    Truncated,
    /// Network-level failure
    Transport,
    /// Provider sent something the parser could not understand
    Protocol,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorKind::Truncated => "truncated",
            StreamErrorKind::Transport => "transport",
            StreamErrorKind::Protocol => "protocol",
        }
    }
}

/// Errors raised while opening or reading a provider stream. Parse-level
/// problems surface as [`StreamEvent::Error`] instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
}

/// Pre-flight token estimate for a request, fed to the rate limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
