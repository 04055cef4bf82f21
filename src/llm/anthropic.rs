//! Anthropic provider - streaming Messages API client

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;

use super::client::{ModelClient, ProviderStream};
use super::types::{ChatRequest, StreamError, WireBlock, WireRole};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

pub struct AnthropicClient {
    api_key: String,
    http_client: Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http_client: Client::new(),
        }
    }

    fn build_request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    WireRole::User => "user",
                    WireRole::Assistant => "assistant",
                };

                let content: Vec<serde_json::Value> = m
                    .content
                    .iter()
                    .map(|block| match block {
                        WireBlock::Text(text) => json!({
                            "type": "text",
                            "text": text
                        }),
                        WireBlock::ToolUse { id, name, input } => json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": input
                        }),
                        WireBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                            "is_error": is_error
                        }),
                    })
                    .collect();

                json!({
                    "role": role,
                    "content": content
                })
            })
            .collect();

        let model = if request.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &request.model
        };

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        body
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ProviderStream, StreamError> {
        let body = self.build_request_body(request);

        let response = self
            .http_client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_error_response(status.as_u16(), &text));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Transport(e.to_string())));

        Ok(ProviderStream::new(byte_stream))
    }
}

fn parse_error_response(status: u16, body: &str) -> StreamError {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let message = json["error"]["message"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string();
        match json["error"]["type"].as_str().unwrap_or("") {
            "authentication_error" => StreamError::Auth(message),
            _ => StreamError::Provider { status, message },
        }
    } else {
        StreamError::Provider {
            status,
            message: body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::llm::types::{ToolDefinition, WireMessage};

    use super::*;

    #[test]
    fn request_body_carries_conversation_and_tools() {
        let client = AnthropicClient::new("test-key");
        let request = ChatRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            system: Some("be terse".to_string()),
            messages: vec![WireMessage::user("hi")],
            tools: vec![ToolDefinition {
                name: "get_weather".to_string(),
                description: "weather lookup".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            max_tokens: 1024,
        };

        let body = client.build_request_body(&request);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
        assert_eq!(body["tools"][0]["name"], "get_weather");
    }

    #[test]
    fn tool_blocks_serialize_to_wire_shapes() {
        let client = AnthropicClient::new("test-key");
        let request = ChatRequest {
            messages: vec![
                WireMessage {
                    role: WireRole::Assistant,
                    content: vec![WireBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "get_weather".to_string(),
                        input: serde_json::json!({"city": "A"}),
                    }],
                },
                WireMessage {
                    role: WireRole::User,
                    content: vec![WireBlock::ToolResult {
                        tool_use_id: "tu_1".to_string(),
                        content: "sunny".to_string(),
                        is_error: false,
                    }],
                },
            ],
            ..Default::default()
        };

        let body = client.build_request_body(&request);
        assert_eq!(body["messages"][0]["content"][0]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][1]["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn empty_model_falls_back_to_default() {
        let client = AnthropicClient::new("test-key");
        let body = client.build_request_body(&ChatRequest::default());
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[test]
    fn error_response_maps_auth_errors() {
        let err = parse_error_response(
            401,
            "{\"error\":{\"type\":\"authentication_error\",\"message\":\"bad key\"}}",
        );
        assert!(matches!(err, StreamError::Auth(m) if m == "bad key"));

        let err = parse_error_response(529, "{\"error\":{\"message\":\"overloaded\"}}");
        assert!(matches!(err, StreamError::Provider { status: 529, .. }));
    }
}
