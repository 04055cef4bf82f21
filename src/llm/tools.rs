//! Tool execution - the executor interface and the built-in demo tools

use serde_json::json;

use super::types::ToolDefinition;
use crate::agent::message::ToolCall;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// Executes tool calls on behalf of the agent loop. Synchronous from the
/// loop's perspective; implementations should be idempotent enough that
/// re-running identical arguments produces acceptable results.
pub trait ToolExecutor: Send + Sync {
    /// Tool definitions to advertise to the model
    fn definitions(&self) -> Vec<ToolDefinition>;

    fn run(&self, call: &ToolCall) -> Result<String, ToolError>;
}

/// Cap on file bytes returned by `read_file`
const READ_FILE_MAX_BYTES: u64 = 64 * 1024;

/// Ships a small set of safe local tools
pub struct BuiltinToolExecutor;

impl BuiltinToolExecutor {
    pub fn new() -> Self {
        Self
    }

    fn current_time(&self) -> String {
        chrono::Local::now().to_rfc3339()
    }

    fn read_file(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing \"path\"".to_string()))?;

        let metadata = std::fs::metadata(path)
            .map_err(|e| ToolError::ExecutionFailed(format!("{path}: {e}")))?;
        if metadata.len() > READ_FILE_MAX_BYTES {
            return Err(ToolError::ExecutionFailed(format!(
                "{path}: file exceeds {READ_FILE_MAX_BYTES} bytes"
            )));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ToolError::ExecutionFailed(format!("{path}: {e}")))
    }
}

impl Default for BuiltinToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor for BuiltinToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "current_time".to_string(),
                description: "Get the current local date and time".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            },
            ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a small UTF-8 text file from the local filesystem".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Path to the file"}
                    },
                    "required": ["path"]
                }),
            },
        ]
    }

    fn run(&self, call: &ToolCall) -> Result<String, ToolError> {
        let args = call
            .parsed_arguments()
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        match call.name.as_str() {
            "current_time" => Ok(self.current_time()),
            "read_file" => self.read_file(&args),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            arguments: arguments.to_string(),
            ..ToolCall::new("tu_test", name)
        }
    }

    #[test]
    fn current_time_returns_rfc3339() {
        let executor = BuiltinToolExecutor::new();
        let out = executor.run(&call("current_time", "{}")).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[test]
    fn read_file_returns_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hello tools").unwrap();

        let executor = BuiltinToolExecutor::new();
        let args = format!("{{\"path\":\"{}\"}}", file.path().display());
        let out = executor.run(&call("read_file", &args)).unwrap();
        assert_eq!(out.trim(), "hello tools");
    }

    #[test]
    fn read_file_requires_path() {
        let executor = BuiltinToolExecutor::new();
        let err = executor.run(&call("read_file", "{}")).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let executor = BuiltinToolExecutor::new();
        let err = executor.run(&call("launch_rockets", "{}")).unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[test]
    fn definitions_cover_every_tool() {
        let executor = BuiltinToolExecutor::new();
        let names: Vec<_> = executor
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["current_time", "read_file"]);
    }
}
