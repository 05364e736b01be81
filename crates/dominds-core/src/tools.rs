use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tool definition sent to the generator as part of the projected tool list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Structured piece of a tool result beyond the plain text content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    Image { mime_type: String, data: String },
}

/// What a tool call hands back to the transcript.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_items: Vec<ContentItem>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_items: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("tool panicked")]
    Panicked,
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Text recorded in the transcript in place of the tool's output.
    pub fn to_result_content(&self) -> String {
        format!("[error] {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_item_tagged() {
        let item = ContentItem::Text { text: "hi".into() };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "text");
    }

    #[test]
    fn error_result_content_prefixed() {
        let err = ToolError::InvalidArguments("missing content".into());
        assert_eq!(
            err.to_result_content(),
            "[error] invalid arguments: missing content"
        );
    }

    #[test]
    fn text_output_has_no_items() {
        let out = ToolOutput::text("done");
        assert_eq!(out.content, "done");
        assert!(out.content_items.is_empty());
    }
}
