pub mod clear_mind;
pub mod reminders;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dominds_core::tools::{ToolDefinition, ToolError, ToolOutput};

use crate::dialog::Dialog;
use crate::registry::{ToolRegistry, ToolSource};

/// Per-call context handed to a tool.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub agent_id: String,
    pub call_id: String,
    pub cancel: CancellationToken,
    pub work_language: String,
}

/// An ordinary function tool an agent may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }

    async fn call(
        &self,
        dialog: &Arc<Dialog>,
        ctx: &ToolContext,
        args: Value,
    ) -> Result<ToolOutput, ToolError>;
}

/// Check `args` against a JSON schema, collecting every violation.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| ToolError::InvalidArguments(format!("bad schema: {e}")))?;
    let result = compiled.validate(args);
    if let Err(errors) = result {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(ToolError::InvalidArguments(messages.join("; ")));
    }
    Ok(())
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}'")))
}

/// 1-based reminder number to index.
pub(crate) fn reminder_index(args: &Value) -> Result<usize, ToolError> {
    match args.get("reminder_no").and_then(Value::as_u64) {
        Some(n) if n >= 1 => Ok((n - 1) as usize),
        _ => Err(ToolError::InvalidArguments(
            "'reminder_no' must be a positive integer".into(),
        )),
    }
}

/// Registry with the built-in reminder and course tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(reminders::AddReminderTool), ToolSource::BuiltIn);
    registry.register(Arc::new(reminders::UpdateReminderTool), ToolSource::BuiltIn);
    registry.register(Arc::new(reminders::DeleteReminderTool), ToolSource::BuiltIn);

    registry.register(Arc::new(clear_mind::ClearMindTool), ToolSource::BuiltIn);

    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn ctx() -> ToolContext {
        ToolContext {
            agent_id: "lead".into(),
            call_id: "call-1".into(),
            cancel: CancellationToken::new(),
            work_language: "en".into(),
        }
    }
}
