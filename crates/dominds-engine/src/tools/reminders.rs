use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use dominds_core::reminders::Reminder;
use dominds_core::tools::{ToolError, ToolOutput};

use super::{reminder_index, required_str, Tool, ToolContext};
use crate::dialog::Dialog;
use crate::error::EngineError;

fn index_error(e: EngineError) -> ToolError {
    match e {
        EngineError::ReminderIndex { .. } => ToolError::InvalidArguments(e.to_string()),
        other => ToolError::ExecutionFailed(other.to_string()),
    }
}

/// Adds a reminder the agent sees before every generation.
pub struct AddReminderTool;

#[async_trait]
impl Tool for AddReminderTool {
    fn name(&self) -> &str {
        "add_reminder"
    }

    fn description(&self) -> &str {
        "Add a reminder that stays in front of you across generations and courses"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": { "type": "string", "minLength": 1 },
                "position": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "1-based position; appends when omitted"
                }
            }
        })
    }

    async fn call(&self, dialog: &Arc<Dialog>, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let content = required_str(&args, "content")?;
        let position = args
            .get("position")
            .and_then(Value::as_u64)
            .map(|p| p.saturating_sub(1) as usize);
        dialog.add_reminder(Reminder::new(content), position);
        let total = dialog.reminders().len();
        Ok(ToolOutput::text(format!("Reminder added ({total} total)")))
    }
}

pub struct UpdateReminderTool;

#[async_trait]
impl Tool for UpdateReminderTool {
    fn name(&self) -> &str {
        "update_reminder"
    }

    fn description(&self) -> &str {
        "Replace the content of reminder #reminder_no"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["reminder_no", "content"],
            "properties": {
                "reminder_no": { "type": "integer", "minimum": 1 },
                "content": { "type": "string", "minLength": 1 }
            }
        })
    }

    async fn call(&self, dialog: &Arc<Dialog>, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let index = reminder_index(&args)?;
        let content = required_str(&args, "content")?;
        dialog.update_reminder(index, content).map_err(index_error)?;
        Ok(ToolOutput::text(format!("Reminder #{} updated", index + 1)))
    }
}

pub struct DeleteReminderTool;

#[async_trait]
impl Tool for DeleteReminderTool {
    fn name(&self) -> &str {
        "delete_reminder"
    }

    fn description(&self) -> &str {
        "Delete reminder #reminder_no"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["reminder_no"],
            "properties": {
                "reminder_no": { "type": "integer", "minimum": 1 }
            }
        })
    }

    async fn call(&self, dialog: &Arc<Dialog>, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let index = reminder_index(&args)?;
        dialog.delete_reminder(index).map_err(index_error)?;
        let left = dialog.reminders().len();
        Ok(ToolOutput::text(format!("Reminder #{} deleted ({left} left)", index + 1)))
    }
}
