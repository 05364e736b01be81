use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use dominds_core::messages::{PendingPrompt, PromptOrigin};
use dominds_core::reminders::Reminder;
use dominds_core::tools::{ToolError, ToolOutput};

use super::{Tool, ToolContext};
use crate::dialog::Dialog;

const CARRY_OVER: &str = "You cleared your mind and started a new course. \
Your reminders carried over; use them to pick the work back up.";

/// Asks for the next course. The driver switches once every call of the
/// generation has its result. An optional note is kept as a reminder so it
/// survives the reset.
pub struct ClearMindTool;

#[async_trait]
impl Tool for ClearMindTool {
    fn name(&self) -> &str {
        "clear_mind"
    }

    fn description(&self) -> &str {
        "Start a new course with a clean history, keeping reminders. \
         Put anything you must not forget in 'reminder'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reminder": { "type": "string" }
            }
        })
    }

    async fn call(&self, dialog: &Arc<Dialog>, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        if let Some(note) = args.get("reminder").and_then(Value::as_str) {
            if !note.trim().is_empty() {
                dialog.add_reminder(Reminder::new(note), None);
            }
        }
        dialog.request_new_course(PendingPrompt::with_origin(CARRY_OVER, PromptOrigin::NewCourse));
        Ok(ToolOutput::text(format!(
            "Mind cleared, course {} starts next",
            dialog.current_course() + 1
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::test_support::{env, persisted_root};
    use crate::tools::test_support::ctx;
    use dominds_core::messages::ChatMessage;

    #[tokio::test]
    async fn requests_course_and_keeps_note() {
        let env = env();
        let dlg = persisted_root(&env, "r", "lead");
        dlg.append_message(ChatMessage::Environment { content: "old".into() })
            .unwrap();

        let out = ClearMindTool
            .call(&dlg, &ctx(), json!({"reminder": "ship the parser"}))
            .await
            .unwrap();
        assert_eq!(out.content, "Mind cleared, course 2 starts next");
        assert_eq!(dlg.current_course(), 1);
        assert_eq!(dlg.messages().len(), 1);
        assert_eq!(dlg.reminders()[0].content, "ship the parser");
        let request = dlg.take_course_request().unwrap();
        assert_eq!(request.origin, PromptOrigin::NewCourse);
    }

    #[tokio::test]
    async fn blank_note_is_ignored() {
        let env = env();
        let dlg = persisted_root(&env, "r", "lead");
        ClearMindTool.call(&dlg, &ctx(), json!({"reminder": "  "})).await.unwrap();
        assert!(dlg.reminders().is_empty());
        assert!(dlg.take_course_request().is_some());
    }
}
