//! Builds the request for one generation.

use std::sync::Arc;

use serde_json::json;

use dominds_core::generator::GenRequest;
use dominds_core::messages::{ChatMessage, PendingPrompt};
use dominds_core::reminders::render_reminders;
use dominds_core::tools::ToolDefinition;
use dominds_settings::TeammateSettings;

use crate::dialog::Dialog;
use crate::engine::Engine;
use crate::team::{
    CallPolicy, Team, ASK_HUMAN, FRESH_BOOTS_REASONING, TELLASK, TELLASK_BACK, TELLASK_SESSIONLESS,
};

const TELLASK_GUIDE: &str = "\
To address a teammate, write a call block: consecutive lines starting with `!?`.
The first line is `!?@<teammate> <headline>`; further `!?` lines form the body.
`!?@human` asks the human, `!?@self` starts a fresh-context reasoning pass of yourself.
Add `!tellaskSession <slug>` to the headline to continue an earlier conversation with that teammate.
Replies arrive as tellask results in a later turn.";

const TELLASK_BACK_GUIDE: &str =
    "`!?@tellasker` asks the dialog that assigned you this work.";

impl Engine {
    /// Assemble the context of the next generation. `internal` is a prompt
    /// that was not written to the transcript but must be seen this once.
    pub(crate) fn assemble_request(
        &self,
        dialog: &Arc<Dialog>,
        member: &TeammateSettings,
        policy: &CallPolicy,
        internal: Option<&PendingPrompt>,
    ) -> GenRequest {
        let mut messages = Vec::new();

        if !member.memories.is_empty() {
            let mut text = String::from("Your long-term memories:\n");
            for memory in &member.memories {
                text.push_str(&format!("\n- {}", memory.trim_end()));
            }
            messages.push(ChatMessage::Environment { content: text });
        }

        let task_doc = dialog
            .root()
            .and_then(|root| root.task_doc().map(str::to_string));
        if let Some(doc) = task_doc {
            messages.push(ChatMessage::Environment {
                content: format!("Task document:\n\n{doc}"),
            });
        }

        let course = dialog.current_course();
        if course > 1 {
            messages.push(ChatMessage::Environment {
                content: format!(
                    "This is course #{course} of this dialog. Earlier courses were closed; \
                     your reminders carry what still matters."
                ),
            });
        }

        messages.extend(dialog.messages().into_iter().filter(|m| !m.is_ui_only()));

        if let Some(prompt) = internal {
            messages.push(ChatMessage::prompting(prompt));
        }

        let mut transient = Vec::new();
        if let Some(text) = render_reminders(&dialog.reminders()) {
            transient.push(ChatMessage::Environment { content: text });
        }
        transient.push(ChatMessage::Environment {
            content: format!(
                "Work language: {}. Reply in this language unless asked otherwise.",
                self.config.driver.work_language
            ),
        });
        insert_before_last_user_turn(&mut messages, transient);

        GenRequest {
            dialog_id: dialog.id().clone(),
            agent_id: member.id.clone(),
            provider: member.provider.clone(),
            model: member.model.clone(),
            system_prompt: system_prompt(member, &self.team, policy, dialog.is_root()),
            tools: self.projected_tools(policy, dialog.is_root()),
            messages,
        }
    }

    fn projected_tools(&self, policy: &CallPolicy, is_root: bool) -> Vec<ToolDefinition> {
        let mut tools = self.tools.definitions_for(&policy.tools);
        if policy.tellask {
            tools.extend(special_call_definitions(is_root));
        }
        tools
    }
}

/// Put `extra` right in front of the last user-turn message, or at the end
/// if there is none.
pub(crate) fn insert_before_last_user_turn(messages: &mut Vec<ChatMessage>, extra: Vec<ChatMessage>) {
    let at = messages
        .iter()
        .rposition(ChatMessage::is_user_turn)
        .unwrap_or(messages.len());
    messages.splice(at..at, extra);
}

fn system_prompt(member: &TeammateSettings, team: &Team, policy: &CallPolicy, is_root: bool) -> String {
    let mut out = String::new();
    if member.persona.trim().is_empty() {
        out.push_str(&format!("You are @{}.", member.id));
    } else {
        out.push_str(member.persona.trim_end());
    }

    if policy.fresh_boots {
        out.push_str(
            "\n\nThis is a fresh-context reasoning pass: think the question through \
             and answer directly. You cannot call tools or teammates here.",
        );
        return out;
    }

    if policy.tellask {
        out.push_str("\n\n## Team\n");
        for m in team.members().filter(|m| m.id != member.id) {
            out.push_str(&format!("\n- @{} ({})", m.id, m.name));
        }
        out.push_str("\n\n## Tellask\n\n");
        out.push_str(TELLASK_GUIDE);
        if !is_root {
            out.push('\n');
            out.push_str(TELLASK_BACK_GUIDE);
        }
    }
    out
}

fn special_call_definitions(is_root: bool) -> Vec<ToolDefinition> {
    let targeted = |name: &str, description: &str, session: bool| {
        let mut required = vec!["target", "headline"];
        if session {
            required.push("session");
        }
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters_schema: json!({
                "type": "object",
                "required": required,
                "properties": {
                    "target": { "type": "string" },
                    "headline": { "type": "string" },
                    "body": { "type": "string" },
                    "session": { "type": "string" }
                }
            }),
        }
    };
    let untargeted = |name: &str, description: &str| ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters_schema: json!({
            "type": "object",
            "required": ["headline"],
            "properties": {
                "headline": { "type": "string" },
                "body": { "type": "string" }
            }
        }),
    };

    let mut defs = vec![
        targeted(TELLASK, "Ask a teammate within a resumable session", true),
        targeted(TELLASK_SESSIONLESS, "Ask a teammate in a one-off subdialog", false),
        untargeted(ASK_HUMAN, "Ask the human a question and wait for the answer"),
        untargeted(FRESH_BOOTS_REASONING, "Think a question through in a fresh context"),
    ];
    if !is_root {
        defs.push(untargeted(TELLASK_BACK, "Ask the dialog that assigned you this work"));
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(text: &str) -> ChatMessage {
        ChatMessage::Environment { content: text.into() }
    }

    #[test]
    fn transient_goes_before_last_user_turn() {
        let mut messages = vec![
            ChatMessage::prompting(&PendingPrompt::human("q")),
            ChatMessage::Saying { genseq: 1, content: "a".into() },
            ChatMessage::FuncResult {
                id: "c".into(),
                name: "t".into(),
                content: "r".into(),
                content_items: Vec::new(),
                is_error: false,
            },
            ChatMessage::Thinking { genseq: 2, content: "hm".into() },
        ];
        insert_before_last_user_turn(&mut messages, vec![env("reminders")]);
        assert_eq!(messages[2], env("reminders"));
        assert_eq!(messages[3].message_type(), "func_result");
    }

    #[test]
    fn transient_appended_without_user_turn() {
        let mut messages = vec![ChatMessage::Saying { genseq: 1, content: "a".into() }];
        insert_before_last_user_turn(&mut messages, vec![env("x")]);
        assert_eq!(messages.last(), Some(&env("x")));
    }

    #[test]
    fn special_definitions_depend_on_root() {
        let names = |defs: Vec<ToolDefinition>| defs.into_iter().map(|d| d.name).collect::<Vec<_>>();
        assert!(!names(special_call_definitions(true)).contains(&TELLASK_BACK.to_string()));
        assert!(names(special_call_definitions(false)).contains(&TELLASK_BACK.to_string()));
    }

    #[test]
    fn fresh_boots_prompt_has_no_team() {
        let member = TeammateSettings::new("pangu");
        let team = Team::from_settings(&dominds_settings::TeamSettings {
            members: vec![member.clone(), TeammateSettings::new("lead")],
            default_responder: None,
        })
        .unwrap();
        let fbr = CallPolicy {
            tools: Vec::new(),
            tellask: false,
            fresh_boots: true,
        };
        let text = system_prompt(&member, &team, &fbr, false);
        assert!(text.starts_with("You are @pangu."));
        assert!(!text.contains("## Team"));

        let full = CallPolicy::for_dialog(&member, None);
        let text = system_prompt(&member, &team, &full, false);
        assert!(text.contains("- @lead (lead)"));
        assert!(text.contains("@tellasker"));
    }
}
