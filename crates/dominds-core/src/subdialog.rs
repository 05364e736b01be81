use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DialogId, QuestionId};
use crate::messages::ResponseStatus;

/// How a subdialog (or a pending request) was called into existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Resumable, keyed by `agentId!tellaskSession`.
    Tellask,
    TellaskSessionless,
    /// A subdialog asking the dialog that called it.
    TellaskBack,
    /// Same agent, fresh context, no tools and no tellask.
    FreshBootsReasoning,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tellask => "tellask",
            Self::TellaskSessionless => "tellask_sessionless",
            Self::TellaskBack => "tellask_back",
            Self::FreshBootsReasoning => "fresh_boots_reasoning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tellask" => Some(Self::Tellask),
            "tellask_sessionless" => Some(Self::TellaskSessionless),
            "tellask_back" => Some(Self::TellaskBack),
            "fresh_boots_reasoning" => Some(Self::FreshBootsReasoning),
            _ => None,
        }
    }
}

/// Who asked a subdialog to do what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentFromSup {
    pub caller_dialog_id: DialogId,
    pub caller_agent_id: String,
    pub call_id: String,
    pub call_type: CallType,
    pub tellask_head: String,
    pub tellask_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tellask_session: Option<String>,
}

impl AssignmentFromSup {
    /// The assignment as the subdialog's first prompt.
    pub fn render(&self) -> String {
        let mut out = format!(
            "@{} asks you:\n\n{}",
            self.caller_agent_id,
            self.tellask_head.trim()
        );
        if !self.tellask_body.trim().is_empty() {
            out.push_str("\n\n");
            out.push_str(self.tellask_body.trim());
        }
        out
    }
}

/// A call that created (or targeted) a dialog that has not answered yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSubdialog {
    pub subdialog_id: String,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub tellask_head: String,
    pub target_agent_id: String,
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tellask_session: Option<String>,
}

/// A finished subdialog's answer, waiting to be consumed by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubdialogResponse {
    pub subdialog_id: String,
    pub call_id: String,
    pub responder_id: String,
    pub tellask_head: String,
    pub response: String,
    pub status: ResponseStatus,
    pub completed_at: DateTime<Utc>,
}

impl SubdialogResponse {
    /// The response as the caller's model sees it.
    pub fn format_for_caller(&self) -> String {
        let verb = match self.status {
            ResponseStatus::Completed => "responded",
            ResponseStatus::Failed => "failed to respond",
        };
        format!(
            "@{} {verb} to your tellask `{}`:\n\n{}",
            self.responder_id,
            self.tellask_head.trim(),
            self.response
        )
    }
}

/// A question for the human.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanQuestion {
    pub id: QuestionId,
    pub dialog_id: DialogId,
    pub call_id: String,
    pub headline: String,
    pub body: String,
    pub asked_at: DateTime<Utc>,
}
