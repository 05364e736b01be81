use serde::{Deserialize, Serialize};

use crate::health::ContextHealthSnapshot;
use crate::ids::{DialogId, MessageId, QuestionId};
use crate::messages::{PromptOrigin, ResponseStatus};
use crate::reminders::Reminder;
use crate::run_state::{DialogRunState, InterruptReason};
use crate::subdialog::{CallType, HumanQuestion};
use crate::tellask::TellaskValidation;

/// Marker broadcast when a run is stopped or picked back up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStateMarker {
    Interrupted { reason: InterruptReason },
    Resumed,
}

/// Events broadcast to whoever renders dialogs (UI transport, tests).
///
/// Within one generation the order is: GeneratingStart, then stream phases
/// (thinking / markdown / tellask call / func call), then GeneratingFinish.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialogEvent {
    GeneratingStart {
        dialog_id: DialogId,
        course: u32,
        genseq: u32,
    },
    GeneratingFinish {
        dialog_id: DialogId,
        course: u32,
        genseq: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_health: Option<ContextHealthSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    ThinkingStart {
        dialog_id: DialogId,
        genseq: u32,
    },
    ThinkingChunk {
        dialog_id: DialogId,
        genseq: u32,
        chunk: String,
    },
    ThinkingFinish {
        dialog_id: DialogId,
        genseq: u32,
    },

    SayingStart {
        dialog_id: DialogId,
        genseq: u32,
    },
    SayingFinish {
        dialog_id: DialogId,
        genseq: u32,
    },
    MarkdownStart {
        dialog_id: DialogId,
        genseq: u32,
    },
    MarkdownChunk {
        dialog_id: DialogId,
        genseq: u32,
        chunk: String,
    },
    MarkdownFinish {
        dialog_id: DialogId,
        genseq: u32,
    },

    TellaskCallStart {
        dialog_id: DialogId,
        genseq: u32,
        validation: TellaskValidation,
    },
    TellaskHeadlineChunk {
        dialog_id: DialogId,
        genseq: u32,
        chunk: String,
    },
    TellaskHeadlineFinish {
        dialog_id: DialogId,
        genseq: u32,
    },
    TellaskBodyStart {
        dialog_id: DialogId,
        genseq: u32,
    },
    TellaskBodyChunk {
        dialog_id: DialogId,
        genseq: u32,
        chunk: String,
    },
    TellaskBodyFinish {
        dialog_id: DialogId,
        genseq: u32,
    },
    TellaskCallFinish {
        dialog_id: DialogId,
        genseq: u32,
        call_id: String,
    },

    FuncCallRequested {
        dialog_id: DialogId,
        genseq: u32,
        call_id: String,
        name: String,
        arguments: String,
    },
    FuncCallResult {
        dialog_id: DialogId,
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },

    /// A prompt became the current user turn.
    UserTurn {
        dialog_id: DialogId,
        course: u32,
        msg_id: MessageId,
        content: String,
        origin: PromptOrigin,
    },
    CourseStarted {
        dialog_id: DialogId,
        course: u32,
    },

    SubdialogCreated {
        dialog_id: DialogId,
        subdialog_id: DialogId,
        target_agent_id: String,
        tellask_head: String,
        call_id: String,
        call_type: CallType,
    },
    TeammateResponse {
        dialog_id: DialogId,
        subdialog_id: String,
        responder_id: String,
        call_id: String,
        response: String,
        status: ResponseStatus,
    },
    /// A subdialog's caller could not be found; the root stood in for it.
    SupdialogFallback {
        dialog_id: DialogId,
        caller_dialog_id: DialogId,
    },

    RunState {
        dialog_id: DialogId,
        state: DialogRunState,
    },
    RunStateMarker {
        dialog_id: DialogId,
        marker: RunStateMarker,
    },
    RemindersUpdated {
        dialog_id: DialogId,
        version: u64,
        reminders: Vec<Reminder>,
    },
    Q4hAsked {
        dialog_id: DialogId,
        question: HumanQuestion,
    },
    Q4hAnswered {
        dialog_id: DialogId,
        question_id: QuestionId,
    },

    PolicyViolation {
        dialog_id: DialogId,
        detail: String,
    },
    StreamError {
        dialog_id: DialogId,
        detail: String,
    },
}

impl DialogEvent {
    pub fn dialog_id(&self) -> &DialogId {
        match self {
            Self::GeneratingStart { dialog_id, .. }
            | Self::GeneratingFinish { dialog_id, .. }
            | Self::ThinkingStart { dialog_id, .. }
            | Self::ThinkingChunk { dialog_id, .. }
            | Self::ThinkingFinish { dialog_id, .. }
            | Self::SayingStart { dialog_id, .. }
            | Self::SayingFinish { dialog_id, .. }
            | Self::MarkdownStart { dialog_id, .. }
            | Self::MarkdownChunk { dialog_id, .. }
            | Self::MarkdownFinish { dialog_id, .. }
            | Self::TellaskCallStart { dialog_id, .. }
            | Self::TellaskHeadlineChunk { dialog_id, .. }
            | Self::TellaskHeadlineFinish { dialog_id, .. }
            | Self::TellaskBodyStart { dialog_id, .. }
            | Self::TellaskBodyChunk { dialog_id, .. }
            | Self::TellaskBodyFinish { dialog_id, .. }
            | Self::TellaskCallFinish { dialog_id, .. }
            | Self::FuncCallRequested { dialog_id, .. }
            | Self::FuncCallResult { dialog_id, .. }
            | Self::UserTurn { dialog_id, .. }
            | Self::CourseStarted { dialog_id, .. }
            | Self::SubdialogCreated { dialog_id, .. }
            | Self::TeammateResponse { dialog_id, .. }
            | Self::SupdialogFallback { dialog_id, .. }
            | Self::RunState { dialog_id, .. }
            | Self::RunStateMarker { dialog_id, .. }
            | Self::RemindersUpdated { dialog_id, .. }
            | Self::Q4hAsked { dialog_id, .. }
            | Self::Q4hAnswered { dialog_id, .. }
            | Self::PolicyViolation { dialog_id, .. }
            | Self::StreamError { dialog_id, .. } => dialog_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GeneratingStart { .. } => "generating_start",
            Self::GeneratingFinish { .. } => "generating_finish",
            Self::ThinkingStart { .. } => "thinking_start",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::ThinkingFinish { .. } => "thinking_finish",
            Self::SayingStart { .. } => "saying_start",
            Self::SayingFinish { .. } => "saying_finish",
            Self::MarkdownStart { .. } => "markdown_start",
            Self::MarkdownChunk { .. } => "markdown_chunk",
            Self::MarkdownFinish { .. } => "markdown_finish",
            Self::TellaskCallStart { .. } => "tellask_call_start",
            Self::TellaskHeadlineChunk { .. } => "tellask_headline_chunk",
            Self::TellaskHeadlineFinish { .. } => "tellask_headline_finish",
            Self::TellaskBodyStart { .. } => "tellask_body_start",
            Self::TellaskBodyChunk { .. } => "tellask_body_chunk",
            Self::TellaskBodyFinish { .. } => "tellask_body_finish",
            Self::TellaskCallFinish { .. } => "tellask_call_finish",
            Self::FuncCallRequested { .. } => "func_call_requested",
            Self::FuncCallResult { .. } => "func_call_result",
            Self::UserTurn { .. } => "user_turn",
            Self::CourseStarted { .. } => "course_started",
            Self::SubdialogCreated { .. } => "subdialog_created",
            Self::TeammateResponse { .. } => "teammate_response",
            Self::SupdialogFallback { .. } => "supdialog_fallback",
            Self::RunState { .. } => "run_state",
            Self::RunStateMarker { .. } => "run_state_marker",
            Self::RemindersUpdated { .. } => "reminders_updated",
            Self::Q4hAsked { .. } => "q4h_asked",
            Self::Q4hAnswered { .. } => "q4h_answered",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::StreamError { .. } => "stream_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tag_matches_event_type() {
        let events = [
            DialogEvent::GeneratingStart {
                dialog_id: DialogId::root("r"),
                course: 1,
                genseq: 1,
            },
            DialogEvent::RunStateMarker {
                dialog_id: DialogId::root("r"),
                marker: RunStateMarker::Interrupted {
                    reason: InterruptReason::UserStop,
                },
            },
            DialogEvent::SupdialogFallback {
                dialog_id: DialogId::sub("r", "s"),
                caller_dialog_id: DialogId::sub("r", "gone"),
            },
        ];
        for ev in events {
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["type"], ev.event_type());
        }
    }

    #[test]
    fn dialog_id_accessor() {
        let id = DialogId::sub("r", "s");
        let ev = DialogEvent::StreamError {
            dialog_id: id.clone(),
            detail: "x".into(),
        };
        assert_eq!(ev.dialog_id(), &id);
    }
}
