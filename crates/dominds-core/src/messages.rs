use serde::{Deserialize, Serialize};

use crate::ids::{DialogId, MessageId};
use crate::tools::ContentItem;

/// Whether a prompt is shown to the model as authored text or as an
/// internal nudge that never lands in the durable transcript.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVisibility {
    #[default]
    Markdown,
    Internal,
}

/// Where a queued prompt came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptOrigin {
    #[default]
    Human,
    Diligence,
    ContextHealth,
    NewCourse,
    Assignment,
    /// A subdialog asking back; answered even while the asker is pending.
    TellaskBack,
    Q4hAnswer,
}

/// A prompt waiting to start the next generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub msg_id: MessageId,
    pub content: String,
    pub visibility: PromptVisibility,
    pub origin: PromptOrigin,
}

impl PendingPrompt {
    pub fn human(content: impl Into<String>) -> Self {
        Self::with_origin(content, PromptOrigin::Human)
    }

    pub fn with_origin(content: impl Into<String>, origin: PromptOrigin) -> Self {
        Self {
            msg_id: MessageId::new(),
            content: content.into(),
            visibility: PromptVisibility::Markdown,
            origin,
        }
    }

    pub fn internal(content: impl Into<String>, origin: PromptOrigin) -> Self {
        Self {
            msg_id: MessageId::new(),
            content: content.into(),
            visibility: PromptVisibility::Internal,
            origin,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.visibility == PromptVisibility::Internal
    }
}

/// Outcome attached to a teammate response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Failed,
}

/// One entry of a dialog's in-course transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessage {
    /// A human (or queued) prompt rendered as a user turn.
    Prompting {
        msg_id: MessageId,
        content: String,
        origin: PromptOrigin,
    },
    Thinking {
        genseq: u32,
        content: String,
    },
    Saying {
        genseq: u32,
        content: String,
    },
    FuncCall {
        genseq: u32,
        id: String,
        name: String,
        arguments: String,
    },
    FuncResult {
        id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content_items: Vec<ContentItem>,
        is_error: bool,
    },
    /// A teammate's reply, correlated with the call site that asked for it.
    TellaskResult {
        call_id: String,
        responder_id: String,
        from_dialog: DialogId,
        tellask_head: String,
        content: String,
        status: ResponseStatus,
    },
    /// Context injected by the runtime (course prefixes, answers routed back).
    Environment {
        content: String,
    },
    /// Shown to the operator only, never sent to the model.
    UiOnlyMarkdown {
        content: String,
    },
}

impl ChatMessage {
    pub fn prompting(prompt: &PendingPrompt) -> Self {
        Self::Prompting {
            msg_id: prompt.msg_id.clone(),
            content: prompt.content.clone(),
            origin: prompt.origin,
        }
    }

    pub fn is_ui_only(&self) -> bool {
        matches!(self, Self::UiOnlyMarkdown { .. })
    }

    /// Messages that read as "the other side is talking" to the model.
    pub fn is_user_turn(&self) -> bool {
        matches!(
            self,
            Self::Prompting { .. }
                | Self::FuncResult { .. }
                | Self::TellaskResult { .. }
                | Self::Environment { .. }
        )
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Prompting { .. } => "prompting",
            Self::Thinking { .. } => "thinking",
            Self::Saying { .. } => "saying",
            Self::FuncCall { .. } => "func_call",
            Self::FuncResult { .. } => "func_result",
            Self::TellaskResult { .. } => "tellask_result",
            Self::Environment { .. } => "environment",
            Self::UiOnlyMarkdown { .. } => "ui_only_markdown",
        }
    }
}
