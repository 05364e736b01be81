use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GeneratorError;
use crate::health::UsageSnapshot;
use crate::ids::DialogId;
use crate::messages::ChatMessage;
use crate::stream::GenEvent;
use crate::tools::ToolDefinition;

/// Everything a generator needs for one generation.
#[derive(Clone, Debug)]
pub struct GenRequest {
    pub dialog_id: DialogId,
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<ChatMessage>,
}

impl GenRequest {
    /// Text of the last user-turn message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            ChatMessage::Prompting { content, .. }
            | ChatMessage::Environment { content }
            | ChatMessage::FuncResult { content, .. }
            | ChatMessage::TellaskResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// One message produced by a non-streaming generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchItem {
    Thinking { content: String },
    Saying { content: String },
    FuncCall { id: String, name: String, arguments: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub items: Vec<BatchItem>,
    pub usage: Option<UsageSnapshot>,
}

pub type GenStream = Pin<Box<dyn Stream<Item = GenEvent> + Send>>;

/// An external model backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streaming generation. Errors returned here happen before any
    /// content; errors inside the stream arrive as [`GenEvent::Error`].
    async fn stream(&self, request: &GenRequest) -> Result<GenStream, GeneratorError>;

    /// Produce the whole generation at once.
    async fn generate(&self, request: &GenRequest) -> Result<BatchOutput, GeneratorError>;
}
