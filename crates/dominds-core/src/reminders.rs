use serde::{Deserialize, Serialize};

/// A note the agent keeps in front of itself across generations and courses.
///
/// `owner` names a capability that may rewrite or drop the reminder before
/// each generation; it is resolved by name when a dialog is restored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Reminder {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            owner: None,
            meta: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Render reminders as the block placed in front of the last user turn.
pub fn render_reminders(reminders: &[Reminder]) -> Option<String> {
    if reminders.is_empty() {
        return None;
    }
    let mut out = format!("You have {} reminder(s):\n", reminders.len());
    for (i, r) in reminders.iter().enumerate() {
        out.push_str(&format!("\n#{} {}\n", i + 1, r.content.trim_end()));
    }
    Some(out)
}
