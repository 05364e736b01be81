use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// One agent on the team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeammateSettings {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub provider: String,
    pub model: String,
    /// Model context window in tokens. Zero means unknown.
    pub context_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_max_tokens: Option<u64>,
    /// Names of ordinary tools this agent may call.
    pub tools: Vec<String>,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diligence_push_max: Option<u32>,
    /// Whether this agent may address teammates.
    pub tellask: bool,
    /// Long-term notes placed at the top of every context.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<String>,
}

impl Default for TeammateSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            persona: String::new(),
            provider: "mock".to_string(),
            model: "mock-model".to_string(),
            context_length: 200_000,
            optimal_max_tokens: None,
            tools: Vec::new(),
            streaming: true,
            diligence_push_max: None,
            tellask: true,
            memories: Vec::new(),
        }
    }
}

impl TeammateSettings {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamSettings {
    pub members: Vec<TeammateSettings>,
    /// Agent that answers a root dialog when none is named.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_responder: Option<String>,
}

impl TeamSettings {
    pub fn member(&self, id: &str) -> Option<&TeammateSettings> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Rejects duplicate ids and a default responder that is not a member.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for m in &self.members {
            if m.id.is_empty() {
                return Err(SettingsError::InvalidValue("teammate with empty id".into()));
            }
            if !seen.insert(m.id.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "duplicate teammate id '{}'",
                    m.id
                )));
            }
        }
        if let Some(default) = &self.default_responder {
            if self.member(default).is_none() {
                return Err(SettingsError::InvalidValue(format!(
                    "default responder '{default}' is not a team member"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_member_fills_defaults() {
        let m: TeammateSettings = serde_json::from_str(r#"{"id": "pangu", "tools": ["add_reminder"]}"#).unwrap();
        assert_eq!(m.id, "pangu");
        assert!(m.streaming);
        assert!(m.tellask);
        assert_eq!(m.context_length, 200_000);
        assert_eq!(m.tools, vec!["add_reminder".to_string()]);
    }

    #[test]
    fn validate_rejects_duplicates() {
        let team = TeamSettings {
            members: vec![TeammateSettings::new("a"), TeammateSettings::new("a")],
            default_responder: None,
        };
        assert!(matches!(team.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_unknown_default() {
        let team = TeamSettings {
            members: vec![TeammateSettings::new("a")],
            default_responder: Some("b".into()),
        };
        assert!(team.validate().is_err());
        let ok = TeamSettings {
            members: vec![TeammateSettings::new("a")],
            default_responder: Some("a".into()),
        };
        assert!(ok.validate().is_ok());
    }
}
