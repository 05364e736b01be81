//! Team roster and the per-dialog call policy derived from it.

use std::collections::HashMap;

use dominds_core::health::ContextLimits;
use dominds_core::subdialog::CallType;
use dominds_settings::{ContextHealthSettings, TeamSettings, TeammateSettings};

use crate::error::EngineError;

/// Names the model uses for tellask-special calls. They are routed by the
/// driver and never reach the tool registry.
pub const TELLASK: &str = "tellask";
pub const TELLASK_SESSIONLESS: &str = "tellaskSessionless";
pub const TELLASK_BACK: &str = "tellaskBack";
pub const ASK_HUMAN: &str = "askHuman";
pub const FRESH_BOOTS_REASONING: &str = "freshBootsReasoning";

pub const SPECIAL_CALLS: [&str; 5] = [
    TELLASK,
    TELLASK_SESSIONLESS,
    TELLASK_BACK,
    ASK_HUMAN,
    FRESH_BOOTS_REASONING,
];

pub fn is_special_call(name: &str) -> bool {
    SPECIAL_CALLS.contains(&name)
}

/// Reserved mentions in text tellasks.
pub const MENTION_HUMAN: &str = "human";
pub const MENTION_SELF: &str = "self";
pub const MENTION_TELLASKER: &str = "tellasker";

#[derive(Clone, Debug)]
pub struct Team {
    members: HashMap<String, TeammateSettings>,
    order: Vec<String>,
    default_responder: Option<String>,
}

impl Team {
    pub fn from_settings(settings: &TeamSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self {
            members: settings
                .members
                .iter()
                .map(|m| (m.id.clone(), m.clone()))
                .collect(),
            order: settings.members.iter().map(|m| m.id.clone()).collect(),
            default_responder: settings.default_responder.clone(),
        })
    }

    pub fn member(&self, id: &str) -> Result<&TeammateSettings, EngineError> {
        self.members
            .get(id)
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn default_responder(&self) -> Option<&str> {
        self.default_responder
            .as_deref()
            .or_else(|| self.order.first().map(String::as_str))
    }

    pub fn members(&self) -> impl Iterator<Item = &TeammateSettings> {
        self.order.iter().filter_map(|id| self.members.get(id))
    }

    pub fn diligence_budget(&self, id: &str, default: u32) -> u32 {
        self.members
            .get(id)
            .and_then(|m| m.diligence_push_max)
            .unwrap_or(default)
    }

    pub fn context_limits(&self, id: &str, health: &ContextHealthSettings) -> Option<ContextLimits> {
        let m = self.members.get(id)?;
        Some(ContextLimits::for_window(
            m.context_length,
            m.optimal_max_tokens.unwrap_or(health.default_optimal_max_tokens),
            health.critical_ratio,
        ))
    }
}

/// What one dialog may call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallPolicy {
    pub tools: Vec<String>,
    pub tellask: bool,
    pub fresh_boots: bool,
}

impl CallPolicy {
    pub fn for_dialog(member: &TeammateSettings, call_type: Option<CallType>) -> Self {
        if call_type == Some(CallType::FreshBootsReasoning) {
            return Self {
                tools: Vec::new(),
                tellask: false,
                fresh_boots: true,
            };
        }
        Self {
            tools: member.tools.clone(),
            tellask: member.tellask,
            fresh_boots: false,
        }
    }

    /// Checked before every generation; a broken policy is a configuration
    /// bug, not something the model did.
    pub fn validate(&self, registered: impl Fn(&str) -> bool) -> Result<(), EngineError> {
        if self.fresh_boots && (!self.tools.is_empty() || self.tellask) {
            return Err(EngineError::PolicyViolation(
                "fresh boots reasoning must run without tools and without tellask".into(),
            ));
        }
        for name in &self.tools {
            if is_special_call(name) {
                return Err(EngineError::PolicyViolation(format!(
                    "'{name}' is a tellask call, not a tool"
                )));
            }
            if !registered(name) {
                return Err(EngineError::PolicyViolation(format!(
                    "tool '{name}' is not registered"
                )));
            }
        }
        Ok(())
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TeamSettings {
        let mut lead = TeammateSettings::new("lead");
        lead.tools = vec!["add_reminder".into()];
        lead.diligence_push_max = Some(2);
        TeamSettings {
            members: vec![lead, TeammateSettings::new("pangu")],
            default_responder: None,
        }
    }

    #[test]
    fn lookup_and_default_responder() {
        let team = Team::from_settings(&settings()).unwrap();
        assert!(team.contains("pangu"));
        assert!(matches!(team.member("nobody"), Err(EngineError::UnknownAgent(_))));
        assert_eq!(team.default_responder(), Some("lead"));
        assert_eq!(team.diligence_budget("lead", 3), 2);
        assert_eq!(team.diligence_budget("pangu", 3), 3);
        assert_eq!(team.members().count(), 2);
    }

    #[test]
    fn invalid_team_rejected() {
        let mut s = settings();
        s.default_responder = Some("ghost".into());
        assert!(matches!(Team::from_settings(&s), Err(EngineError::Settings(_))));
    }

    #[test]
    fn fresh_boots_policy_strips_calls() {
        let s = settings();
        let policy = CallPolicy::for_dialog(&s.members[0], Some(CallType::FreshBootsReasoning));
        assert!(policy.tools.is_empty());
        assert!(!policy.tellask);
        assert!(policy.validate(|_| true).is_ok());
    }

    #[test]
    fn policy_rejects_unregistered_and_special_tools() {
        let mut member = TeammateSettings::new("x");
        member.tools = vec!["missing".into()];
        let policy = CallPolicy::for_dialog(&member, None);
        assert!(matches!(policy.validate(|_| false), Err(EngineError::PolicyViolation(_))));

        member.tools = vec![ASK_HUMAN.into()];
        let policy = CallPolicy::for_dialog(&member, None);
        assert!(matches!(policy.validate(|_| true), Err(EngineError::PolicyViolation(_))));
    }

    #[test]
    fn limits_use_member_window() {
        let team = Team::from_settings(&settings()).unwrap();
        let limits = team.context_limits("lead", &ContextHealthSettings::default()).unwrap();
        assert_eq!(limits.limit_tokens, 200_000);
        assert_eq!(limits.optimal_max_tokens, 100_000);
        assert_eq!(limits.critical_max_tokens, 180_000);
    }
}
