use serde::{Deserialize, Serialize};

/// Who stopped a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    UserStop,
    EmergencyStop,
    SystemStop,
    ServerRestart,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserStop => "user_stop",
            Self::EmergencyStop => "emergency_stop",
            Self::SystemStop => "system_stop",
            Self::ServerRestart => "server_restart",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    NeedsHumanInput,
    WaitingForSubdialogs,
    NeedsHumanInputAndSubdialogs,
}

/// Lifecycle status of a whole dialog tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogStatus {
    #[default]
    Running,
    Completed,
    Archived,
}

impl DialogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// The operator-facing state of a dialog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DialogRunState {
    #[default]
    IdleWaitingUser,
    Proceeding,
    ProceedingStopRequested {
        reason: InterruptReason,
    },
    Interrupted {
        reason: InterruptReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Blocked {
        reason: BlockedReason,
    },
    Terminal {
        status: DialogStatus,
    },
}

impl DialogRunState {
    pub fn interrupted(reason: InterruptReason) -> Self {
        Self::Interrupted {
            reason,
            detail: None,
        }
    }

    /// A run is in flight (or being wound down).
    pub fn is_proceeding(&self) -> bool {
        matches!(self, Self::Proceeding | Self::ProceedingStopRequested { .. })
    }

    /// States the revival scheduler must not act on.
    pub fn blocks_revival(&self) -> bool {
        matches!(
            self,
            Self::Interrupted { .. } | Self::ProceedingStopRequested { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdleWaitingUser => "idle_waiting_user",
            Self::Proceeding => "proceeding",
            Self::ProceedingStopRequested { .. } => "proceeding_stop_requested",
            Self::Interrupted { .. } => "interrupted",
            Self::Blocked { .. } => "blocked",
            Self::Terminal { .. } => "terminal",
        }
    }
}

/// Idle vs blocked vs terminal, from the facts persisted for a dialog.
pub fn settled_run_state(
    status: DialogStatus,
    has_pending_q4h: bool,
    has_pending_subdialogs: bool,
) -> DialogRunState {
    if status != DialogStatus::Running {
        return DialogRunState::Terminal { status };
    }
    match (has_pending_q4h, has_pending_subdialogs) {
        (true, true) => DialogRunState::Blocked {
            reason: BlockedReason::NeedsHumanInputAndSubdialogs,
        },
        (true, false) => DialogRunState::Blocked {
            reason: BlockedReason::NeedsHumanInput,
        },
        (false, true) => DialogRunState::Blocked {
            reason: BlockedReason::WaitingForSubdialogs,
        },
        (false, false) => DialogRunState::IdleWaitingUser,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_state_prefers_terminal() {
        assert_eq!(
            settled_run_state(DialogStatus::Archived, true, true),
            DialogRunState::Terminal {
                status: DialogStatus::Archived
            }
        );
    }

    #[test]
    fn settled_state_blocked_reasons() {
        assert_eq!(
            settled_run_state(DialogStatus::Running, true, false),
            DialogRunState::Blocked {
                reason: BlockedReason::NeedsHumanInput
            }
        );
        assert_eq!(
            settled_run_state(DialogStatus::Running, false, true),
            DialogRunState::Blocked {
                reason: BlockedReason::WaitingForSubdialogs
            }
        );
        assert_eq!(
            settled_run_state(DialogStatus::Running, false, false),
            DialogRunState::IdleWaitingUser
        );
    }

    #[test]
    fn revival_blocking_states() {
        assert!(DialogRunState::interrupted(InterruptReason::UserStop).blocks_revival());
        assert!(DialogRunState::ProceedingStopRequested {
            reason: InterruptReason::EmergencyStop
        }
        .blocks_revival());
        assert!(!DialogRunState::IdleWaitingUser.blocks_revival());
    }

    #[test]
    fn serde_shape() {
        let json = serde_json::to_value(DialogRunState::Interrupted {
            reason: InterruptReason::SystemStop,
            detail: Some("boom".into()),
        })
        .unwrap();
        assert_eq!(json["kind"], "interrupted");
        assert_eq!(json["reason"], "system_stop");
        assert_eq!(json["detail"], "boom");
    }

    #[test]
    fn status_parse_round_trip() {
        for s in [DialogStatus::Running, DialogStatus::Completed, DialogStatus::Archived] {
            assert_eq!(DialogStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DialogStatus::parse("nope"), None);
    }
}
