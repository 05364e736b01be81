use dominds_core::errors::GeneratorError;
use dominds_core::ids::DialogId;
use dominds_core::run_state::InterruptReason;
use dominds_core::stream::StreamViolation;
use dominds_core::tools::ToolError;
use dominds_settings::SettingsError;
use dominds_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Expected and resumable: somebody stopped the run.
    #[error("dialog interrupted: {}", .0.as_str())]
    Interrupted(InterruptReason),

    #[error("{0}")]
    StreamProtocol(#[from] StreamViolation),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A bookkeeping invariant broke. Never swallowed.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("dialog not found: {0}")]
    DialogNotFound(DialogId),

    #[error("question not found: {0}")]
    QuestionNotFound(String),

    #[error("no reminder #{index} (dialog has {len})")]
    ReminderIndex { index: usize, len: usize },
}

impl EngineError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dominds_core::stream::StreamPhase;

    #[test]
    fn interrupted_display_uses_reason() {
        let err = EngineError::Interrupted(InterruptReason::EmergencyStop);
        assert_eq!(err.to_string(), "dialog interrupted: emergency_stop");
        assert!(err.is_interrupted());
    }

    #[test]
    fn stream_violation_converts() {
        let err: EngineError = StreamViolation {
            event: "saying_chunk",
            phase: StreamPhase::Thinking,
        }
        .into();
        assert!(matches!(err, EngineError::StreamProtocol(_)));
        assert!(!err.is_interrupted());
    }

    #[test]
    fn store_error_converts() {
        let err: EngineError = StoreError::NotFound("dialog x".into()).into();
        assert_eq!(err.to_string(), "store error: not found: dialog x");
    }
}
