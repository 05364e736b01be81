use serde::{Deserialize, Serialize};

use crate::errors::GeneratorError;
use crate::health::UsageSnapshot;

/// Events a streaming generator yields. Strict ordering contract:
///
/// (ThinkingStart → ThinkingChunk* → ThinkingFinish |
///  SayingStart → SayingChunk* → SayingFinish |
///  FuncCall)* → Done
///
/// Usage and Error may appear at any point; an Error ends the stream.
#[derive(Clone, Debug)]
pub enum GenEvent {
    ThinkingStart,
    ThinkingChunk { chunk: String },
    ThinkingFinish,

    SayingStart,
    SayingChunk { chunk: String },
    SayingFinish,

    FuncCall {
        id: String,
        name: String,
        arguments: String,
    },

    Usage(UsageSnapshot),
    Done,
    Error { error: GeneratorError },
}

impl GenEvent {
    /// Whether this event puts something into the transcript. Once one of
    /// these has been seen, the attempt can no longer be retried.
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::Usage(_) | Self::Done | Self::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ThinkingStart => "thinking_start",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::ThinkingFinish => "thinking_finish",
            Self::SayingStart => "saying_start",
            Self::SayingChunk { .. } => "saying_chunk",
            Self::SayingFinish => "saying_finish",
            Self::FuncCall { .. } => "func_call",
            Self::Usage(_) => "usage",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Which stream phase is currently open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    #[default]
    Idle,
    Thinking,
    Saying,
}

/// A callback arrived while the wrong phase was active.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("stream protocol violation: {event} while {phase:?}")]
pub struct StreamViolation {
    pub event: &'static str,
    pub phase: StreamPhase,
}

impl StreamPhase {
    /// Apply one event, returning the violation instead of moving if the
    /// event is not legal in the current phase.
    pub fn advance(&mut self, event: &GenEvent) -> Result<(), StreamViolation> {
        let next = match (*self, event) {
            (Self::Idle, GenEvent::ThinkingStart) => Self::Thinking,
            (Self::Thinking, GenEvent::ThinkingChunk { .. }) => Self::Thinking,
            (Self::Thinking, GenEvent::ThinkingFinish) => Self::Idle,
            (Self::Idle, GenEvent::SayingStart) => Self::Saying,
            (Self::Saying, GenEvent::SayingChunk { .. }) => Self::Saying,
            (Self::Saying, GenEvent::SayingFinish) => Self::Idle,
            (Self::Idle, GenEvent::FuncCall { .. } | GenEvent::Done) => Self::Idle,
            (phase, GenEvent::Usage(_) | GenEvent::Error { .. }) => phase,
            (phase, event) => {
                return Err(StreamViolation {
                    event: event.name(),
                    phase,
                })
            }
        };
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[GenEvent]) -> Result<StreamPhase, StreamViolation> {
        let mut phase = StreamPhase::Idle;
        for ev in events {
            phase.advance(ev)?;
        }
        Ok(phase)
    }

    #[test]
    fn well_formed_sequence_returns_to_idle() {
        let phase = run(&[
            GenEvent::ThinkingStart,
            GenEvent::ThinkingChunk { chunk: "hmm".into() },
            GenEvent::ThinkingFinish,
            GenEvent::SayingStart,
            GenEvent::SayingChunk { chunk: "hi".into() },
            GenEvent::Usage(UsageSnapshot::default()),
            GenEvent::SayingFinish,
            GenEvent::FuncCall {
                id: "c1".into(),
                name: "t".into(),
                arguments: "{}".into(),
            },
            GenEvent::Done,
        ])
        .unwrap();
        assert_eq!(phase, StreamPhase::Idle);
    }

    #[test]
    fn saying_inside_thinking_is_violation() {
        let err = run(&[GenEvent::ThinkingStart, GenEvent::SayingStart]).unwrap_err();
        assert_eq!(err.event, "saying_start");
        assert_eq!(err.phase, StreamPhase::Thinking);
    }

    #[test]
    fn chunk_without_start_is_violation() {
        let err = run(&[GenEvent::SayingChunk { chunk: "x".into() }]).unwrap_err();
        assert_eq!(err.phase, StreamPhase::Idle);
    }

    #[test]
    fn done_while_open_is_violation() {
        assert!(run(&[GenEvent::SayingStart, GenEvent::Done]).is_err());
    }

    #[test]
    fn content_classification() {
        assert!(GenEvent::SayingStart.is_content());
        assert!(!GenEvent::Done.is_content());
        assert!(!GenEvent::Usage(UsageSnapshot::default()).is_content());
    }
}
