//! Context-health decisions.
//!
//! A pure function of the last usage snapshot, whether a human prompt is
//! waiting for this generation, and per-dialog round state. Round state
//! lives here, keyed by dialog, and is dropped on any return to healthy.

use dashmap::DashMap;
use tracing::debug;

use dominds_core::health::{ContextHealthLevel, ContextHealthSnapshot};
use dominds_core::ids::DialogId;
use dominds_core::messages::{PendingPrompt, PromptOrigin};
use dominds_settings::ContextHealthSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Remediation {
    Caution,
    CriticalCountdown { countdown: u32 },
    CriticalForceNewCourse,
}

impl Remediation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Caution => "caution_remediation",
            Self::CriticalCountdown { .. } => "critical_countdown_remediation",
            Self::CriticalForceNewCourse => "critical_force_new_course",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthDecision {
    Proceed,
    Continue(Remediation),
    /// Critical with a human prompt waiting: stop and let the human decide.
    Suspend,
}

#[derive(Clone, Copy, Debug)]
pub struct HealthConfig {
    pub caution_cadence: u32,
    pub critical_countdown: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            caution_cadence: 10,
            critical_countdown: 5,
        }
    }
}

impl From<&ContextHealthSettings> for HealthConfig {
    fn from(s: &ContextHealthSettings) -> Self {
        Self {
            caution_cadence: s.caution_remediation_cadence.max(1),
            critical_countdown: s.critical_countdown_generations,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RoundState {
    in_caution: bool,
    caution_generations: u32,
    caution_due: bool,
    critical_countdown: Option<u32>,
}

pub struct ContextHealthEngine {
    config: HealthConfig,
    rounds: DashMap<DialogId, RoundState>,
}

impl ContextHealthEngine {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            rounds: DashMap::new(),
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Decide what the next generation of `id` should do.
    ///
    /// `injection_allowed` is false while something else already owns the
    /// next prompt; a due caution remediation then waits.
    pub fn decide(
        &self,
        id: &DialogId,
        snapshot: Option<&ContextHealthSnapshot>,
        had_user_prompt: bool,
        injection_allowed: bool,
    ) -> HealthDecision {
        let level = snapshot.and_then(ContextHealthSnapshot::level);
        let decision = match level {
            None => HealthDecision::Proceed,
            Some(ContextHealthLevel::Healthy) => {
                self.reset(id);
                HealthDecision::Proceed
            }
            Some(ContextHealthLevel::Caution) => {
                let mut round = self.rounds.entry(id.clone()).or_default();
                if !round.in_caution {
                    round.in_caution = true;
                    round.caution_generations = 0;
                    round.caution_due = true;
                } else {
                    round.caution_generations += 1;
                    if round.caution_generations >= self.config.caution_cadence {
                        round.caution_generations = 0;
                        round.caution_due = true;
                    }
                }
                if round.caution_due && !had_user_prompt && injection_allowed {
                    round.caution_due = false;
                    HealthDecision::Continue(Remediation::Caution)
                } else {
                    HealthDecision::Proceed
                }
            }
            Some(ContextHealthLevel::Critical) => {
                let mut round = self.rounds.entry(id.clone()).or_default();
                round.in_caution = false;
                let countdown = round
                    .critical_countdown
                    .get_or_insert(self.config.critical_countdown);
                if had_user_prompt && *countdown > 0 {
                    HealthDecision::Suspend
                } else if *countdown == 0 {
                    HealthDecision::Continue(Remediation::CriticalForceNewCourse)
                } else {
                    *countdown -= 1;
                    HealthDecision::Continue(Remediation::CriticalCountdown {
                        countdown: *countdown,
                    })
                }
            }
        };
        debug!(dialog_id = %id, ?level, ?decision, "context health decision");
        decision
    }

    /// Forget all round state of `id` (healthy again, or a new course).
    pub fn reset(&self, id: &DialogId) {
        self.rounds.remove(id);
    }

    /// Generations left before a forced new course, if counting down.
    pub fn countdown(&self, id: &DialogId) -> Option<u32> {
        self.rounds.get(id).and_then(|r| r.critical_countdown)
    }
}

/// The model-facing prompt for a remediation.
pub fn remediation_prompt(remediation: Remediation, snapshot: Option<&ContextHealthSnapshot>) -> PendingPrompt {
    let usage = match snapshot {
        Some(ContextHealthSnapshot::Available {
            prompt_tokens,
            optimal_max_tokens,
            ..
        }) => format!(" ({prompt_tokens} prompt tokens, optimal ceiling {optimal_max_tokens})"),
        _ => String::new(),
    };
    let text = match remediation {
        Remediation::Caution => format!(
            "Your context is getting large{usage}. Move what you still need into reminders \
             with `add_reminder`, then consider `clear_mind` to continue in a fresh course."
        ),
        Remediation::CriticalCountdown { countdown } => format!(
            "Your context is critically large{usage}. {countdown} generation(s) remain before a \
             new course is started for you. Save what matters with `add_reminder` and call \
             `clear_mind` now."
        ),
        Remediation::CriticalForceNewCourse => new_course_text().to_string(),
    };
    PendingPrompt::internal(text, PromptOrigin::ContextHealth)
}

/// Prompt opening a course that was forced by context pressure.
pub fn forced_course_prompt() -> PendingPrompt {
    PendingPrompt::with_origin(new_course_text(), PromptOrigin::NewCourse)
}

fn new_course_text() -> &'static str {
    "The previous course was closed because its context grew too large. \
     Continue the task from your reminders."
}

#[cfg(test)]
mod tests {
    use super::*;
    use dominds_core::health::{ContextLimits, UsageSnapshot};

    fn snapshot(prompt_tokens: u64) -> ContextHealthSnapshot {
        let limits = ContextLimits::for_window(1000, 500, 0.9);
        ContextHealthSnapshot::measure(
            &UsageSnapshot {
                prompt_tokens,
                completion_tokens: 10,
                total_tokens: None,
            },
            &limits,
        )
    }

    fn engine() -> ContextHealthEngine {
        ContextHealthEngine::new(HealthConfig::default())
    }

    const HEALTHY: u64 = 100;
    const CAUTION: u64 = 600;
    const CRITICAL: u64 = 950;

    #[test]
    fn unavailable_and_healthy_proceed() {
        let e = engine();
        let id = DialogId::root("r");
        assert_eq!(e.decide(&id, None, false, true), HealthDecision::Proceed);
        let unavailable = ContextHealthSnapshot::unavailable("no usage");
        assert_eq!(e.decide(&id, Some(&unavailable), false, true), HealthDecision::Proceed);
        assert_eq!(e.decide(&id, Some(&snapshot(HEALTHY)), false, true), HealthDecision::Proceed);
    }

    #[test]
    fn critical_countdown_then_forced_course() {
        let e = engine();
        let id = DialogId::root("r");
        let critical = snapshot(CRITICAL);
        for expected in [4, 3, 2, 1, 0] {
            assert_eq!(
                e.decide(&id, Some(&critical), false, true),
                HealthDecision::Continue(Remediation::CriticalCountdown { countdown: expected })
            );
        }
        let sixth = e.decide(&id, Some(&critical), false, true);
        assert_eq!(sixth, HealthDecision::Continue(Remediation::CriticalForceNewCourse));
        assert_eq!(Remediation::CriticalForceNewCourse.kind(), "critical_force_new_course");
    }

    #[test]
    fn healthy_resets_countdown() {
        let e = engine();
        let id = DialogId::root("r");
        let critical = snapshot(CRITICAL);
        e.decide(&id, Some(&critical), false, true);
        e.decide(&id, Some(&critical), false, true);
        assert_eq!(e.countdown(&id), Some(3));
        e.decide(&id, Some(&snapshot(HEALTHY)), false, true);
        assert_eq!(e.countdown(&id), None);
        assert_eq!(
            e.decide(&id, Some(&critical), false, true),
            HealthDecision::Continue(Remediation::CriticalCountdown { countdown: 4 })
        );
    }

    #[test]
    fn critical_with_human_prompt_suspends() {
        let e = engine();
        let id = DialogId::root("r");
        assert_eq!(e.decide(&id, Some(&snapshot(CRITICAL)), true, true), HealthDecision::Suspend);
        // suspension does not spend the countdown
        assert_eq!(e.countdown(&id), Some(5));
    }

    #[test]
    fn countdown_zero_forces_even_with_human() {
        let e = engine();
        let id = DialogId::root("r");
        let critical = snapshot(CRITICAL);
        for _ in 0..5 {
            e.decide(&id, Some(&critical), false, true);
        }
        assert_eq!(
            e.decide(&id, Some(&critical), true, true),
            HealthDecision::Continue(Remediation::CriticalForceNewCourse)
        );
    }

    #[test]
    fn caution_first_entry_then_cadence() {
        let e = ContextHealthEngine::new(HealthConfig {
            caution_cadence: 3,
            critical_countdown: 5,
        });
        let id = DialogId::root("r");
        let caution = snapshot(CAUTION);
        assert_eq!(
            e.decide(&id, Some(&caution), false, true),
            HealthDecision::Continue(Remediation::Caution)
        );
        assert_eq!(e.decide(&id, Some(&caution), false, true), HealthDecision::Proceed);
        assert_eq!(e.decide(&id, Some(&caution), false, true), HealthDecision::Proceed);
        assert_eq!(
            e.decide(&id, Some(&caution), false, true),
            HealthDecision::Continue(Remediation::Caution)
        );
    }

    #[test]
    fn caution_stays_due_while_blocked() {
        let e = engine();
        let id = DialogId::root("r");
        let caution = snapshot(CAUTION);
        assert_eq!(e.decide(&id, Some(&caution), true, true), HealthDecision::Proceed);
        assert_eq!(e.decide(&id, Some(&caution), false, false), HealthDecision::Proceed);
        assert_eq!(
            e.decide(&id, Some(&caution), false, true),
            HealthDecision::Continue(Remediation::Caution)
        );
    }

    #[test]
    fn reset_clears_round_state() {
        let e = engine();
        let id = DialogId::root("r");
        e.decide(&id, Some(&snapshot(CRITICAL)), false, true);
        e.reset(&id);
        assert_eq!(e.countdown(&id), None);
    }

    #[test]
    fn prompts_are_internal() {
        let p = remediation_prompt(Remediation::CriticalCountdown { countdown: 2 }, Some(&snapshot(CRITICAL)));
        assert!(p.is_internal());
        assert!(p.content.contains("2 generation(s)"));
        assert!(p.content.contains("950 prompt tokens"));
        assert_eq!(forced_course_prompt().origin, PromptOrigin::NewCourse);
    }
}
