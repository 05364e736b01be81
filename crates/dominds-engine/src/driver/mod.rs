//! The generation driver: runs a dialog until it replies, blocks, is
//! suspended or is interrupted.
//!
//! One drive holds the dialog's drive lock throughout. Each iteration
//! consults context health, takes the queued prompt and any teammate
//! responses, runs one generation inside a genseq bracket, then routes the
//! calls that came out of it.

pub(crate) mod calls;
pub(crate) mod context;
pub(crate) mod stream;

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use dominds_core::events::{DialogEvent, RunStateMarker};
use dominds_core::ids::DialogId;
use dominds_core::messages::{ChatMessage, PendingPrompt, PromptOrigin, ResponseStatus};
use dominds_core::run_state::{settled_run_state, DialogRunState, DialogStatus, InterruptReason};
use dominds_core::subdialog::SubdialogResponse;
use dominds_store::CourseRecord;

use crate::dialog::{Dialog, Suspension};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::health::{forced_course_prompt, remediation_prompt, HealthDecision, Remediation};
use crate::runs::RunHandle;
use crate::subdialog::tellask_result_message;
use crate::team::CallPolicy;

use self::stream::measure_health;

/// Upper bound on generations within one drive.
const MAX_GENERATIONS_PER_DRIVE: u32 = 64;

const NO_RESPONSE: &str = "(no response)";

const DILIGENCE_PROMPT: &str = "Keep going: if the task is not finished, take the next step. \
     If it is finished, say so briefly.";

/// How a drive ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The dialog replied and has nothing more to do.
    Completed,
    /// Waiting on a human answer or on teammates.
    Blocked,
    /// Critical context with a human prompt waiting; the prompt stays queued.
    Suspended,
    Interrupted(InterruptReason),
    /// The tree is not running.
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopExit {
    Reply,
    Blocked,
    Suspended,
}

impl LoopExit {
    fn outcome(self) -> DriveOutcome {
        match self {
            Self::Reply => DriveOutcome::Completed,
            Self::Blocked => DriveOutcome::Blocked,
            Self::Suspended => DriveOutcome::Suspended,
        }
    }
}

impl Engine {
    /// Drive `dialog` until it settles. Serialized per dialog: a second
    /// caller waits for the first drive to finish.
    #[instrument(skip(self, dialog), fields(dialog_id = %dialog.id(), agent_id = %dialog.agent_id()))]
    pub async fn drive(&self, dialog: &Arc<Dialog>) -> Result<DriveOutcome, EngineError> {
        if dialog.status() != DialogStatus::Running {
            debug!("tree not running, drive skipped");
            return Ok(DriveOutcome::Skipped);
        }
        let _guard = dialog.acquire().await;
        let run = self.runs.begin(dialog.id());

        let result = self.drive_locked(dialog, &run).await;
        // A stop request that lands before this point is overwritten below.
        self.runs.finish(&run);
        self.finalize(dialog, result)
    }

    async fn drive_locked(&self, dialog: &Arc<Dialog>, run: &RunHandle) -> Result<LoopExit, EngineError> {
        let store = self.store();
        let latest = store.dialogs.latest(dialog.id())?;
        if let DialogRunState::Interrupted { .. } = latest.run_state {
            dialog.emit(DialogEvent::RunStateMarker {
                dialog_id: dialog.id().clone(),
                marker: RunStateMarker::Resumed,
            });
        }
        store.dialogs.set_needs_drive(dialog.id(), false)?;
        self.publish_run_state(dialog, DialogRunState::Proceeding)?;

        let member = self.team.member(dialog.agent_id())?.clone();
        let policy = CallPolicy::for_dialog(&member, dialog.call_type());
        policy.validate(|name| self.tools.contains(name))?;

        let mut last_saying = String::new();
        let mut generations = 0u32;
        let exit = loop {
            run.check()?;

            let mut internal = match self.apply_health(dialog)? {
                Some(HealthStep::Suspend) => break LoopExit::Suspended,
                Some(HealthStep::Remediate(prompt)) => Some(prompt),
                None => None,
            };

            if let Some(prompt) = dialog.take_up_next()? {
                dialog.emit(DialogEvent::UserTurn {
                    dialog_id: dialog.id().clone(),
                    course: dialog.current_course(),
                    msg_id: prompt.msg_id.clone(),
                    content: prompt.content.clone(),
                    origin: prompt.origin,
                });
                if prompt.is_internal() {
                    internal = Some(merge_internal(prompt, internal));
                } else {
                    dialog.append_message(ChatMessage::prompting(&prompt))?;
                }
            }

            let taken = self.take_responses(dialog)?;
            self.owners.refresh(dialog);

            let request = self.assemble_request(dialog, &member, &policy, internal.as_ref());
            let bracket = dialog.notify_generating_start()?;
            let result = self
                .generate(dialog, run, bracket, member.streaming, request)
                .await;
            let health = result.as_ref().ok().map(|out| {
                measure_health(
                    out.usage.as_ref(),
                    self.team.context_limits(&member.id, &self.config.context_health),
                )
            });
            dialog.notify_generating_finish(bracket, health, Some(member.model.clone()));
            let output = result?;
            generations += 1;

            if !taken.is_empty() {
                let records = consumed_records(dialog, &taken);
                let consumed = store.consume_taken(dialog.id(), bracket.course, &records)?;
                debug!(genseq = bracket.genseq, consumed, "teammate responses consumed");
            }

            let routed = self
                .route_calls(dialog, run, &policy, output.func_calls, output.tellask_calls)
                .await?;
            if !output.saying.trim().is_empty() {
                last_saying = output.saying;
            }

            if routed.violation {
                break LoopExit::Reply;
            }
            if !dialog.can_drive()? {
                break LoopExit::Blocked;
            }
            if generations >= MAX_GENERATIONS_PER_DRIVE {
                warn!(generations, "generation limit reached, ending drive");
                break LoopExit::Reply;
            }
            if routed.produced || dialog.has_up_next() {
                continue;
            }
            if dialog.is_root() && dialog.diligence_remaining() > 0 {
                let remaining = dialog.diligence_remaining() - 1;
                dialog.set_diligence_remaining(remaining)?;
                debug!(remaining, "diligence push");
                dialog.queue_up_next(PendingPrompt::internal(DILIGENCE_PROMPT, PromptOrigin::Diligence))?;
                continue;
            }
            break LoopExit::Reply;
        };

        let reply = if last_saying.trim().is_empty() {
            NO_RESPONSE.to_string()
        } else {
            last_saying
        };
        match exit {
            LoopExit::Reply => {
                self.supply_reply(dialog, &reply, ResponseStatus::Completed, true)
                    .await?;
            }
            LoopExit::Blocked => {
                self.supply_reply(dialog, &reply, ResponseStatus::Completed, false)
                    .await?;
            }
            LoopExit::Suspended => {}
        }
        Ok(exit)
    }

    /// Consult context health before a generation.
    fn apply_health(&self, dialog: &Dialog) -> Result<Option<HealthStep>, EngineError> {
        let resumed = dialog.suspension() == Suspension::Resumed;
        let up_next = dialog.up_next();
        let had_user_prompt = !resumed
            && up_next
                .as_ref()
                .is_some_and(|p| matches!(p.origin, PromptOrigin::Human | PromptOrigin::Q4hAnswer));
        if resumed {
            dialog.set_suspension(Suspension::Active);
        }

        let snapshot = dialog.last_health();
        let decision = self
            .health
            .decide(dialog.id(), snapshot.as_ref(), had_user_prompt, up_next.is_none());
        match decision {
            HealthDecision::Proceed => Ok(None),
            HealthDecision::Suspend => {
                info!(dialog_id = %dialog.id(), "critical context, suspended until the human resumes");
                dialog.set_suspension(Suspension::Suspended);
                dialog.append_message(ChatMessage::UiOnlyMarkdown {
                    content: "Context is critically large. The dialog is suspended; \
                              resume it to continue, or start a new course."
                        .to_string(),
                })?;
                Ok(Some(HealthStep::Suspend))
            }
            HealthDecision::Continue(Remediation::CriticalForceNewCourse) => {
                info!(dialog_id = %dialog.id(), "critical context, forcing a new course");
                let saved = dialog.take_up_next()?;
                self.health.reset(dialog.id());
                dialog.start_new_course(forced_course_prompt())?;
                if let Some(saved) = saved {
                    dialog.queue_up_next(saved)?;
                }
                if !dialog.has_up_next() {
                    return Err(EngineError::Invariant(format!(
                        "{} has no prompt after a forced new course",
                        dialog.id()
                    )));
                }
                Ok(None)
            }
            HealthDecision::Continue(remediation) => {
                debug!(dialog_id = %dialog.id(), kind = remediation.kind(), "context remediation");
                Ok(Some(HealthStep::Remediate(remediation_prompt(
                    remediation,
                    snapshot.as_ref(),
                ))))
            }
        }
    }

    fn finalize(
        &self,
        dialog: &Arc<Dialog>,
        result: Result<LoopExit, EngineError>,
    ) -> Result<DriveOutcome, EngineError> {
        match result {
            Ok(exit) => {
                let state = self
                    .settled_state(dialog)
                    .unwrap_or(DialogRunState::IdleWaitingUser);
                self.publish_run_state(dialog, state)?;
                self.reflag_if_queued(dialog)?;
                debug!(dialog_id = %dialog.id(), ?exit, "drive finished");
                Ok(exit.outcome())
            }
            Err(EngineError::Interrupted(reason)) => {
                self.rollback(dialog);
                info!(dialog_id = %dialog.id(), reason = reason.as_str(), "drive interrupted");
                self.publish_run_state(dialog, DialogRunState::interrupted(reason))?;
                dialog.emit(DialogEvent::RunStateMarker {
                    dialog_id: dialog.id().clone(),
                    marker: RunStateMarker::Interrupted { reason },
                });
                Ok(DriveOutcome::Interrupted(reason))
            }
            Err(e) => {
                error!(dialog_id = %dialog.id(), error = %e, "drive failed");
                dialog.emit(DialogEvent::StreamError {
                    dialog_id: dialog.id().clone(),
                    detail: e.to_string(),
                });
                self.rollback(dialog);
                let state = DialogRunState::Interrupted {
                    reason: InterruptReason::SystemStop,
                    detail: Some(e.to_string()),
                };
                if let Err(persist) = self.publish_run_state(dialog, state) {
                    warn!(dialog_id = %dialog.id(), error = %persist, "failed to persist run state");
                }
                Err(e)
            }
        }
    }

    fn rollback(&self, dialog: &Dialog) {
        if dialog.take_course_request().is_some() {
            debug!(dialog_id = %dialog.id(), "requested course change dropped");
        }
        match self.store().queues.rollback_taken(dialog.id()) {
            Ok(0) => {}
            Ok(n) => debug!(dialog_id = %dialog.id(), requeued = n, "taken responses requeued"),
            Err(e) => warn!(dialog_id = %dialog.id(), error = %e, "failed to requeue taken responses"),
        }
    }

    fn settled_state(&self, dialog: &Arc<Dialog>) -> Result<DialogRunState, EngineError> {
        Ok(settled_run_state(
            dialog.status(),
            dialog.has_pending_q4h()?,
            dialog.has_pending_subdialogs()?,
        ))
    }

    /// Something was queued while the drive ran: let revival pick it up.
    fn reflag_if_queued(&self, dialog: &Dialog) -> Result<(), EngineError> {
        if dialog.suspension() == Suspension::Suspended {
            return Ok(());
        }
        let queued = dialog.has_up_next()
            || !self.store().queues.queued_responses(dialog.id())?.is_empty();
        let tellask_back = dialog
            .up_next()
            .is_some_and(|p| p.origin == PromptOrigin::TellaskBack);
        if queued && (dialog.can_drive()? || tellask_back) {
            self.store().dialogs.set_needs_drive(dialog.id(), true)?;
            self.wake_revival();
        }
        Ok(())
    }

    pub(crate) fn publish_run_state(&self, dialog: &Dialog, state: DialogRunState) -> Result<(), EngineError> {
        self.store().dialogs.set_run_state(dialog.id(), &state)?;
        dialog.emit(DialogEvent::RunState {
            dialog_id: dialog.id().clone(),
            state,
        });
        Ok(())
    }
}

enum HealthStep {
    Suspend,
    Remediate(PendingPrompt),
}

/// Two ephemeral prompts seen by the same generation become one.
fn merge_internal(first: PendingPrompt, second: Option<PendingPrompt>) -> PendingPrompt {
    match second {
        Some(b) => PendingPrompt {
            content: format!("{}\n\n{}", first.content, b.content),
            ..first
        },
        None => first,
    }
}

fn consumed_records(dialog: &Dialog, taken: &[SubdialogResponse]) -> Vec<CourseRecord> {
    taken
        .iter()
        .map(|response| {
            let from = DialogId::sub(
                dialog.id().root_id.clone(),
                response.subdialog_id.clone(),
            );
            CourseRecord::message(tellask_result_message(response, &from))
        })
        .collect()
}
