//! Subdialog lifecycle: creation, session reuse, asking back, and the
//! transactional hand-off of a reply to whoever is waiting on it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use dominds_core::events::DialogEvent;
use dominds_core::ids::DialogId;
use dominds_core::messages::{ChatMessage, PendingPrompt, PromptOrigin, ResponseStatus};
use dominds_core::run_state::DialogStatus;
use dominds_core::subdialog::{AssignmentFromSup, CallType, PendingSubdialog, SubdialogResponse};
use dominds_store::{DialogLatest, DialogMeta, StoreError};

use crate::dialog::{session_key, Dialog, DialogState};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::owners::PendingTellasksOwner;

/// A routed call that targets another dialog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TellaskRequest {
    pub call_id: String,
    pub call_type: CallType,
    pub target_agent_id: String,
    pub tellask_head: String,
    pub body: String,
    pub session: Option<String>,
}

/// The caller-side message for a delivered response.
pub(crate) fn tellask_result_message(response: &SubdialogResponse, from: &DialogId) -> ChatMessage {
    ChatMessage::TellaskResult {
        call_id: response.call_id.clone(),
        responder_id: response.responder_id.clone(),
        from_dialog: from.clone(),
        tellask_head: response.tellask_head.clone(),
        content: response.format_for_caller(),
        status: response.status,
    }
}

impl Engine {
    /// Route a teammate call from `caller`: reuse the session's subdialog
    /// when there is one, otherwise create a new subdialog. Returns the id
    /// of the dialog that will answer.
    #[instrument(skip(self, caller, req), fields(caller = %caller.id(), call_id = %req.call_id, target = %req.target_agent_id))]
    pub(crate) async fn dispatch_tellask(
        &self,
        caller: &Arc<Dialog>,
        req: TellaskRequest,
    ) -> Result<DialogId, EngineError> {
        self.check_agent(&req.target_agent_id)?;
        if let (CallType::Tellask, Some(session)) = (req.call_type, req.session.as_deref()) {
            let key = session_key(&req.target_agent_id, session);
            if let Some(existing) = caller.session_subdialog(&key) {
                self.reuse_session(caller, &existing, req)?;
                return Ok(existing.id().clone());
            }
        }
        self.create_subdialog(caller, req)
    }

    fn assignment_for(&self, caller: &Dialog, req: &TellaskRequest) -> AssignmentFromSup {
        AssignmentFromSup {
            caller_dialog_id: caller.id().clone(),
            caller_agent_id: caller.agent_id().to_string(),
            call_id: req.call_id.clone(),
            call_type: req.call_type,
            tellask_head: req.tellask_head.clone(),
            tellask_body: req.body.clone(),
            tellask_session: req.session.clone(),
        }
    }

    fn create_subdialog(&self, caller: &Arc<Dialog>, req: TellaskRequest) -> Result<DialogId, EngineError> {
        let root = caller
            .root()
            .ok_or_else(|| EngineError::Invariant(format!("{} has no loaded root", caller.id())))?;
        let id = DialogId::new_sub(&caller.id().root_id);
        let assignment = self.assignment_for(caller, &req);
        let prompt = PendingPrompt::with_origin(assignment.render(), PromptOrigin::Assignment);
        let diligence = if req.call_type == CallType::FreshBootsReasoning {
            0
        } else {
            self.diligence_budget(&req.target_agent_id)
        };

        let meta = DialogMeta {
            id: id.clone(),
            agent_id: req.target_agent_id.clone(),
            status: DialogStatus::Running,
            assignment: Some(assignment.clone()),
            task_doc: None,
            created_at: Utc::now().to_rfc3339(),
        };
        let latest = DialogLatest {
            diligence_remaining: diligence,
            needs_drive: true,
            up_next: Some(prompt),
            ..DialogLatest::default()
        };
        let store = self.store();
        store.dialogs.create(&meta, &latest)?;

        let sub = Dialog::new_sub(
            &root,
            id.clone(),
            req.target_agent_id.clone(),
            assignment,
            DialogState::from_latest(&latest, Vec::new(), (0, Vec::new())),
        );
        root.register_subdialog(sub)?;
        if let (CallType::Tellask, Some(session)) = (req.call_type, req.session.as_deref()) {
            let key = session_key(&req.target_agent_id, session);
            store.dialogs.register_session(&id.root_id, &key, &id.self_id)?;
            root.register_session(&key, &id.self_id)?;
        }

        self.register_pending(caller, &id, &req)?;
        info!(subdialog_id = %id, call_type = req.call_type.as_str(), "subdialog created");
        caller.emit(DialogEvent::SubdialogCreated {
            dialog_id: caller.id().clone(),
            subdialog_id: id.clone(),
            target_agent_id: req.target_agent_id,
            tellask_head: req.tellask_head,
            call_id: req.call_id,
            call_type: req.call_type,
        });
        self.wake_revival();
        Ok(id)
    }

    fn reuse_session(&self, caller: &Arc<Dialog>, sub: &Arc<Dialog>, req: TellaskRequest) -> Result<(), EngineError> {
        let assignment = self.assignment_for(caller, &req);
        self.register_pending(caller, sub.id(), &req)?;
        sub.queue_up_next(PendingPrompt::with_origin(
            assignment.render(),
            PromptOrigin::Assignment,
        ))?;
        self.store().dialogs.set_needs_drive(sub.id(), true)?;
        debug!(subdialog_id = %sub.id(), session = ?req.session, "session subdialog reused");
        self.wake_revival();
        Ok(())
    }

    fn register_pending(&self, caller: &Dialog, target: &DialogId, req: &TellaskRequest) -> Result<(), EngineError> {
        let record = PendingSubdialog {
            subdialog_id: target.self_id.clone(),
            call_id: req.call_id.clone(),
            created_at: Utc::now(),
            tellask_head: req.tellask_head.clone(),
            target_agent_id: req.target_agent_id.clone(),
            call_type: req.call_type,
            tellask_session: req.session.clone(),
        };
        self.store().queues.add_pending(caller.id(), &record)?;
        PendingTellasksOwner::ensure(caller);
        Ok(())
    }

    /// A subdialog asks the dialog that assigned its work. The asker waits
    /// on the supdialog like on any teammate; the supdialog gets the
    /// question as its next prompt and is driven even while it is itself
    /// waiting on the asker.
    #[instrument(skip(self, asker, req), fields(asker = %asker.id(), call_id = %req.call_id))]
    pub(crate) async fn tellask_back(&self, asker: &Arc<Dialog>, req: TellaskRequest) -> Result<(), EngineError> {
        let sup = asker
            .supdialog()
            .ok_or_else(|| EngineError::Invariant(format!("{} has no supdialog", asker.id())))?;
        let req = TellaskRequest {
            target_agent_id: sup.agent_id().to_string(),
            ..req
        };
        self.register_pending(asker, sup.id(), &req)?;

        let mut question = format!(
            "@{} (working on your tellask) asks back:\n\n{}",
            asker.agent_id(),
            req.tellask_head.trim()
        );
        if !req.body.trim().is_empty() {
            question.push_str("\n\n");
            question.push_str(req.body.trim());
        }
        sup.queue_up_next(PendingPrompt::with_origin(question, PromptOrigin::TellaskBack))?;
        self.store().dialogs.set_needs_drive(sup.id(), true)?;
        self.wake_revival();
        Ok(())
    }

    /// Hand `content` to every dialog waiting on `dialog`.
    ///
    /// Askers that asked back are answered first and alone. Ordinary callers
    /// only get the reply when `final_reply` is set. Each delivery holds the
    /// owner's transaction lock; a replayed delivery is refused by the store
    /// and surfaces as an invariant error. After commit the response is
    /// announced and, if the owner is idle, mirrored into its transcript.
    #[instrument(skip(self, dialog, content), fields(dialog_id = %dialog.id()))]
    pub(crate) async fn supply_reply(
        &self,
        dialog: &Arc<Dialog>,
        content: &str,
        status: ResponseStatus,
        final_reply: bool,
    ) -> Result<usize, EngineError> {
        let store = self.store();
        let waiting = store
            .queues
            .pending_targeting(&dialog.id().root_id, &dialog.id().self_id)?;
        let (back, callers): (Vec<_>, Vec<_>) = waiting
            .into_iter()
            .partition(|(_, p)| p.call_type == CallType::TellaskBack);
        let targets = if !back.is_empty() {
            back
        } else if final_reply {
            callers
        } else {
            Vec::new()
        };

        let mut delivered = 0;
        for (owner, pending) in targets {
            let response = SubdialogResponse {
                subdialog_id: dialog.id().self_id.clone(),
                call_id: pending.call_id.clone(),
                responder_id: dialog.agent_id().to_string(),
                tellask_head: pending.tellask_head.clone(),
                response: content.to_string(),
                status,
                completed_at: Utc::now(),
            };
            let outcome = {
                let _txn = self.env.locks.lock_txn(&owner).await;
                match store.queues.supply_response(&owner, &response) {
                    Ok(outcome) => outcome,
                    Err(StoreError::Conflict(detail)) => return Err(EngineError::Invariant(detail)),
                    Err(e) => return Err(e.into()),
                }
            };
            delivered += 1;
            self.emit(DialogEvent::TeammateResponse {
                dialog_id: owner.clone(),
                subdialog_id: response.subdialog_id.clone(),
                responder_id: response.responder_id.clone(),
                call_id: response.call_id.clone(),
                response: response.response.clone(),
                status,
            });
            match self.loaded(&owner) {
                Some(target) if !target.is_locked() => {
                    if !target.has_tellask_result(&response.call_id) {
                        target.mirror_message(tellask_result_message(&response, dialog.id()));
                    }
                }
                Some(_) => debug!(owner = %owner, "owner is driving; response waits for its next generation"),
                None => warn!(owner = %owner, "response delivered to an unloaded dialog"),
            }
            if outcome.revive {
                self.wake_revival();
            }
        }
        Ok(delivered)
    }

    /// Take the queued responses of `dialog` for the generation about to
    /// start and add them to the in-memory transcript. They become durable
    /// only once the generation's bracket closes.
    pub(crate) fn take_responses(&self, dialog: &Dialog) -> Result<Vec<SubdialogResponse>, EngineError> {
        let responses = self.store().queues.take_responses(dialog.id())?;
        for response in &responses {
            if dialog.has_tellask_result(&response.call_id) {
                continue;
            }
            let from = DialogId::sub(dialog.id().root_id.clone(), response.subdialog_id.clone());
            dialog.mirror_message(tellask_result_message(response, &from));
        }
        Ok(responses)
    }

    /// A loaded dialog of a cached tree.
    pub(crate) fn loaded(&self, id: &DialogId) -> Option<Arc<Dialog>> {
        self.cached_tree(&id.root_id)?.lookup(&id.self_id)
    }
}
