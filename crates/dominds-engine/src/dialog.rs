//! In-memory dialogs.
//!
//! A tree has one root and any number of subdialogs. The root owns the
//! registry of its tree (strong references); a subdialog only keeps a weak
//! link to its root and finds its caller by id through that registry, so
//! there are no reference cycles and no owning back-pointers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use dominds_core::events::DialogEvent;
use dominds_core::health::ContextHealthSnapshot;
use dominds_core::ids::DialogId;
use dominds_core::messages::{ChatMessage, PendingPrompt};
use dominds_core::reminders::Reminder;
use dominds_core::run_state::DialogStatus;
use dominds_core::subdialog::{AssignmentFromSup, CallType};
use dominds_store::{CourseRecord, DialogLatest, DialogStore};

use crate::error::EngineError;
use crate::locks::{DialogLocks, DriveGuard};

/// What every dialog needs from the engine: the store, the event channel
/// and the lock registry.
#[derive(Clone)]
pub struct DialogEnv {
    pub store: Arc<DialogStore>,
    pub events: broadcast::Sender<DialogEvent>,
    pub locks: Arc<DialogLocks>,
}

impl DialogEnv {
    pub fn new(store: Arc<DialogStore>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            store,
            events,
            locks: Arc::new(DialogLocks::new()),
        }
    }

    pub fn emit(&self, event: DialogEvent) {
        let event_type = event.event_type();
        if self.events.send(event).is_err() {
            trace!(event_type, "no event receivers");
        }
    }
}

/// Whether the dialog was parked by a critical context and a human has
/// since told it to go on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Suspension {
    #[default]
    Active,
    Suspended,
    Resumed,
}

/// Course and sequence number of the generation in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenBracket {
    pub course: u32,
    pub genseq: u32,
}

#[derive(Clone, Debug, Default)]
pub struct DialogState {
    pub messages: Vec<ChatMessage>,
    pub reminders: Vec<Reminder>,
    pub reminders_ver: u64,
    pub current_course: u32,
    pub last_genseq: u32,
    pub generating: Option<GenBracket>,
    pub suspension: Suspension,
    pub diligence_remaining: u32,
    pub up_next: Option<PendingPrompt>,
    pub last_health: Option<ContextHealthSnapshot>,
    /// New course asked for by a tool; applied once the generation's calls
    /// are all paired.
    pub course_request: Option<PendingPrompt>,
}

impl DialogState {
    pub fn from_latest(latest: &DialogLatest, messages: Vec<ChatMessage>, reminders: (u64, Vec<Reminder>)) -> Self {
        Self {
            messages,
            reminders: reminders.1,
            reminders_ver: reminders.0,
            current_course: latest.current_course,
            last_genseq: latest.last_genseq,
            generating: None,
            suspension: Suspension::Active,
            diligence_remaining: latest.diligence_remaining,
            up_next: latest.up_next.clone(),
            last_health: latest.context_health.clone(),
            course_request: None,
        }
    }
}

pub struct RootParts {
    registry: RwLock<HashMap<String, Arc<Dialog>>>,
    sessions: RwLock<HashMap<String, String>>,
    status: Mutex<DialogStatus>,
    task_doc: Option<String>,
}

pub struct SubParts {
    root: Weak<Dialog>,
    assignment: AssignmentFromSup,
}

pub enum DialogKind {
    Root(RootParts),
    Sub(SubParts),
}

pub struct Dialog {
    id: DialogId,
    agent_id: String,
    kind: DialogKind,
    env: DialogEnv,
    state: Mutex<DialogState>,
}

impl std::fmt::Debug for Dialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialog")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// Registry key of a resumable subdialog.
pub fn session_key(agent_id: &str, session: &str) -> String {
    format!("{agent_id}!{session}")
}

impl Dialog {
    pub fn new_root(
        id: DialogId,
        agent_id: impl Into<String>,
        status: DialogStatus,
        task_doc: Option<String>,
        env: DialogEnv,
        state: DialogState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            agent_id: agent_id.into(),
            kind: DialogKind::Root(RootParts {
                registry: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                status: Mutex::new(status),
                task_doc,
            }),
            env,
            state: Mutex::new(state),
        })
    }

    /// Build a subdialog of `root`'s tree. Registration is separate.
    pub fn new_sub(
        root: &Arc<Dialog>,
        id: DialogId,
        agent_id: impl Into<String>,
        assignment: AssignmentFromSup,
        state: DialogState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            agent_id: agent_id.into(),
            kind: DialogKind::Sub(SubParts {
                root: Arc::downgrade(root),
                assignment,
            }),
            env: root.env.clone(),
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn kind(&self) -> &DialogKind {
        &self.kind
    }

    pub fn env(&self) -> &DialogEnv {
        &self.env
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, DialogKind::Root(_))
    }

    pub fn assignment(&self) -> Option<&AssignmentFromSup> {
        match &self.kind {
            DialogKind::Sub(sub) => Some(&sub.assignment),
            DialogKind::Root(_) => None,
        }
    }

    pub fn call_type(&self) -> Option<CallType> {
        self.assignment().map(|a| a.call_type)
    }

    pub fn task_doc(&self) -> Option<&str> {
        match &self.kind {
            DialogKind::Root(root) => root.task_doc.as_deref(),
            DialogKind::Sub(_) => None,
        }
    }

    pub fn emit(&self, event: DialogEvent) {
        self.env.emit(event);
    }

    // --- tree ---

    /// The root of this dialog's tree. `None` only if the root was dropped.
    pub fn root(self: &Arc<Self>) -> Option<Arc<Dialog>> {
        match &self.kind {
            DialogKind::Root(_) => Some(self.clone()),
            DialogKind::Sub(sub) => sub.root.upgrade(),
        }
    }

    fn root_parts(&self) -> Result<&RootParts, EngineError> {
        match &self.kind {
            DialogKind::Root(parts) => Ok(parts),
            DialogKind::Sub(_) => Err(EngineError::Invariant(format!(
                "{} is not a root dialog",
                self.id
            ))),
        }
    }

    /// Find a dialog of this tree by self id.
    pub fn lookup(self: &Arc<Self>, self_id: &str) -> Option<Arc<Dialog>> {
        let root = self.root()?;
        if root.id.self_id == self_id {
            return Some(root);
        }
        let parts = root.root_parts().ok()?;
        let found = parts.registry.read().get(self_id).cloned();
        found
    }

    pub fn register_subdialog(&self, sub: Arc<Dialog>) -> Result<(), EngineError> {
        let parts = self.root_parts()?;
        if sub.id.root_id != self.id.root_id {
            return Err(EngineError::Invariant(format!(
                "subdialog {} does not belong to tree {}",
                sub.id, self.id
            )));
        }
        parts.registry.write().insert(sub.id.self_id.clone(), sub);
        Ok(())
    }

    /// Every subdialog of this tree.
    pub fn subdialogs(&self) -> Vec<Arc<Dialog>> {
        match &self.kind {
            DialogKind::Root(parts) => parts.registry.read().values().cloned().collect(),
            DialogKind::Sub(_) => Vec::new(),
        }
    }

    pub fn session_subdialog(self: &Arc<Self>, key: &str) -> Option<Arc<Dialog>> {
        let root = self.root()?;
        let self_id = root.root_parts().ok()?.sessions.read().get(key).cloned()?;
        root.lookup(&self_id)
    }

    pub fn register_session(&self, key: &str, self_id: &str) -> Result<(), EngineError> {
        self.root_parts()?
            .sessions
            .write()
            .insert(key.to_string(), self_id.to_string());
        Ok(())
    }

    /// The dialog this subdialog answers to.
    ///
    /// Resolved through the root registry each time. If the caller is not
    /// loaded the root stands in, and a `SupdialogFallback` event is emitted
    /// so the misrouting is visible.
    pub fn supdialog(self: &Arc<Self>) -> Option<Arc<Dialog>> {
        let DialogKind::Sub(sub) = &self.kind else {
            return None;
        };
        let root = sub.root.upgrade()?;
        let caller = &sub.assignment.caller_dialog_id;
        if let Some(found) = root.lookup(&caller.self_id) {
            return Some(found);
        }
        warn!(
            dialog_id = %self.id,
            caller_dialog_id = %caller,
            "supdialog not in registry, falling back to root"
        );
        self.emit(DialogEvent::SupdialogFallback {
            dialog_id: self.id.clone(),
            caller_dialog_id: caller.clone(),
        });
        Some(root)
    }

    pub fn status(self: &Arc<Self>) -> DialogStatus {
        self.root()
            .and_then(|root| root.root_parts().ok().map(|p| *p.status.lock()))
            .unwrap_or(DialogStatus::Archived)
    }

    pub fn set_status(&self, status: DialogStatus) -> Result<(), EngineError> {
        let parts = self.root_parts()?;
        self.env.store.dialogs.set_status(&self.id.root_id, status)?;
        *parts.status.lock() = status;
        Ok(())
    }

    // --- concurrency gate ---

    pub async fn acquire(&self) -> DriveGuard {
        self.env.locks.acquire(&self.id).await
    }

    pub fn is_locked(&self) -> bool {
        self.env.locks.is_locked(&self.id)
    }

    pub fn has_pending_q4h(&self) -> Result<bool, EngineError> {
        Ok(self.env.store.queues.count_questions(&self.id)? > 0)
    }

    pub fn has_pending_subdialogs(&self) -> Result<bool, EngineError> {
        Ok(self.env.store.queues.count_pending(&self.id)? > 0)
    }

    /// Nothing to wait for: no open question and no teammate outstanding.
    pub fn can_drive(&self) -> Result<bool, EngineError> {
        Ok(!self.has_pending_q4h()? && !self.has_pending_subdialogs()?)
    }

    // --- transcript ---

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    pub fn current_course(&self) -> u32 {
        self.state.lock().current_course
    }

    pub fn last_genseq(&self) -> u32 {
        self.state.lock().last_genseq
    }

    /// Persist a message to the current course, then add it to memory.
    pub fn append_message(&self, message: ChatMessage) -> Result<(), EngineError> {
        let course = self.current_course();
        self.env
            .store
            .courses
            .append(&self.id, course, &CourseRecord::message(message.clone()))?;
        self.state.lock().messages.push(message);
        Ok(())
    }

    /// Add a message to memory only; the durable copy is written later.
    pub fn mirror_message(&self, message: ChatMessage) {
        self.state.lock().messages.push(message);
    }

    pub fn has_tellask_result(&self, call_id: &str) -> bool {
        self.state.lock().messages.iter().any(|m| {
            matches!(m, ChatMessage::TellaskResult { call_id: id, .. } if id == call_id)
        })
    }

    // --- reminders ---

    pub fn reminders(&self) -> Vec<Reminder> {
        self.state.lock().reminders.clone()
    }

    pub fn reminders_version(&self) -> u64 {
        self.state.lock().reminders_ver
    }

    /// Insert at `position` (clamped), or append.
    pub fn add_reminder(&self, reminder: Reminder, position: Option<usize>) -> u64 {
        self.mutate_reminders(|list| {
            let at = position.unwrap_or(list.len()).min(list.len());
            list.insert(at, reminder);
            Ok(())
        })
        .unwrap_or_default()
    }

    pub fn update_reminder(&self, index: usize, content: impl Into<String>) -> Result<u64, EngineError> {
        let content = content.into();
        self.mutate_reminders(|list| {
            let len = list.len();
            let slot = list
                .get_mut(index)
                .ok_or(EngineError::ReminderIndex { index: index + 1, len })?;
            slot.content = content;
            Ok(())
        })
    }

    pub fn delete_reminder(&self, index: usize) -> Result<u64, EngineError> {
        self.mutate_reminders(|list| {
            if index >= list.len() {
                return Err(EngineError::ReminderIndex {
                    index: index + 1,
                    len: list.len(),
                });
            }
            list.remove(index);
            Ok(())
        })
    }

    pub fn clear_reminders(&self) -> u64 {
        self.mutate_reminders(|list| {
            list.clear();
            Ok(())
        })
        .unwrap_or_default()
    }

    /// Replace the whole list (owner refresh).
    pub fn replace_reminders(&self, reminders: Vec<Reminder>) -> u64 {
        self.mutate_reminders(|list| {
            *list = reminders;
            Ok(())
        })
        .unwrap_or_default()
    }

    /// Apply a structural change, bump the version and publish the list.
    /// Persistence here is best-effort.
    fn mutate_reminders<F>(&self, f: F) -> Result<u64, EngineError>
    where
        F: FnOnce(&mut Vec<Reminder>) -> Result<(), EngineError>,
    {
        let (version, snapshot) = {
            let mut st = self.state.lock();
            f(&mut st.reminders)?;
            st.reminders_ver += 1;
            (st.reminders_ver, st.reminders.clone())
        };
        if let Err(e) = self.env.store.reminders.save(&self.id, version, &snapshot) {
            warn!(dialog_id = %self.id, error = %e, "failed to persist reminders");
        }
        self.emit(DialogEvent::RemindersUpdated {
            dialog_id: self.id.clone(),
            version,
            reminders: snapshot,
        });
        Ok(version)
    }

    // --- prompts and budgets ---

    pub fn up_next(&self) -> Option<PendingPrompt> {
        self.state.lock().up_next.clone()
    }

    pub fn has_up_next(&self) -> bool {
        self.state.lock().up_next.is_some()
    }

    /// Queue a prompt for the next generation. A prompt already waiting is
    /// kept and the new text appended to it.
    pub fn queue_up_next(&self, prompt: PendingPrompt) -> Result<(), EngineError> {
        let merged = {
            let st = self.state.lock();
            match &st.up_next {
                Some(existing) => PendingPrompt {
                    content: format!("{}\n\n{}", existing.content, prompt.content),
                    ..existing.clone()
                },
                None => prompt,
            }
        };
        self.set_up_next(Some(merged))
    }

    pub fn take_up_next(&self) -> Result<Option<PendingPrompt>, EngineError> {
        let taken = self.state.lock().up_next.clone();
        if taken.is_some() {
            self.set_up_next(None)?;
        }
        Ok(taken)
    }

    fn set_up_next(&self, prompt: Option<PendingPrompt>) -> Result<(), EngineError> {
        self.env.store.dialogs.set_up_next(&self.id, prompt.as_ref())?;
        self.state.lock().up_next = prompt;
        Ok(())
    }

    pub fn diligence_remaining(&self) -> u32 {
        self.state.lock().diligence_remaining
    }

    pub fn set_diligence_remaining(&self, remaining: u32) -> Result<(), EngineError> {
        self.env
            .store
            .dialogs
            .set_diligence_remaining(&self.id, remaining)?;
        self.state.lock().diligence_remaining = remaining;
        Ok(())
    }

    pub fn suspension(&self) -> Suspension {
        self.state.lock().suspension
    }

    pub fn set_suspension(&self, suspension: Suspension) {
        self.state.lock().suspension = suspension;
    }

    pub fn last_health(&self) -> Option<ContextHealthSnapshot> {
        self.state.lock().last_health.clone()
    }

    // --- courses ---

    /// Ask for a new course once the current generation is settled. A
    /// later request in the same generation replaces an earlier one.
    pub fn request_new_course(&self, prompt: PendingPrompt) {
        self.state.lock().course_request = Some(prompt);
    }

    pub fn take_course_request(&self) -> Option<PendingPrompt> {
        self.state.lock().course_request.take()
    }

    /// Close the current course and open the next one.
    ///
    /// The transcript and any queued prompt are dropped. A subdialog gets
    /// its original assignment in front of `prompt` so it still knows what
    /// it was asked.
    pub fn start_new_course(&self, prompt: PendingPrompt) -> Result<u32, EngineError> {
        let course = self.current_course() + 1;
        self.env.store.dialogs.set_course(&self.id, course)?;
        self.env
            .store
            .courses
            .append(&self.id, course, &CourseRecord::CourseStart)?;
        {
            let mut st = self.state.lock();
            st.messages.clear();
            st.up_next = None;
            st.course_request = None;
            st.current_course = course;
        }
        let next = match self.assignment() {
            Some(assignment) => PendingPrompt {
                content: format!("{}\n\n---\n\n{}", assignment.render(), prompt.content),
                ..prompt
            },
            None => prompt,
        };
        self.set_up_next(Some(next))?;
        debug!(dialog_id = %self.id, course, "new course started");
        self.emit(DialogEvent::CourseStarted {
            dialog_id: self.id.clone(),
            course,
        });
        Ok(course)
    }

    // --- generation bracketing ---

    /// Allocate the next generation sequence number and open the bracket.
    /// The course is snapshotted here, so tools that start a new course
    /// mid-generation do not move it.
    pub fn notify_generating_start(&self) -> Result<GenBracket, EngineError> {
        let bracket = {
            let st = self.state.lock();
            if let Some(open) = st.generating {
                return Err(EngineError::Invariant(format!(
                    "{} is already generating genseq {}",
                    self.id, open.genseq
                )));
            }
            GenBracket {
                course: st.current_course,
                genseq: st.last_genseq + 1,
            }
        };
        let store = &self.env.store;
        store.dialogs.set_last_genseq(&self.id, bracket.genseq)?;
        store.courses.append(
            &self.id,
            bracket.course,
            &CourseRecord::GenStart {
                genseq: bracket.genseq,
            },
        )?;
        {
            let mut st = self.state.lock();
            st.last_genseq = bracket.genseq;
            st.generating = Some(bracket);
        }
        self.emit(DialogEvent::GeneratingStart {
            dialog_id: self.id.clone(),
            course: bracket.course,
            genseq: bracket.genseq,
        });
        Ok(bracket)
    }

    /// Close the bracket. Runs on every path, so it only logs failures.
    pub fn notify_generating_finish(
        &self,
        bracket: GenBracket,
        context_health: Option<ContextHealthSnapshot>,
        model: Option<String>,
    ) {
        {
            let mut st = self.state.lock();
            st.generating = None;
            if context_health.is_some() {
                st.last_health = context_health.clone();
            }
        }
        let store = &self.env.store;
        let record = CourseRecord::GenFinish {
            genseq: bracket.genseq,
            context_health: context_health.clone(),
        };
        if let Err(e) = store.courses.append(&self.id, bracket.course, &record) {
            warn!(dialog_id = %self.id, genseq = bracket.genseq, error = %e, "failed to persist gen finish");
        }
        if let Some(health) = &context_health {
            if let Err(e) = store.dialogs.set_context_health(&self.id, Some(health)) {
                warn!(dialog_id = %self.id, error = %e, "failed to persist context health");
            }
        }
        self.emit(DialogEvent::GeneratingFinish {
            dialog_id: self.id.clone(),
            course: bracket.course,
            genseq: bracket.genseq,
            context_health,
            model,
        });
    }

    pub fn is_generating(&self) -> bool {
        self.state.lock().generating.is_some()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use dominds_store::DialogMeta;

    pub fn env() -> DialogEnv {
        DialogEnv::new(Arc::new(DialogStore::in_memory().unwrap()), 256)
    }

    pub fn persisted_root(env: &DialogEnv, root_id: &str, agent: &str) -> Arc<Dialog> {
        let id = DialogId::root(root_id);
        env.store
            .dialogs
            .create(
                &DialogMeta {
                    id: id.clone(),
                    agent_id: agent.into(),
                    status: DialogStatus::Running,
                    assignment: None,
                    task_doc: None,
                    created_at: Utc::now().to_rfc3339(),
                },
                &DialogLatest::default(),
            )
            .unwrap();
        Dialog::new_root(
            id,
            agent,
            DialogStatus::Running,
            None,
            env.clone(),
            DialogState {
                current_course: 1,
                ..DialogState::default()
            },
        )
    }

    pub fn assignment(caller: &DialogId, call_id: &str) -> AssignmentFromSup {
        AssignmentFromSup {
            caller_dialog_id: caller.clone(),
            caller_agent_id: "lead".into(),
            call_id: call_id.into(),
            call_type: CallType::TellaskSessionless,
            tellask_head: "@pangu compute 1+1".into(),
            tellask_body: " return only the number\n".into(),
            tellask_session: None,
        }
    }

    pub fn persisted_sub(parent: &Arc<Dialog>, self_id: &str, assignment: AssignmentFromSup) -> Arc<Dialog> {
        let root = parent.root().unwrap();
        let id = DialogId::sub(root.id().root_id.clone(), self_id);
        root.env()
            .store
            .dialogs
            .create(
                &DialogMeta {
                    id: id.clone(),
                    agent_id: "pangu".into(),
                    status: DialogStatus::Running,
                    assignment: Some(assignment.clone()),
                    task_doc: None,
                    created_at: Utc::now().to_rfc3339(),
                },
                &DialogLatest::default(),
            )
            .unwrap();
        let sub = Dialog::new_sub(
            &root,
            id,
            "pangu",
            assignment,
            DialogState {
                current_course: 1,
                ..DialogState::default()
            },
        );
        root.register_subdialog(sub.clone()).unwrap();
        sub
    }
}
