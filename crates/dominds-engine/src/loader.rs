//! Create root dialogs and rebuild trees from the store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use dominds_core::ids::DialogId;
use dominds_core::run_state::DialogStatus;
use dominds_store::{CourseRecord, DialogLatest, DialogMeta};

use crate::dialog::{Dialog, DialogState};
use crate::engine::Engine;
use crate::error::EngineError;

impl Engine {
    /// The dialog with `id`, loading its tree on first use.
    pub fn dialog(&self, id: &DialogId) -> Result<Arc<Dialog>, EngineError> {
        let root = match self.cached_tree(&id.root_id) {
            Some(root) => root,
            None => self.load_tree(&id.root_id)?,
        };
        root.lookup(&id.self_id)
            .ok_or_else(|| EngineError::DialogNotFound(id.clone()))
    }

    /// Persist a new root dialog (course 1) and cache it.
    #[instrument(skip(self, task_doc))]
    pub fn create_root_dialog(&self, agent_id: &str, task_doc: Option<String>) -> Result<Arc<Dialog>, EngineError> {
        self.check_agent(agent_id)?;
        let id = DialogId::new_root();
        let meta = DialogMeta {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            status: DialogStatus::Running,
            assignment: None,
            task_doc: task_doc.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        let latest = DialogLatest {
            diligence_remaining: self.diligence_budget(agent_id),
            ..DialogLatest::default()
        };
        let store = self.store();
        store.dialogs.create(&meta, &latest)?;
        store.courses.append(&id, latest.current_course, &CourseRecord::CourseStart)?;

        let root = Dialog::new_root(
            id,
            agent_id,
            DialogStatus::Running,
            task_doc,
            self.env.clone(),
            DialogState::from_latest(&latest, Vec::new(), (0, Vec::new())),
        );
        info!(dialog_id = %root.id(), agent_id, "root dialog created");
        Ok(self.cache_tree(root))
    }

    #[instrument(skip(self))]
    pub(crate) fn load_tree(&self, root_id: &str) -> Result<Arc<Dialog>, EngineError> {
        let store = self.store();
        let metas = store.dialogs.list_tree(root_id)?;
        let Some((root_meta, subs)) = metas.split_first() else {
            return Err(EngineError::DialogNotFound(DialogId::root(root_id)));
        };
        if !root_meta.id.is_root() {
            return Err(EngineError::Invariant(format!(
                "tree {root_id} has no root row"
            )));
        }

        let root = Dialog::new_root(
            root_meta.id.clone(),
            root_meta.agent_id.clone(),
            root_meta.status,
            root_meta.task_doc.clone(),
            self.env.clone(),
            self.restore_state(&root_meta.id)?,
        );

        for meta in subs {
            let Some(assignment) = meta.assignment.clone() else {
                warn!(dialog_id = %meta.id, "subdialog without assignment skipped");
                continue;
            };
            let sub = Dialog::new_sub(
                &root,
                meta.id.clone(),
                meta.agent_id.clone(),
                assignment,
                self.restore_state(&meta.id)?,
            );
            root.register_subdialog(sub)?;
        }

        for (key, self_id) in store.dialogs.list_sessions(root_id)? {
            root.register_session(&key, &self_id)?;
        }

        debug!(subdialogs = subs.len(), "tree loaded");
        Ok(self.cache_tree(root))
    }

    fn restore_state(&self, id: &DialogId) -> Result<DialogState, EngineError> {
        let store = self.store();
        let latest = store.dialogs.latest(id)?;
        let messages = store.courses.messages(id, latest.current_course)?;
        let reminders = store.reminders.load(id)?;
        let unresolved = self.owners.unresolved(&reminders.1);
        if !unresolved.is_empty() {
            warn!(dialog_id = %id, owners = ?unresolved, "reminders reference unknown owners");
        }
        Ok(DialogState::from_latest(&latest, messages, reminders))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::testing::{engine_on, pangu_team};
    use dominds_core::messages::PendingPrompt;
    use dominds_core::reminders::Reminder;
    use dominds_llm::ScriptedGenerator;
    use dominds_store::DialogStore;

    #[tokio::test]
    async fn reload_restores_tree_and_state() {
        let store = Arc::new(DialogStore::in_memory().unwrap());
        let engine = engine_on(store.clone(), pangu_team(), Arc::new(ScriptedGenerator::new(Vec::new())));
        let root = engine
            .create_root_dialog("lead", Some("ship it".into()))
            .unwrap();
        root.add_reminder(Reminder::new("keep going"), None);
        root.queue_up_next(PendingPrompt::human("hi")).unwrap();

        let fresh = engine_on(store, pangu_team(), Arc::new(ScriptedGenerator::new(Vec::new())));
        let loaded = fresh.dialog(root.id()).unwrap();
        assert_eq!(loaded.agent_id(), "lead");
        assert_eq!(loaded.task_doc(), Some("ship it"));
        assert_eq!(loaded.reminders().len(), 1);
        assert_eq!(loaded.up_next().map(|p| p.content), Some("hi".to_string()));
        assert_eq!(loaded.current_course(), 1);
        assert!(Arc::ptr_eq(&loaded, &fresh.dialog(root.id()).unwrap()));
    }

    #[test]
    fn unknown_tree_is_not_found() {
        let engine = engine_on(
            Arc::new(DialogStore::in_memory().unwrap()),
            pangu_team(),
            Arc::new(ScriptedGenerator::new(Vec::new())),
        );
        let err = engine.dialog(&dominds_core::ids::DialogId::root("nope")).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::DialogNotFound(_)));
    }
}
