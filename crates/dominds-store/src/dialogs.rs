use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use dominds_core::health::ContextHealthSnapshot;
use dominds_core::ids::DialogId;
use dominds_core::messages::PendingPrompt;
use dominds_core::run_state::{DialogRunState, DialogStatus};
use dominds_core::subdialog::AssignmentFromSup;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable identity of one dialog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogMeta {
    pub id: DialogId,
    pub agent_id: String,
    pub status: DialogStatus,
    pub assignment: Option<AssignmentFromSup>,
    pub task_doc: Option<String>,
    pub created_at: String,
}

/// The "latest" row: counters and flags that change every drive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogLatest {
    pub current_course: u32,
    pub last_genseq: u32,
    pub run_state: DialogRunState,
    pub diligence_remaining: u32,
    pub needs_drive: bool,
    pub up_next: Option<PendingPrompt>,
    pub context_health: Option<ContextHealthSnapshot>,
}

impl Default for DialogLatest {
    fn default() -> Self {
        Self {
            current_course: 1,
            last_genseq: 0,
            run_state: DialogRunState::IdleWaitingUser,
            diligence_remaining: 0,
            needs_drive: false,
            up_next: None,
            context_health: None,
        }
    }
}

pub struct DialogRepo {
    db: Database,
}

impl DialogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert metadata and a fresh latest row.
    #[instrument(skip(self, meta, latest), fields(dialog_id = %meta.id, agent_id = %meta.agent_id))]
    pub fn create(&self, meta: &DialogMeta, latest: &DialogLatest) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let assignment = meta.assignment.as_ref().map(serde_json::to_string).transpose()?;
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO dialogs (root_id, self_id, agent_id, status, assignment, task_doc, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    meta.id.root_id,
                    meta.id.self_id,
                    meta.agent_id,
                    meta.status.as_str(),
                    assignment,
                    meta.task_doc,
                    meta.created_at,
                    now,
                ],
            )?;
            tx.execute(
                "INSERT INTO dialog_latest (root_id, self_id, current_course, last_genseq, run_state,
                     diligence_remaining, needs_drive, up_next, context_health, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    meta.id.root_id,
                    meta.id.self_id,
                    latest.current_course,
                    latest.last_genseq,
                    serde_json::to_string(&latest.run_state)?,
                    latest.diligence_remaining,
                    latest.needs_drive,
                    latest.up_next.as_ref().map(serde_json::to_string).transpose()?,
                    latest.context_health.as_ref().map(serde_json::to_string).transpose()?,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(dialog_id = %id))]
    pub fn get(&self, id: &DialogId) -> Result<DialogMeta, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT d.root_id, d.self_id, d.agent_id, r.status, d.assignment, d.task_doc, d.created_at
                 FROM dialogs d JOIN dialogs r ON r.root_id = d.root_id AND r.self_id = d.root_id
                 WHERE d.root_id = ?1 AND d.self_id = ?2",
                rusqlite::params![id.root_id, id.self_id],
                |row| Ok(meta_from_row(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("dialog {id}")))?
        })
    }

    /// Every dialog of a tree, root first.
    pub fn list_tree(&self, root_id: &str) -> Result<Vec<DialogMeta>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.root_id, d.self_id, d.agent_id, r.status, d.assignment, d.task_doc, d.created_at
                 FROM dialogs d JOIN dialogs r ON r.root_id = d.root_id AND r.self_id = d.root_id
                 WHERE d.root_id = ?1
                 ORDER BY (d.self_id = d.root_id) DESC, d.created_at ASC",
            )?;
            let rows = stmt.query_map([root_id], |row| Ok(meta_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Tree status lives on the root row.
    pub fn set_status(&self, root_id: &str, status: DialogStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE dialogs SET status = ?1, updated_at = ?2 WHERE root_id = ?3 AND self_id = ?3",
                rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), root_id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("root dialog {root_id}")));
            }
            Ok(())
        })
    }

    pub fn latest(&self, id: &DialogId) -> Result<DialogLatest, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT current_course, last_genseq, run_state, diligence_remaining, needs_drive,
                        up_next, context_health
                 FROM dialog_latest WHERE root_id = ?1 AND self_id = ?2",
                rusqlite::params![id.root_id, id.self_id],
                |row| Ok(latest_from_row(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("latest for {id}")))?
        })
    }

    pub fn set_run_state(&self, id: &DialogId, state: &DialogRunState) -> Result<(), StoreError> {
        self.update_latest(id, "run_state", serde_json::to_string(state)?)
    }

    pub fn set_course(&self, id: &DialogId, course: u32) -> Result<(), StoreError> {
        self.update_latest(id, "current_course", course)
    }

    pub fn set_last_genseq(&self, id: &DialogId, genseq: u32) -> Result<(), StoreError> {
        self.update_latest(id, "last_genseq", genseq)
    }

    pub fn set_diligence_remaining(&self, id: &DialogId, remaining: u32) -> Result<(), StoreError> {
        self.update_latest(id, "diligence_remaining", remaining)
    }

    pub fn set_needs_drive(&self, id: &DialogId, needs_drive: bool) -> Result<(), StoreError> {
        self.update_latest(id, "needs_drive", needs_drive)
    }

    pub fn set_up_next(&self, id: &DialogId, prompt: Option<&PendingPrompt>) -> Result<(), StoreError> {
        self.update_latest(id, "up_next", prompt.map(serde_json::to_string).transpose()?)
    }

    pub fn set_context_health(
        &self,
        id: &DialogId,
        snapshot: Option<&ContextHealthSnapshot>,
    ) -> Result<(), StoreError> {
        self.update_latest(id, "context_health", snapshot.map(serde_json::to_string).transpose()?)
    }

    fn update_latest<V: rusqlite::ToSql>(
        &self,
        id: &DialogId,
        column: &'static str,
        value: V,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "UPDATE dialog_latest SET {column} = ?1, updated_at = ?2 WHERE root_id = ?3 AND self_id = ?4"
            );
            let n = conn.execute(
                &sql,
                rusqlite::params![value, Utc::now().to_rfc3339(), id.root_id, id.self_id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("latest for {id}")));
            }
            Ok(())
        })
    }

    /// Dialogs in running trees flagged for another drive.
    pub fn list_needing_drive(&self) -> Result<Vec<DialogId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT l.root_id, l.self_id FROM dialog_latest l
                 JOIN dialogs r ON r.root_id = l.root_id AND r.self_id = l.root_id
                 WHERE l.needs_drive = 1 AND r.status = 'running'
                 ORDER BY l.updated_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DialogId::sub(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Dialogs whose persisted run state claims a run is in flight.
    pub fn list_proceeding(&self) -> Result<Vec<DialogId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT root_id, self_id, run_state FROM dialog_latest",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (root, sub, raw) = row?;
                let state: DialogRunState = row_helpers::parse_json(&raw, "dialog_latest", "run_state")?;
                if state.is_proceeding() {
                    out.push(DialogId::sub(root, sub));
                }
            }
            Ok(out)
        })
    }

    pub fn register_session(&self, root_id: &str, session_key: &str, self_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO subdialog_sessions (root_id, session_key, self_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![root_id, session_key, self_id],
            )?;
            Ok(())
        })
    }

    pub fn list_sessions(&self, root_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_key, self_id FROM subdialog_sessions WHERE root_id = ?1 ORDER BY session_key",
            )?;
            let rows = stmt.query_map([root_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> Result<DialogMeta, StoreError> {
    let root_id: String = row_helpers::get(row, 0, "dialogs", "root_id")?;
    let self_id: String = row_helpers::get(row, 1, "dialogs", "self_id")?;
    let status_raw: String = row_helpers::get(row, 3, "dialogs", "status")?;
    let status = DialogStatus::parse(&status_raw).ok_or_else(|| StoreError::CorruptRow {
        table: "dialogs",
        column: "status",
        detail: format!("unknown variant: {status_raw}"),
    })?;
    Ok(DialogMeta {
        id: DialogId::sub(root_id, self_id),
        agent_id: row_helpers::get(row, 2, "dialogs", "agent_id")?,
        status,
        assignment: row_helpers::parse_json_opt(
            row_helpers::get(row, 4, "dialogs", "assignment")?,
            "dialogs",
            "assignment",
        )?,
        task_doc: row_helpers::get(row, 5, "dialogs", "task_doc")?,
        created_at: row_helpers::get(row, 6, "dialogs", "created_at")?,
    })
}

fn latest_from_row(row: &rusqlite::Row<'_>) -> Result<DialogLatest, StoreError> {
    let run_state: String = row_helpers::get(row, 2, "dialog_latest", "run_state")?;
    Ok(DialogLatest {
        current_course: row_helpers::get(row, 0, "dialog_latest", "current_course")?,
        last_genseq: row_helpers::get(row, 1, "dialog_latest", "last_genseq")?,
        run_state: row_helpers::parse_json(&run_state, "dialog_latest", "run_state")?,
        diligence_remaining: row_helpers::get(row, 3, "dialog_latest", "diligence_remaining")?,
        needs_drive: row_helpers::get(row, 4, "dialog_latest", "needs_drive")?,
        up_next: row_helpers::parse_json_opt(
            row_helpers::get(row, 5, "dialog_latest", "up_next")?,
            "dialog_latest",
            "up_next",
        )?,
        context_health: row_helpers::parse_json_opt(
            row_helpers::get(row, 6, "dialog_latest", "context_health")?,
            "dialog_latest",
            "context_health",
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dominds_core::run_state::InterruptReason;
    use dominds_core::subdialog::CallType;

    fn setup() -> DialogRepo {
        DialogRepo::new(Database::in_memory().unwrap())
    }

    fn root_meta(id: &str) -> DialogMeta {
        DialogMeta {
            id: DialogId::root(id),
            agent_id: "lead".into(),
            status: DialogStatus::Running,
            assignment: None,
            task_doc: Some("build it".into()),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn sub_meta(root: &str, sub: &str) -> DialogMeta {
        DialogMeta {
            id: DialogId::sub(root, sub),
            agent_id: "pangu".into(),
            status: DialogStatus::Running,
            assignment: Some(AssignmentFromSup {
                caller_dialog_id: DialogId::root(root),
                caller_agent_id: "lead".into(),
                call_id: "c1".into(),
                call_type: CallType::TellaskSessionless,
                tellask_head: "@pangu compute".into(),
                tellask_body: String::new(),
                tellask_session: None,
            }),
            task_doc: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn create_and_get_root() {
        let repo = setup();
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        let meta = repo.get(&DialogId::root("r1")).unwrap();
        assert_eq!(meta.agent_id, "lead");
        assert_eq!(meta.task_doc.as_deref(), Some("build it"));
        assert_eq!(meta.status, DialogStatus::Running);
    }

    #[test]
    fn get_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.get(&DialogId::root("nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn sub_inherits_root_status() {
        let repo = setup();
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        repo.create(&sub_meta("r1", "s1"), &DialogLatest::default()).unwrap();
        repo.set_status("r1", DialogStatus::Archived).unwrap();
        let sub = repo.get(&DialogId::sub("r1", "s1")).unwrap();
        assert_eq!(sub.status, DialogStatus::Archived);
        assert!(sub.assignment.is_some());
    }

    #[test]
    fn list_tree_root_first() {
        let repo = setup();
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        repo.create(&sub_meta("r1", "s1"), &DialogLatest::default()).unwrap();
        repo.create(&sub_meta("r1", "s2"), &DialogLatest::default()).unwrap();
        let tree = repo.list_tree("r1").unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree[0].id.is_root());
    }

    #[test]
    fn latest_updates_round_trip() {
        let repo = setup();
        let id = DialogId::root("r1");
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        repo.set_course(&id, 3).unwrap();
        repo.set_last_genseq(&id, 7).unwrap();
        repo.set_diligence_remaining(&id, 2).unwrap();
        repo.set_run_state(&id, &DialogRunState::interrupted(InterruptReason::UserStop))
            .unwrap();
        let prompt = PendingPrompt::human("next");
        repo.set_up_next(&id, Some(&prompt)).unwrap();

        let latest = repo.latest(&id).unwrap();
        assert_eq!(latest.current_course, 3);
        assert_eq!(latest.last_genseq, 7);
        assert_eq!(latest.diligence_remaining, 2);
        assert_eq!(latest.up_next, Some(prompt));
        assert!(latest.run_state.blocks_revival());
    }

    #[test]
    fn needs_drive_listing_skips_archived_trees() {
        let repo = setup();
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        repo.create(&root_meta("r2"), &DialogLatest::default()).unwrap();
        repo.set_needs_drive(&DialogId::root("r1"), true).unwrap();
        repo.set_needs_drive(&DialogId::root("r2"), true).unwrap();
        repo.set_status("r2", DialogStatus::Archived).unwrap();
        assert_eq!(repo.list_needing_drive().unwrap(), vec![DialogId::root("r1")]);
    }

    #[test]
    fn proceeding_listing() {
        let repo = setup();
        repo.create(&root_meta("r1"), &DialogLatest::default()).unwrap();
        repo.create(&root_meta("r2"), &DialogLatest::default()).unwrap();
        repo.set_run_state(&DialogId::root("r2"), &DialogRunState::Proceeding).unwrap();
        assert_eq!(repo.list_proceeding().unwrap(), vec![DialogId::root("r2")]);
    }

    #[test]
    fn sessions_registry() {
        let repo = setup();
        repo.register_session("r1", "pangu!design", "s1").unwrap();
        repo.register_session("r1", "pangu!design", "s2").unwrap();
        assert_eq!(
            repo.list_sessions("r1").unwrap(),
            vec![("pangu!design".to_string(), "s2".to_string())]
        );
    }
}
