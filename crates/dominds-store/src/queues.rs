//! Per-dialog waiting queues: questions for the human, pending subdialog
//! calls and the responses that settle them.
//!
//! A response moves `queued -> taken -> (deleted | queued)`: the driver takes
//! responses when it builds a generation, commits them once the generation
//! persisted and rolls them back when the run is interrupted.

use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use dominds_core::ids::DialogId;
use dominds_core::subdialog::{HumanQuestion, PendingSubdialog, SubdialogResponse};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Drop `owner`'s taken responses on `conn`, which may be an open
/// transaction.
pub(crate) fn commit_taken_on(conn: &rusqlite::Connection, owner: &DialogId) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM subdialog_responses WHERE root_id = ?1 AND owner_id = ?2 AND state = 'taken'",
        rusqlite::params![owner.root_id, owner.self_id],
    )?)
}

/// Result of delivering a response to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupplyOutcome {
    /// The caller has nothing left to wait for and was flagged for a drive.
    pub revive: bool,
}

pub struct QueueRepo {
    db: Database,
}

impl QueueRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // --- questions for the human ---

    #[instrument(skip(self, question), fields(dialog_id = %question.dialog_id, question_id = %question.id))]
    pub fn add_question(&self, question: &HumanQuestion) -> Result<(), StoreError> {
        let record = serde_json::to_string(question)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO q4h (question_id, root_id, self_id, record) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    question.id.as_str(),
                    question.dialog_id.root_id,
                    question.dialog_id.self_id,
                    record,
                ],
            )?;
            Ok(())
        })
    }

    /// Remove a question, returning it if it was still open.
    #[instrument(skip(self))]
    pub fn remove_question(&self, question_id: &str) -> Result<Option<HumanQuestion>, StoreError> {
        self.db.with_tx(|tx| {
            let raw: Option<String> = tx
                .query_row(
                    "SELECT record FROM q4h WHERE question_id = ?1",
                    [question_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            tx.execute("DELETE FROM q4h WHERE question_id = ?1", [question_id])?;
            Ok(Some(row_helpers::parse_json(&raw, "q4h", "record")?))
        })
    }

    pub fn list_questions(&self, id: &DialogId) -> Result<Vec<HumanQuestion>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM q4h WHERE root_id = ?1 AND self_id = ?2 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![id.root_id, id.self_id], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(row_helpers::parse_json(&raw?, "q4h", "record")?);
            }
            Ok(out)
        })
    }

    /// Open questions across a whole tree.
    pub fn list_questions_in_tree(&self, root_id: &str) -> Result<Vec<HumanQuestion>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT record FROM q4h WHERE root_id = ?1 ORDER BY rowid ASC")?;
            let rows = stmt.query_map([root_id], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(row_helpers::parse_json(&raw?, "q4h", "record")?);
            }
            Ok(out)
        })
    }

    pub fn count_questions(&self, id: &DialogId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM q4h WHERE root_id = ?1 AND self_id = ?2",
                rusqlite::params![id.root_id, id.self_id],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    // --- pending subdialog calls ---

    #[instrument(skip(self, record), fields(owner = %owner, call_id = %record.call_id, subdialog_id = %record.subdialog_id))]
    pub fn add_pending(&self, owner: &DialogId, record: &PendingSubdialog) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_subdialogs (root_id, owner_id, call_id, subdialog_id, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![owner.root_id, owner.self_id, record.call_id, record.subdialog_id, json],
            )?;
            Ok(())
        })
    }

    pub fn list_pending(&self, owner: &DialogId) -> Result<Vec<PendingSubdialog>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM pending_subdialogs WHERE root_id = ?1 AND owner_id = ?2 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![owner.root_id, owner.self_id], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(row_helpers::parse_json(&raw?, "pending_subdialogs", "record")?);
            }
            Ok(out)
        })
    }

    /// Every (owner, record) waiting on `subdialog_id` inside a tree.
    pub fn pending_targeting(
        &self,
        root_id: &str,
        subdialog_id: &str,
    ) -> Result<Vec<(DialogId, PendingSubdialog)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_id, record FROM pending_subdialogs
                 WHERE root_id = ?1 AND subdialog_id = ?2 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map([root_id, subdialog_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (owner, raw) = row?;
                out.push((
                    DialogId::sub(root_id, owner),
                    row_helpers::parse_json(&raw, "pending_subdialogs", "record")?,
                ));
            }
            Ok(out)
        })
    }

    pub fn count_pending(&self, owner: &DialogId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_subdialogs WHERE root_id = ?1 AND owner_id = ?2",
                rusqlite::params![owner.root_id, owner.self_id],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Drop a pending record without delivering anything. Returns whether
    /// a row was removed.
    pub fn delete_pending(&self, owner: &DialogId, call_id: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM pending_subdialogs WHERE root_id = ?1 AND owner_id = ?2 AND call_id = ?3",
                rusqlite::params![owner.root_id, owner.self_id, call_id],
            )?;
            Ok(n > 0)
        })
    }

    // --- responses ---

    /// Deliver a response to `owner` in one transaction: remove the matching
    /// pending record, queue the response and, when the owner waits on
    /// nothing else, flag it for a drive.
    ///
    /// Fails with [`StoreError::Conflict`] when no pending record matches, so
    /// a replayed delivery never queues a duplicate.
    #[instrument(skip(self, response), fields(owner = %owner, call_id = %response.call_id))]
    pub fn supply_response(
        &self,
        owner: &DialogId,
        response: &SubdialogResponse,
    ) -> Result<SupplyOutcome, StoreError> {
        let record = serde_json::to_string(response)?;
        self.db.with_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM pending_subdialogs
                 WHERE root_id = ?1 AND owner_id = ?2 AND call_id = ?3 AND subdialog_id = ?4",
                rusqlite::params![owner.root_id, owner.self_id, response.call_id, response.subdialog_id],
            )?;
            if removed == 0 {
                return Err(StoreError::Conflict(format!(
                    "no pending subdialog {} for call {} on {owner}",
                    response.subdialog_id, response.call_id
                )));
            }
            tx.execute(
                "INSERT INTO subdialog_responses (root_id, owner_id, call_id, record, state)
                 VALUES (?1, ?2, ?3, ?4, 'queued')",
                rusqlite::params![owner.root_id, owner.self_id, response.call_id, record],
            )?;
            let pending: i64 = tx.query_row(
                "SELECT COUNT(*) FROM pending_subdialogs WHERE root_id = ?1 AND owner_id = ?2",
                rusqlite::params![owner.root_id, owner.self_id],
                |row| row.get(0),
            )?;
            let questions: i64 = tx.query_row(
                "SELECT COUNT(*) FROM q4h WHERE root_id = ?1 AND self_id = ?2",
                rusqlite::params![owner.root_id, owner.self_id],
                |row| row.get(0),
            )?;
            let revive = pending == 0 && questions == 0;
            if revive {
                tx.execute(
                    "UPDATE dialog_latest SET needs_drive = 1, updated_at = ?1
                     WHERE root_id = ?2 AND self_id = ?3",
                    rusqlite::params![Utc::now().to_rfc3339(), owner.root_id, owner.self_id],
                )?;
            }
            debug!(pending, questions, revive, "response queued");
            Ok(SupplyOutcome { revive })
        })
    }

    /// Mark every queued response of `owner` as taken and return them in
    /// arrival order.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn take_responses(&self, owner: &DialogId) -> Result<Vec<SubdialogResponse>, StoreError> {
        self.db.with_tx(|tx| {
            let raws: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT record FROM subdialog_responses
                     WHERE root_id = ?1 AND owner_id = ?2 AND state = 'queued' ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![owner.root_id, owner.self_id], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect::<Result<_, _>>()?
            };
            tx.execute(
                "UPDATE subdialog_responses SET state = 'taken'
                 WHERE root_id = ?1 AND owner_id = ?2 AND state = 'queued'",
                rusqlite::params![owner.root_id, owner.self_id],
            )?;
            raws.iter()
                .map(|raw| row_helpers::parse_json(raw, "subdialog_responses", "record"))
                .collect()
        })
    }

    /// Delete the responses taken by the generation that just persisted.
    pub fn commit_taken(&self, owner: &DialogId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| commit_taken_on(conn, owner))
    }

    /// Put taken responses back in the queue.
    pub fn rollback_taken(&self, owner: &DialogId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE subdialog_responses SET state = 'queued'
                 WHERE root_id = ?1 AND owner_id = ?2 AND state = 'taken'",
                rusqlite::params![owner.root_id, owner.self_id],
            )?)
        })
    }

    /// Startup recovery: nothing can be mid-generation after a restart.
    pub fn rollback_all_taken(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE subdialog_responses SET state = 'queued' WHERE state = 'taken'",
                [],
            )?)
        })
    }

    pub fn queued_responses(&self, owner: &DialogId) -> Result<Vec<SubdialogResponse>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM subdialog_responses
                 WHERE root_id = ?1 AND owner_id = ?2 AND state = 'queued' ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![owner.root_id, owner.self_id], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(row_helpers::parse_json(&raw?, "subdialog_responses", "record")?);
            }
            Ok(out)
        })
    }
}
