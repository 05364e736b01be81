use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use dominds_core::ids::DialogId;
use dominds_core::reminders::Reminder;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ReminderRepo {
    db: Database,
}

impl ReminderRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replace the reminder list of a dialog.
    #[instrument(skip(self, items), fields(dialog_id = %id, version, count = items.len()))]
    pub fn save(&self, id: &DialogId, version: u64, items: &[Reminder]) -> Result<(), StoreError> {
        let json = serde_json::to_string(items)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reminders (root_id, self_id, version, items, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(root_id, self_id) DO UPDATE SET
                     version = excluded.version, items = excluded.items, updated_at = excluded.updated_at",
                rusqlite::params![id.root_id, id.self_id, version as i64, json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Version and items; an unsaved dialog has version 0 and no items.
    pub fn load(&self, id: &DialogId) -> Result<(u64, Vec<Reminder>), StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, items FROM reminders WHERE root_id = ?1 AND self_id = ?2",
                    rusqlite::params![id.root_id, id.self_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((version, items)) => Ok((
                    version as u64,
                    row_helpers::parse_json(&items, "reminders", "items")?,
                )),
                None => Ok((0, Vec::new())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_is_empty() {
        let repo = ReminderRepo::new(Database::in_memory().unwrap());
        assert_eq!(repo.load(&DialogId::root("r")).unwrap(), (0, vec![]));
    }

    #[test]
    fn save_overwrites() {
        let repo = ReminderRepo::new(Database::in_memory().unwrap());
        let id = DialogId::root("r");
        repo.save(&id, 1, &[Reminder::new("a")]).unwrap();
        repo.save(&id, 2, &[Reminder::new("a"), Reminder::new("b").owned_by("tool")])
            .unwrap();
        let (version, items) = repo.load(&id).unwrap();
        assert_eq!(version, 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].owner.as_deref(), Some("tool"));
    }
}
