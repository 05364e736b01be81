use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use dominds_core::health::ContextHealthSnapshot;
use dominds_core::ids::DialogId;
use dominds_core::messages::ChatMessage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One durable entry of a dialog course.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum CourseRecord {
    CourseStart,
    Message { message: ChatMessage },
    GenStart { genseq: u32 },
    GenFinish {
        genseq: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_health: Option<ContextHealthSnapshot>,
    },
}

impl CourseRecord {
    pub fn message(message: ChatMessage) -> Self {
        Self::Message { message }
    }

    pub fn record_type(&self) -> &'static str {
        match self {
            Self::CourseStart => "course_start",
            Self::Message { message } => message.message_type(),
            Self::GenStart { .. } => "gen_start",
            Self::GenFinish { .. } => "gen_finish",
        }
    }
}

/// A stored course record row.
#[derive(Clone, Debug, PartialEq)]
pub struct CourseEventRow {
    pub seq: i64,
    pub course: u32,
    pub record: CourseRecord,
    pub timestamp: String,
}

pub struct CourseEventRepo {
    db: Database,
}

impl CourseEventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, record), fields(dialog_id = %id, course, record_type = record.record_type()))]
    pub fn append(&self, id: &DialogId, course: u32, record: &CourseRecord) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| insert_record(conn, id, course, record))
    }

    /// Records of one course in append order.
    #[instrument(skip(self), fields(dialog_id = %id, course))]
    pub fn list(&self, id: &DialogId, course: u32) -> Result<Vec<CourseEventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, course, payload, timestamp FROM course_events
                 WHERE root_id = ?1 AND self_id = ?2 AND course = ?3
                 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![id.root_id, id.self_id, course])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row_helpers::get(row, 2, "course_events", "payload")?;
                out.push(CourseEventRow {
                    seq: row_helpers::get(row, 0, "course_events", "id")?,
                    course: row_helpers::get(row, 1, "course_events", "course")?,
                    record: row_helpers::parse_json(&payload, "course_events", "payload")?,
                    timestamp: row_helpers::get(row, 3, "course_events", "timestamp")?,
                });
            }
            Ok(out)
        })
    }

    /// The chat messages of one course, in order.
    pub fn messages(&self, id: &DialogId, course: u32) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .list(id, course)?
            .into_iter()
            .filter_map(|row| match row.record {
                CourseRecord::Message { message } => Some(message),
                _ => None,
            })
            .collect())
    }

    pub fn count(&self, id: &DialogId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM course_events WHERE root_id = ?1 AND self_id = ?2",
                rusqlite::params![id.root_id, id.self_id],
                |row| row.get(0),
            )?)
        })
    }
}

/// Insert one record on an open connection or transaction.
pub(crate) fn insert_record(
    conn: &rusqlite::Connection,
    id: &DialogId,
    course: u32,
    record: &CourseRecord,
) -> Result<i64, StoreError> {
    let payload = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO course_events (root_id, self_id, course, type, payload, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.root_id,
            id.self_id,
            course,
            record.record_type(),
            payload,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dominds_core::messages::PendingPrompt;

    fn setup() -> CourseEventRepo {
        CourseEventRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn append_and_list_in_order() {
        let repo = setup();
        let id = DialogId::root("r1");
        repo.append(&id, 1, &CourseRecord::CourseStart).unwrap();
        repo.append(&id, 1, &CourseRecord::message(ChatMessage::prompting(&PendingPrompt::human("hi"))))
            .unwrap();
        repo.append(&id, 1, &CourseRecord::GenStart { genseq: 1 }).unwrap();
        repo.append(
            &id,
            1,
            &CourseRecord::message(ChatMessage::Saying {
                genseq: 1,
                content: "hello".into(),
            }),
        )
        .unwrap();
        repo.append(
            &id,
            1,
            &CourseRecord::GenFinish {
                genseq: 1,
                context_health: None,
            },
        )
        .unwrap();

        let rows = repo.list(&id, 1).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(rows[0].record, CourseRecord::CourseStart);

        let msgs = repo.messages(&id, 1).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].message_type(), "saying");
    }

    #[test]
    fn courses_are_isolated() {
        let repo = setup();
        let id = DialogId::root("r1");
        repo.append(&id, 1, &CourseRecord::CourseStart).unwrap();
        repo.append(&id, 2, &CourseRecord::CourseStart).unwrap();
        repo.append(
            &id,
            2,
            &CourseRecord::message(ChatMessage::Environment {
                content: "prefix".into(),
            }),
        )
        .unwrap();
        assert_eq!(repo.list(&id, 1).unwrap().len(), 1);
        assert_eq!(repo.messages(&id, 2).unwrap().len(), 1);
        assert_eq!(repo.count(&id).unwrap(), 3);
    }

    #[test]
    fn dialogs_are_isolated() {
        let repo = setup();
        repo.append(&DialogId::root("r1"), 1, &CourseRecord::CourseStart).unwrap();
        assert!(repo.list(&DialogId::sub("r1", "s1"), 1).unwrap().is_empty());
    }

    #[test]
    fn record_type_column_uses_message_type() {
        let record = CourseRecord::message(ChatMessage::UiOnlyMarkdown {
            content: "note".into(),
        });
        assert_eq!(record.record_type(), "ui_only_markdown");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record"], "message");
        assert_eq!(json["message"]["type"], "ui_only_markdown");
    }
}
