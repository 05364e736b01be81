//! SQLite persistence for dialog trees.
//!
//! Every repo shares one [`Database`]; [`DialogStore`] bundles them so the
//! engine holds a single handle.

pub mod course_events;
pub mod database;
pub mod dialogs;
pub mod error;
pub mod queues;
pub mod reminders;
pub mod row_helpers;
pub mod schema;

use std::path::Path;

use tracing::instrument;

use dominds_core::ids::DialogId;

pub use course_events::{CourseEventRepo, CourseEventRow, CourseRecord};
pub use database::Database;
pub use dialogs::{DialogLatest, DialogMeta, DialogRepo};
pub use error::StoreError;
pub use queues::{QueueRepo, SupplyOutcome};
pub use reminders::ReminderRepo;

pub struct DialogStore {
    db: Database,
    pub dialogs: DialogRepo,
    pub courses: CourseEventRepo,
    pub reminders: ReminderRepo,
    pub queues: QueueRepo,
}

impl DialogStore {
    pub fn new(db: Database) -> Self {
        Self {
            dialogs: DialogRepo::new(db.clone()),
            courses: CourseEventRepo::new(db.clone()),
            reminders: ReminderRepo::new(db.clone()),
            queues: QueueRepo::new(db.clone()),
            db,
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Make taken responses durable as course records and drop them from the
    /// queue, in one transaction. A crash can leave them either queued or
    /// recorded, never both.
    #[instrument(skip(self, records), fields(owner = %owner, course, count = records.len()))]
    pub fn consume_taken(
        &self,
        owner: &DialogId,
        course: u32,
        records: &[CourseRecord],
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            for record in records {
                course_events::insert_record(tx, owner, course, record)?;
            }
            queues::commit_taken_on(tx, owner)
        })
    }
}
