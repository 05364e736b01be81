//! Per-dialog async locks.
//!
//! Two independent maps, both created lazily and kept for the life of the
//! engine:
//! - the drive mutex: at most one generation loop per dialog, granted in
//!   arrival order (tokio's mutex queues waiters FIFO);
//! - the txn lock: serializes writes to a parent's pending/response queue so
//!   a child's completion can be recorded while the parent is not driving.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use dominds_core::ids::DialogId;

type LockMap = DashMap<DialogId, Arc<Mutex<()>>>;

/// Held for the whole drive of one dialog.
pub struct DriveGuard {
    id: DialogId,
    _guard: OwnedMutexGuard<()>,
}

impl DriveGuard {
    pub fn dialog_id(&self) -> &DialogId {
        &self.id
    }
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        trace!(dialog_id = %self.id, "drive mutex released");
    }
}

/// Held while a parent's response queue is being written.
pub struct TxnGuard {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
pub struct DialogLocks {
    drive: LockMap,
    txn: LockMap,
}

fn mutex_for(map: &LockMap, id: &DialogId) -> Arc<Mutex<()>> {
    map.entry(id.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .value()
        .clone()
}

impl DialogLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for the drive mutex of `id`.
    pub async fn acquire(&self, id: &DialogId) -> DriveGuard {
        let mutex = mutex_for(&self.drive, id);
        let guard = mutex.lock_owned().await;
        trace!(dialog_id = %id, "drive mutex acquired");
        DriveGuard {
            id: id.clone(),
            _guard: guard,
        }
    }

    pub fn try_acquire(&self, id: &DialogId) -> Option<DriveGuard> {
        let mutex = mutex_for(&self.drive, id);
        mutex.try_lock_owned().ok().map(|guard| DriveGuard {
            id: id.clone(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, id: &DialogId) -> bool {
        self.drive
            .get(id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    pub async fn lock_txn(&self, parent: &DialogId) -> TxnGuard {
        let mutex = mutex_for(&self.txn, parent);
        TxnGuard {
            _guard: mutex.lock_owned().await,
        }
    }
}
