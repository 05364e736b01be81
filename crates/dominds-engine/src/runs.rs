//! Cancellation for the run currently active on each dialog.

use std::convert::Infallible;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dominds_core::ids::DialogId;
use dominds_core::run_state::InterruptReason;

use crate::error::EngineError;

#[derive(Clone)]
struct RunEntry {
    token: CancellationToken,
    reason: Arc<Mutex<Option<InterruptReason>>>,
}

/// Handle given to the driver for one run. Every suspension point checks it.
#[derive(Clone)]
pub struct RunHandle {
    id: DialogId,
    entry: RunEntry,
}

impl RunHandle {
    pub fn dialog_id(&self) -> &DialogId {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.entry.token
    }

    /// Why the run was stopped. A cancelled token with no recorded reason
    /// means the process itself pulled the plug.
    pub fn reason(&self) -> InterruptReason {
        (*self.entry.reason.lock()).unwrap_or(InterruptReason::SystemStop)
    }

    pub fn is_interrupted(&self) -> bool {
        self.entry.token.is_cancelled()
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_interrupted() {
            Err(EngineError::Interrupted(self.reason()))
        } else {
            Ok(())
        }
    }

    /// Resolves once the run is interrupted.
    pub async fn interrupted(&self) -> InterruptReason {
        self.entry.token.cancelled().await;
        self.reason()
    }
}

#[derive(Default)]
pub struct ActiveRuns {
    runs: DashMap<DialogId, RunEntry>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh run for `id`, replacing any stale entry.
    pub fn begin(&self, id: &DialogId) -> RunHandle {
        let entry = RunEntry {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        };
        self.runs.insert(id.clone(), entry.clone());
        debug!(dialog_id = %id, "run registered");
        RunHandle {
            id: id.clone(),
            entry,
        }
    }

    /// Drop the entry if it still belongs to `handle`.
    pub fn finish(&self, handle: &RunHandle) {
        self.runs
            .remove_if(&handle.id, |_, e| Arc::ptr_eq(&e.reason, &handle.entry.reason));
    }

    pub fn is_active(&self, id: &DialogId) -> bool {
        self.runs.contains_key(id)
    }

    /// Ask the active run of `id` to stop. The first reason recorded wins.
    pub fn request_interrupt(&self, id: &DialogId, reason: InterruptReason) -> bool {
        match self.request_interrupt_then(id, reason, |_| Ok::<(), Infallible>(())) {
            Ok(requested) => requested,
            Err(never) => match never {},
        }
    }

    /// Like [`Self::request_interrupt`], running `mark` while the entry is
    /// still held. The run cannot finish before `mark` returns, so whatever
    /// it records is overwritten by the run's final state.
    pub fn request_interrupt_then<F, E>(&self, id: &DialogId, reason: InterruptReason, mark: F) -> Result<bool, E>
    where
        F: FnOnce(&DialogId) -> Result<(), E>,
    {
        let Some(entry) = self.runs.get(id) else {
            return Ok(false);
        };
        entry.reason.lock().get_or_insert(reason);
        entry.token.cancel();
        info!(dialog_id = %id, reason = reason.as_str(), "interrupt requested");
        mark(id)?;
        Ok(true)
    }

    /// Stop every active run; returns the ids that were asked.
    pub fn interrupt_all(&self, reason: InterruptReason) -> Vec<DialogId> {
        match self.interrupt_all_then(reason, |_| Ok::<(), Infallible>(())) {
            Ok(ids) => ids,
            Err(never) => match never {},
        }
    }

    pub fn interrupt_all_then<F, E>(&self, reason: InterruptReason, mut mark: F) -> Result<Vec<DialogId>, E>
    where
        F: FnMut(&DialogId) -> Result<(), E>,
    {
        let ids: Vec<DialogId> = self.runs.iter().map(|e| e.key().clone()).collect();
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if self.request_interrupt_then(&id, reason, &mut mark)? {
                stopped.push(id);
            }
        }
        Ok(stopped)
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_sets_reason_and_cancels() {
        let runs = ActiveRuns::new();
        let id = DialogId::root("r");
        let handle = runs.begin(&id);
        assert!(handle.check().is_ok());
        assert!(runs.request_interrupt(&id, InterruptReason::UserStop));
        assert!(handle.is_interrupted());
        assert!(matches!(
            handle.check(),
            Err(EngineError::Interrupted(InterruptReason::UserStop))
        ));
    }

    #[test]
    fn first_reason_wins() {
        let runs = ActiveRuns::new();
        let id = DialogId::root("r");
        let handle = runs.begin(&id);
        runs.request_interrupt(&id, InterruptReason::UserStop);
        runs.request_interrupt(&id, InterruptReason::EmergencyStop);
        assert_eq!(handle.reason(), InterruptReason::UserStop);
    }

    #[test]
    fn interrupt_without_run_is_noop() {
        let runs = ActiveRuns::new();
        assert!(!runs.request_interrupt(&DialogId::root("none"), InterruptReason::UserStop));
    }

    #[test]
    fn finish_ignores_newer_run() {
        let runs = ActiveRuns::new();
        let id = DialogId::root("r");
        let old = runs.begin(&id);
        let _new = runs.begin(&id);
        runs.finish(&old);
        assert!(runs.is_active(&id));
    }

    #[test]
    fn interrupt_all_reaches_every_run() {
        let runs = ActiveRuns::new();
        let a = runs.begin(&DialogId::root("a"));
        let b = runs.begin(&DialogId::sub("a", "b"));
        let stopped = runs.interrupt_all(InterruptReason::EmergencyStop);
        assert_eq!(stopped.len(), 2);
        assert_eq!(a.reason(), InterruptReason::EmergencyStop);
        assert_eq!(b.reason(), InterruptReason::EmergencyStop);
        runs.finish(&a);
        runs.finish(&b);
        assert_eq!(runs.active_count(), 0);
    }

    #[test]
    fn mark_runs_only_for_an_active_run() {
        let runs = ActiveRuns::new();
        let id = DialogId::root("r");
        let mut marked = Vec::new();
        let none = runs.request_interrupt_then(&id, InterruptReason::UserStop, |id| {
            marked.push(id.clone());
            Ok::<(), ()>(())
        });
        assert_eq!(none, Ok(false));
        assert!(marked.is_empty());

        let handle = runs.begin(&id);
        let stopped = runs.interrupt_all_then(InterruptReason::EmergencyStop, |id| {
            marked.push(id.clone());
            Ok::<(), ()>(())
        });
        assert_eq!(stopped, Ok(vec![id.clone()]));
        assert_eq!(marked, vec![id.clone()]);
        assert!(handle.is_interrupted());

        runs.finish(&handle);
        let late = runs.request_interrupt_then(&id, InterruptReason::UserStop, |id| {
            marked.push(id.clone());
            Ok::<(), ()>(())
        });
        assert_eq!(late, Ok(false));
        assert_eq!(marked.len(), 1);
    }

    #[tokio::test]
    async fn interrupted_future_resolves() {
        let runs = ActiveRuns::new();
        let id = DialogId::root("r");
        let handle = runs.begin(&id);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.interrupted().await })
        };
        runs.request_interrupt(&id, InterruptReason::SystemStop);
        assert_eq!(waiter.await.unwrap(), InterruptReason::SystemStop);
    }
}
