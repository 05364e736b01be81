use tracing::{info, instrument, warn};

use dominds_core::events::DialogEvent;
use dominds_core::run_state::{DialogRunState, InterruptReason};

use crate::engine::Engine;
use crate::error::EngineError;

/// What startup recovery touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub responses_requeued: usize,
}

impl Engine {
    /// Run once at startup, before revival. Nothing can still be generating
    /// after a restart: every dialog persisted as proceeding is marked
    /// interrupted, and responses taken by a lost generation go back to
    /// their queues.
    #[instrument(skip(self))]
    pub fn recover_after_restart(&self) -> Result<RecoveryReport, EngineError> {
        let store = self.store();
        let proceeding = store.dialogs.list_proceeding()?;
        let state = DialogRunState::interrupted(InterruptReason::ServerRestart);
        for id in &proceeding {
            if let Err(e) = store.dialogs.set_run_state(id, &state) {
                warn!(dialog_id = %id, error = %e, "failed to mark dialog interrupted");
                continue;
            }
            self.emit(DialogEvent::RunState {
                dialog_id: id.clone(),
                state: state.clone(),
            });
        }
        let responses_requeued = store.queues.rollback_all_taken()?;
        let report = RecoveryReport {
            interrupted: proceeding.len(),
            responses_requeued,
        };
        info!(
            interrupted = report.interrupted,
            responses_requeued = report.responses_requeued,
            "restart recovery finished"
        );
        Ok(report)
    }
}
