//! Revival: drives dialogs whose `needs_drive` flag is set.
//!
//! A background loop sweeps on a fixed interval, and immediately whenever
//! the engine is nudged (a response was supplied, a subdialog created, a
//! question answered). Each flagged dialog is cleared before its drive, so
//! a flag raised during the drive survives for the next sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dominds_core::ids::DialogId;
use dominds_core::messages::PromptOrigin;

use crate::driver::DriveOutcome;
use crate::engine::Engine;
use crate::error::EngineError;

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub driven: Vec<DialogId>,
    pub skipped: usize,
    pub failed: usize,
}

impl Engine {
    /// One pass over every flagged dialog.
    #[instrument(skip(self))]
    pub async fn sweep_revivals(&self) -> Result<SweepReport, EngineError> {
        let store = self.store();
        let mut report = SweepReport::default();
        for id in store.dialogs.list_needing_drive()? {
            let latest = store.dialogs.latest(&id)?;
            if latest.run_state.blocks_revival() {
                debug!(dialog_id = %id, state = latest.run_state.kind(), "revival held by run state");
                store.dialogs.set_needs_drive(&id, false)?;
                report.skipped += 1;
                continue;
            }
            let dialog = match self.dialog(&id) {
                Ok(dialog) => dialog,
                Err(e) => {
                    warn!(dialog_id = %id, error = %e, "flagged dialog cannot be loaded");
                    store.dialogs.set_needs_drive(&id, false)?;
                    report.failed += 1;
                    continue;
                }
            };
            let asked_back = dialog
                .up_next()
                .is_some_and(|p| p.origin == PromptOrigin::TellaskBack);
            if !asked_back && !dialog.can_drive()? {
                debug!(dialog_id = %id, "still waiting, revival skipped");
                store.dialogs.set_needs_drive(&id, false)?;
                report.skipped += 1;
                continue;
            }

            store.dialogs.set_needs_drive(&id, false)?;
            match self.drive(&dialog).await {
                Ok(DriveOutcome::Skipped) => report.skipped += 1,
                Ok(outcome) => {
                    debug!(dialog_id = %id, ?outcome, "revived");
                    report.driven.push(id);
                }
                Err(e) => {
                    warn!(dialog_id = %id, error = %e, "revival drive failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Sweep until nothing is flagged or `max_sweeps` passes ran. Returns
    /// every dialog driven, in order.
    pub async fn drain_revivals(&self, max_sweeps: usize) -> Result<Vec<DialogId>, EngineError> {
        let mut driven = Vec::new();
        for _ in 0..max_sweeps {
            let report = self.sweep_revivals().await?;
            if report.driven.is_empty() && self.store().dialogs.list_needing_drive()?.is_empty() {
                break;
            }
            driven.extend(report.driven);
        }
        Ok(driven)
    }

    /// The background loop. Stops when `cancel` fires.
    pub async fn run_revival(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config.revival.sweep_interval_ms);
        let backoff = Duration::from_millis(self.config.revival.error_backoff_ms);
        info!(interval_ms = interval.as_millis() as u64, "revival loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.revival_wake.notified() => {}
            }
            if let Err(e) = self.sweep_revivals().await {
                warn!(error = %e, "revival sweep failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        info!("revival loop stopped");
    }
}
