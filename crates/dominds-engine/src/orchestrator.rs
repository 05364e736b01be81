//! Public facade over the engine.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use dominds_core::events::DialogEvent;
use dominds_core::generator::Generator;
use dominds_core::ids::DialogId;
use dominds_core::messages::PendingPrompt;
use dominds_core::run_state::{DialogRunState, DialogStatus, InterruptReason};
use dominds_core::subdialog::HumanQuestion;
use dominds_settings::{database_path, DomindsSettings};
use dominds_store::DialogStore;
use dominds_telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

use crate::dialog::{Dialog, Suspension};
use crate::driver::DriveOutcome;
use crate::engine::{Engine, EngineConfig};
use crate::error::EngineError;
use crate::owners::ReminderOwners;
use crate::recovery::RecoveryReport;
use crate::registry::ToolRegistry;
use crate::team::Team;
use crate::tools::create_default_registry;

/// Install tracing as configured in the `logging` section.
pub fn init_logging(settings: &DomindsSettings) -> TelemetryGuard {
    init_telemetry(TelemetryConfig::from_settings(&settings.logging))
}

pub struct OrchestratorBuilder {
    settings: DomindsSettings,
    store: Option<Arc<DialogStore>>,
    tools: Option<ToolRegistry>,
    owners: Option<ReminderOwners>,
    generator: Option<Arc<dyn Generator>>,
}

impl OrchestratorBuilder {
    pub fn new(settings: DomindsSettings) -> Self {
        Self {
            settings,
            store: None,
            tools: None,
            owners: None,
            generator: None,
        }
    }

    /// Use this store instead of opening the configured database.
    pub fn store(mut self, store: Arc<DialogStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn owners(mut self, owners: ReminderOwners) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<DialogOrchestrator, EngineError> {
        let generator = self
            .generator
            .ok_or_else(|| EngineError::Config("no generator configured".into()))?;
        let team = Team::from_settings(&self.settings.team)?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(DialogStore::open(&database_path(&self.settings))?),
        };
        let engine = Engine::new(
            store,
            team,
            self.tools.unwrap_or_else(create_default_registry),
            self.owners.unwrap_or_else(ReminderOwners::with_builtins),
            generator,
            EngineConfig::from(&self.settings),
        );
        Ok(DialogOrchestrator {
            engine: Arc::new(engine),
        })
    }
}

/// Handle of the background revival loop.
pub struct RevivalHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RevivalHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[derive(Clone)]
pub struct DialogOrchestrator {
    engine: Arc<Engine>,
}

impl DialogOrchestrator {
    pub fn builder(settings: DomindsSettings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn create_root_dialog(&self, agent_id: &str, task_doc: Option<String>) -> Result<DialogId, EngineError> {
        Ok(self.engine.create_root_dialog(agent_id, task_doc)?.id().clone())
    }

    pub fn dialog(&self, id: &DialogId) -> Result<Arc<Dialog>, EngineError> {
        self.engine.dialog(id)
    }

    /// Queue a human prompt and drive the dialog. A dialog suspended by a
    /// critical context takes the prompt as the go-ahead to continue.
    #[instrument(skip(self, content), fields(dialog_id = %id))]
    pub async fn submit_prompt(&self, id: &DialogId, content: &str) -> Result<DriveOutcome, EngineError> {
        let dialog = self.engine.dialog(id)?;
        if dialog.suspension() == Suspension::Suspended {
            dialog.set_suspension(Suspension::Resumed);
        }
        dialog.queue_up_next(PendingPrompt::human(content))?;
        self.engine.drive(&dialog).await
    }

    pub async fn drive(&self, id: &DialogId) -> Result<DriveOutcome, EngineError> {
        let dialog = self.engine.dialog(id)?;
        self.engine.drive(&dialog).await
    }

    /// Ask the active run of `id` to stop. Returns false when nothing runs.
    pub fn interrupt(&self, id: &DialogId, reason: InterruptReason) -> Result<bool, EngineError> {
        self.engine
            .runs()
            .request_interrupt_then(id, reason, |id| self.mark_stop_requested(id, reason))
    }

    /// Stop every active run.
    pub fn emergency_stop(&self) -> Result<Vec<DialogId>, EngineError> {
        let reason = InterruptReason::EmergencyStop;
        let stopped = self
            .engine
            .runs()
            .interrupt_all_then(reason, |id| self.mark_stop_requested(id, reason))?;
        info!(count = stopped.len(), "emergency stop");
        Ok(stopped)
    }

    fn mark_stop_requested(&self, id: &DialogId, reason: InterruptReason) -> Result<(), EngineError> {
        let state = DialogRunState::ProceedingStopRequested { reason };
        self.engine.store().dialogs.set_run_state(id, &state)?;
        self.engine.emit(DialogEvent::RunState {
            dialog_id: id.clone(),
            state,
        });
        Ok(())
    }

    /// Drive an interrupted or suspended dialog again.
    #[instrument(skip(self), fields(dialog_id = %id))]
    pub async fn resume_dialog(&self, id: &DialogId) -> Result<DriveOutcome, EngineError> {
        let dialog = self.engine.dialog(id)?;
        if dialog.suspension() == Suspension::Suspended {
            dialog.set_suspension(Suspension::Resumed);
        }
        self.engine.drive(&dialog).await
    }

    pub async fn answer_q4h(&self, question_id: &str, answer: &str) -> Result<DialogId, EngineError> {
        Ok(self.engine.answer_q4h(question_id, answer).await?.id().clone())
    }

    pub fn pending_questions(&self, root_id: &str) -> Result<Vec<HumanQuestion>, EngineError> {
        Ok(self.engine.store().queues.list_questions_in_tree(root_id)?)
    }

    pub fn run_state(&self, id: &DialogId) -> Result<DialogRunState, EngineError> {
        Ok(self.engine.store().dialogs.latest(id)?.run_state)
    }

    /// Mark a whole tree completed or archived. Its dialogs are no longer
    /// driven.
    pub fn set_tree_status(&self, root_id: &str, status: DialogStatus) -> Result<(), EngineError> {
        self.engine.dialog(&DialogId::root(root_id))?.set_status(status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DialogEvent> {
        self.engine.subscribe()
    }

    pub fn recover_after_restart(&self) -> Result<RecoveryReport, EngineError> {
        self.engine.recover_after_restart()
    }

    pub fn spawn_revival(&self) -> RevivalHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.engine.clone().run_revival(cancel.clone()));
        RevivalHandle { cancel, task }
    }

    pub async fn drain_revivals(&self, max_sweeps: usize) -> Result<Vec<DialogId>, EngineError> {
        self.engine.drain_revivals(max_sweeps).await
    }
}
