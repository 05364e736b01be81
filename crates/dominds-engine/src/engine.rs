use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};

use dominds_core::events::DialogEvent;
use dominds_core::generator::Generator;
use dominds_llm::{ReliableGenerator, RetryPolicy};
use dominds_settings::{ContextHealthSettings, DomindsSettings, DriverSettings, RevivalSettings};
use dominds_store::DialogStore;

use crate::dialog::{Dialog, DialogEnv};
use crate::error::EngineError;
use crate::health::{ContextHealthEngine, HealthConfig};
use crate::owners::ReminderOwners;
use crate::registry::ToolRegistry;
use crate::runs::ActiveRuns;
use crate::team::Team;

pub const EVENT_CAPACITY: usize = 1024;

/// The settings sections the engine reads.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub driver: DriverSettings,
    pub context_health: ContextHealthSettings,
    pub revival: RevivalSettings,
}

impl EngineConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.tool_timeout_ms)
    }
}

impl From<&DomindsSettings> for EngineConfig {
    fn from(s: &DomindsSettings) -> Self {
        Self {
            driver: s.driver.clone(),
            context_health: s.context_health.clone(),
            revival: s.revival.clone(),
        }
    }
}

/// Shared state behind every drive: store, event bus, locks, runs, team,
/// tools and the generator.
///
/// Operations are spread over `impl Engine` blocks in the driver,
/// subdialog, q4h, loader, recovery and revival modules.
pub struct Engine {
    pub(crate) env: DialogEnv,
    pub(crate) runs: ActiveRuns,
    pub(crate) health: ContextHealthEngine,
    pub(crate) team: Team,
    pub(crate) tools: ToolRegistry,
    pub(crate) owners: ReminderOwners,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) config: EngineConfig,
    /// Loaded trees by root id.
    pub(crate) trees: DashMap<String, Arc<Dialog>>,
    pub(crate) revival_wake: Notify,
}

impl Engine {
    pub fn new(
        store: Arc<DialogStore>,
        team: Team,
        tools: ToolRegistry,
        owners: ReminderOwners,
        generator: Arc<dyn Generator>,
        config: EngineConfig,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&config.driver);
        Self {
            env: DialogEnv::new(store, EVENT_CAPACITY),
            runs: ActiveRuns::new(),
            health: ContextHealthEngine::new(HealthConfig::from(&config.context_health)),
            team,
            tools,
            owners,
            generator: Arc::new(ReliableGenerator::new(generator, retry)),
            config,
            trees: DashMap::new(),
            revival_wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<DialogStore> {
        &self.env.store
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn runs(&self) -> &ActiveRuns {
        &self.runs
    }

    pub fn health(&self) -> &ContextHealthEngine {
        &self.health
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DialogEvent> {
        self.env.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DialogEvent) {
        self.env.emit(event);
    }

    /// Nudge the revival scheduler to sweep now.
    pub fn wake_revival(&self) {
        self.revival_wake.notify_one();
    }

    pub(crate) fn cache_tree(&self, root: Arc<Dialog>) -> Arc<Dialog> {
        self.trees
            .entry(root.id().root_id.clone())
            .or_insert(root)
            .clone()
    }

    pub(crate) fn cached_tree(&self, root_id: &str) -> Option<Arc<Dialog>> {
        self.trees.get(root_id).map(|e| e.value().clone())
    }

    pub(crate) fn diligence_budget(&self, agent_id: &str) -> u32 {
        self.team
            .diligence_budget(agent_id, self.config.driver.default_diligence_push_max)
    }

    pub(crate) fn check_agent(&self, agent_id: &str) -> Result<(), EngineError> {
        self.team.member(agent_id).map(|_| ())
    }
}
