//! # dominds-engine
//!
//! Dialog orchestration: drives teammate dialogs and their subdialogs.
//!
//! - **Dialog model**: root/sub dialogs, registries, reminders, courses
//! - **Driver**: context assembly → generation → call routing, looped until
//!   the dialog replies, blocks, is suspended or interrupted
//! - **Context health**: remediation, countdown and forced new courses
//! - **Subdialogs**: creation, sessions, asking back, transactional replies
//! - **Revival**: background drive of dialogs flagged as needing one
//! - **Orchestrator**: the public facade
//!
//! ## Crate Position
//!
//! Top of the workspace. Depends on: dominds-core, dominds-settings,
//! dominds-store, dominds-llm, dominds-telemetry.

#![deny(unsafe_code)]

pub mod dialog;
pub mod driver;
pub mod engine;
pub mod error;
pub mod health;
pub mod loader;
pub mod locks;
pub mod orchestrator;
pub mod owners;
pub mod q4h;
pub mod recovery;
pub mod registry;
pub mod revival;
pub mod runs;
pub mod subdialog;
pub mod team;
pub mod tools;

pub use dialog::{Dialog, DialogEnv, Suspension};
pub use driver::DriveOutcome;
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use health::{ContextHealthEngine, HealthConfig, HealthDecision, Remediation};
pub use locks::DialogLocks;
pub use orchestrator::{init_logging, DialogOrchestrator, OrchestratorBuilder, RevivalHandle};
pub use owners::{ReminderOwner, ReminderOwners, ReminderUpdate};
pub use recovery::RecoveryReport;
pub use registry::{ToolRegistry, ToolSource};
pub use revival::SweepReport;
pub use runs::{ActiveRuns, RunHandle};
pub use subdialog::TellaskRequest;
pub use team::{CallPolicy, Team};
pub use tools::{create_default_registry, Tool, ToolContext};
