//! Settings type definitions.
//!
//! All types are camelCase on the wire and `#[serde(default)]`, so partial
//! JSON fills in from [`Default`].

mod runtime;
mod team;

pub use runtime::*;
pub use team::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomindsSettings {
    pub context_health: ContextHealthSettings,
    pub driver: DriverSettings,
    pub revival: RevivalSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub team: TeamSettings,
}
