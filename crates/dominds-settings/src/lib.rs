//! # dominds-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DomindsSettings::default()`]
//! 2. **User file**: `~/.dominds/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `DOMINDS_*` overrides
//!
//! ```no_run
//! use dominds_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("sweep every {} ms", settings.revival.sweep_interval_ms);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    database_path, deep_merge, dominds_home, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<DomindsSettings> = OnceLock::new();

/// Get the global settings instance, loading it on first call. Falls back
/// to compiled defaults if the file cannot be loaded.
pub fn get_settings() -> &'static DomindsSettings {
    SETTINGS.get_or_init(|| match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            DomindsSettings::default()
        }
    })
}

/// Install settings explicitly. Returns them back if the global was already
/// initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: DomindsSettings) -> std::result::Result<(), DomindsSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = DomindsSettings::default();
        assert_eq!(settings.context_health.caution_remediation_cadence, 10);
        assert_eq!(settings.context_health.critical_countdown_generations, 5);
        assert_eq!(settings.driver.max_retry_attempts, 5);
        assert_eq!(settings.driver.default_diligence_push_max, 3);
        assert_eq!(settings.revival.sweep_interval_ms, 1000);
        assert_eq!(settings.revival.error_backoff_ms, 5000);
        assert!(settings.team.members.is_empty());
    }
}
