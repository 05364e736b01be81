use serde::{Deserialize, Serialize};

/// Thresholds and cadence of context-health remediation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextHealthSettings {
    /// Generations between soft remediation prompts while in caution.
    pub caution_remediation_cadence: u32,
    /// Critical generations allowed before a new course is forced.
    pub critical_countdown_generations: u32,
    /// Used when a teammate does not set its own optimal ceiling.
    pub default_optimal_max_tokens: u64,
    /// Fraction of the context window that counts as critical.
    pub critical_ratio: f64,
}

impl Default for ContextHealthSettings {
    fn default() -> Self {
        Self {
            caution_remediation_cadence: 10,
            critical_countdown_generations: 5,
            default_optimal_max_tokens: 100_000,
            critical_ratio: 0.9,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverSettings {
    /// Attempts per generation, counting the first one.
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub tool_timeout_ms: u64,
    pub default_diligence_push_max: u32,
    /// Language the transient guide asks the agent to work in.
    pub work_language: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            tool_timeout_ms: 120_000,
            default_diligence_push_max: 3,
            work_language: "en".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RevivalSettings {
    pub sweep_interval_ms: u64,
    /// Sleep after a failed sweep.
    pub error_backoff_ms: u64,
}

impl Default for RevivalSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            error_backoff_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Empty means `~/.dominds/database/dominds.db`.
    pub database_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub log_to_sqlite: bool,
    /// Empty means the main database.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: String::new(),
        }
    }
}
