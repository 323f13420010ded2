//! Runtime configuration loaded from TOML files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use treadle_core::{EngineError, Result};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Job executor configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Configuration(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| EngineError::Configuration(format!("Failed to parse config: {}", e)))
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor name, the first half of every lock owner stamp.
    #[serde(default = "default_executor_name")]
    pub name: String,

    /// Number of worker tasks polling for due jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker sleeps before polling again, in milliseconds.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Upper bound the idle interval backs off to after repeated failures.
    #[serde(default = "default_max_idle_interval_ms")]
    pub max_idle_interval_ms: u64,

    /// How long a worker may hold a job lock before it is considered stuck.
    #[serde(default = "default_max_lock_time_ms")]
    pub max_lock_time_ms: u64,

    /// How often the lock monitor sweeps for stuck locks.
    #[serde(default = "default_lock_monitor_interval_ms")]
    pub lock_monitor_interval_ms: u64,

    /// Grace period added on top of the max lock time before reclaiming.
    #[serde(default = "default_lock_buffer_ms")]
    pub lock_buffer_ms: u64,
}

impl ExecutorConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn max_idle_interval(&self) -> Duration {
        Duration::from_millis(self.max_idle_interval_ms)
    }

    pub fn max_lock_time(&self) -> Duration {
        Duration::from_millis(self.max_lock_time_ms)
    }

    pub fn lock_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.lock_monitor_interval_ms)
    }

    pub fn lock_buffer(&self) -> Duration {
        Duration::from_millis(self.lock_buffer_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor_name(),
            workers: default_workers(),
            idle_interval_ms: default_idle_interval_ms(),
            max_idle_interval_ms: default_max_idle_interval_ms(),
            max_lock_time_ms: default_max_lock_time_ms(),
            lock_monitor_interval_ms: default_lock_monitor_interval_ms(),
            lock_buffer_ms: default_lock_buffer_ms(),
        }
    }
}

fn default_executor_name() -> String {
    "executor".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_idle_interval_ms() -> u64 {
    5_000
}

fn default_max_idle_interval_ms() -> u64 {
    3_600_000
}

fn default_max_lock_time_ms() -> u64 {
    600_000
}

fn default_lock_monitor_interval_ms() -> u64 {
    60_000
}

fn default_lock_buffer_ms() -> u64 {
    5_000
}

/// Substitute ${VAR_NAME} patterns with environment variable values.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return content.to_string();
    };

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
