use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_CONCURRENCY: u32 = 1;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Tasks provisioned into the in-memory store at startup.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Polling driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the driver re-evaluates every task's due time.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the created-run channel between driver and executor.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A single task definition.
///
/// Exactly one of `every` / `cron` should be set; `cron` wins when both are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Stable ID. A fresh UUIDv7 is minted when absent.
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_org")]
    pub org_id: String,
    /// Interval literal, e.g. "10s", "5m", "1h".
    pub every: Option<String>,
    /// Cron expression with 5, 6 or 7 fields.
    pub cron: Option<String>,
    /// Delay added to every computed due time, e.g. "30s".
    pub offset: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub status: TaskStatusConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatusConfig {
    #[default]
    Active,
    Inactive,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}
fn default_org() -> String {
    "default".to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Falls back to ~/.cadence/cadence.toml when no path is given. A
    /// missing file is not an error; defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        Self::from_figment(Figment::new().merge(Toml::file(&path)))
    }

    /// Parse config from an in-memory TOML string (env overrides still apply).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
