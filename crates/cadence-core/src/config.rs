use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_WORKER_COUNT: usize = 20;
pub const DEFAULT_MAX_INSTANCES: usize = 3;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 1;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Scheduler properties, read from the `[scheduler]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the execution pool.
    #[serde(default = "default_worker_count", alias = "number_of_workers")]
    pub worker_count: usize,
    /// Ceiling on concurrently running executions of the same job. A firing
    /// that would exceed it is dropped.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// IANA timezone name used for every trigger computation.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// After missed firings, run once (true) or skip to the next future fire (false).
    #[serde(default)]
    pub coalesce: bool,
    /// How late a single firing may start and still count as on time.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// How long shutdown waits for running jobs to drain.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_instances: DEFAULT_MAX_INSTANCES,
            timezone: DEFAULT_TIMEZONE.to_string(),
            coalesce: false,
            misfire_grace_secs: DEFAULT_MISFIRE_GRACE_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(CadenceError::Config(
                "scheduler.worker_count must be at least 1".to_string(),
            ));
        }
        if self.max_instances == 0 {
            return Err(CadenceError::Config(
                "scheduler.max_instances must be at least 1".to_string(),
            ));
        }
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            CadenceError::Config(format!("scheduler.timezone: unknown timezone {:?}", self.timezone))
        })?;
        Ok(())
    }
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_max_instances() -> usize {
    DEFAULT_MAX_INSTANCES
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_misfire_grace_secs() -> u64 {
    DEFAULT_MISFIRE_GRACE_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__WORKER_COUNT=4`. A missing file is not an error;
    /// every option has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }

    /// The effective `[scheduler]` properties as a single JSON line, for logging.
    pub fn scheduler_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.scheduler)?)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
