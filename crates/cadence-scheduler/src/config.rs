use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// Validated, immutable engine settings.
///
/// Built from the `[scheduler]` properties with `TryFrom`, or from
/// `Default` plus the `with_*` builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    worker_count: usize,
    max_instances: usize,
    timezone: Tz,
    coalesce: bool,
    misfire_grace: Duration,
    shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let props = SchedulerConfig::default();
        Self {
            worker_count: props.worker_count,
            max_instances: props.max_instances,
            timezone: Tz::UTC,
            coalesce: props.coalesce,
            misfire_grace: Duration::from_secs(props.misfire_grace_secs),
            shutdown_grace: Duration::from_secs(props.shutdown_grace_secs),
        }
    }
}

impl TryFrom<&SchedulerConfig> for EngineConfig {
    type Error = SchedulerError;

    fn try_from(props: &SchedulerConfig) -> Result<Self> {
        props
            .validate()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let timezone = props
            .timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::Config(format!("unknown timezone {:?}", props.timezone)))?;
        Ok(Self {
            worker_count: props.worker_count,
            max_instances: props.max_instances,
            timezone,
            coalesce: props.coalesce,
            misfire_grace: Duration::from_secs(props.misfire_grace_secs),
            shutdown_grace: Duration::from_secs(props.shutdown_grace_secs),
        })
    }
}

impl EngineConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_misfire_grace(mut self, grace: Duration) -> Self {
        self.misfire_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn coalesce(&self) -> bool {
        self.coalesce
    }

    pub fn misfire_grace(&self) -> Duration {
        self.misfire_grace
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(SchedulerError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.max_instances == 0 {
            return Err(SchedulerError::Config(
                "max_instances must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
