//! Jobs shipped with the runner: a liveness heartbeat and a periodic digest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::{job_id, ComponentRegistry, JobContext, JobRegistry, Trigger, TriggerError};
use chrono::{DateTime, Utc};
use tracing::info;

/// Component key the digest job resolves its owner by.
pub const DIGEST_SERVICE: &str = "DigestService";

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const DIGEST_CRON: &str = "0 */5 * * * *";

/// Logs that the process is alive.
pub async fn heartbeat(ctx: JobContext) -> anyhow::Result<()> {
    info!(job = %ctx.job, run_id = %ctx.run_id, scheduled_at = %ctx.scheduled_at, "heartbeat");
    Ok(())
}

/// Summarises runner activity every few minutes.
pub struct DigestService {
    started: DateTime<Utc>,
    flushes: AtomicU64,
}

impl DigestService {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            flushes: AtomicU64::new(0),
        }
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub async fn flush(self: Arc<Self>, ctx: JobContext) -> anyhow::Result<()> {
        let sequence = self.flushes.fetch_add(1, Ordering::SeqCst) + 1;
        let uptime = ctx.scheduled_at - self.started;
        info!(
            job = %ctx.job,
            run_id = %ctx.run_id,
            sequence,
            uptime_secs = uptime.num_seconds(),
            "digest flushed"
        );
        Ok(())
    }
}

/// Register every runner job.
pub fn register(registry: &mut JobRegistry) -> Result<(), TriggerError> {
    registry.schedule(job_id!(heartbeat), Trigger::interval(HEARTBEAT_PERIOD)?, heartbeat);
    registry.schedule_method(
        job_id!(DigestService::flush),
        DIGEST_SERVICE,
        Trigger::cron(DIGEST_CRON)?,
        DigestService::flush,
    );
    Ok(())
}

/// Components the registered jobs run on.
pub fn components(started: DateTime<Utc>) -> ComponentRegistry {
    ComponentRegistry::new().with(DIGEST_SERVICE, Arc::new(DigestService::new(started)))
}
