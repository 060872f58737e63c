use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{EngineConfig, JobRegistry, SchedulerEngine};
use clap::Parser;
use tracing::{info, warn};

mod jobs;

/// Run the cadence scheduler with the built-in jobs until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to cadence.toml
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Seconds to wait for running jobs on shutdown (overrides the config)
    #[arg(long)]
    shutdown_grace: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_runner=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config = CadenceConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    info!(
        properties = %config.scheduler_json()?,
        "scheduler properties"
    );

    let mut engine_config = EngineConfig::try_from(&config.scheduler)?;
    if let Some(secs) = args.shutdown_grace {
        engine_config = engine_config.with_shutdown_grace(Duration::from_secs(secs));
    }

    let mut registry = JobRegistry::new();
    jobs::register(&mut registry)?;
    let components = jobs::components(chrono::Utc::now());

    let handle = SchedulerEngine::new(engine_config).start(registry, &components)?;
    info!("cadence runner started; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let final_state = handle.snapshot().await?;
    let report = handle.stop().await?;
    if report.drained {
        info!("all running jobs finished");
    } else {
        warn!(abandoned = report.abandoned, "jobs still running at exit");
    }
    info!(jobs = %serde_json::to_string(&final_state)?, "final job state");

    Ok(())
}
