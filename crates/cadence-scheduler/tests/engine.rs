// End-to-end engine behaviour on mocked time.
// Every test runs with tokio's clock paused and the engine driven by a
// TokioClock, so firings land at exact, repeatable instants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_scheduler::{
    ComponentRegistry, EngineConfig, EngineState, JobContext, JobDefinition, JobId, JobRegistry,
    JobSnapshot, SchedulerEngine, SchedulerError, SchedulerHandle, TokioClock, Trigger,
};
use cadence_scheduler::engine::MAX_BACKLOG_SCAN;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

#[derive(Default)]
struct Recorder {
    runs: AtomicUsize,
    fired: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl Recorder {
    async fn record(self: Arc<Self>, ctx: JobContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.fired
            .lock()
            .unwrap()
            .push((ctx.job.to_string(), ctx.scheduled_at));
        Ok(())
    }

    /// Runs until the engine starts shutting down.
    async fn hold(self: Arc<Self>, ctx: JobContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.cancel.cancelled().await;
        Ok(())
    }

    /// Ignores cancellation entirely.
    async fn stuck(self: Arc<Self>, _ctx: JobContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn fired(&self) -> Vec<(String, DateTime<Utc>)> {
        self.fired.lock().unwrap().clone()
    }
}

async fn fail(_ctx: JobContext) -> anyhow::Result<()> {
    anyhow::bail!("disk full")
}

async fn explode(_ctx: JobContext) -> anyhow::Result<()> {
    panic!("boom")
}

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    origin() + TimeDelta::seconds(secs)
}

fn every(secs: u64) -> Trigger {
    Trigger::interval(Duration::from_secs(secs)).unwrap()
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn components(recorder: &Arc<Recorder>) -> ComponentRegistry {
    ComponentRegistry::new().with("Recorder", Arc::clone(recorder))
}

fn start(
    config: EngineConfig,
    registry: JobRegistry,
    components: &ComponentRegistry,
) -> SchedulerHandle {
    SchedulerEngine::new(config)
        .with_clock(TokioClock::starting_at(origin()))
        .start(registry, components)
        .unwrap()
}

async fn job(handle: &SchedulerHandle, id: &str) -> JobSnapshot {
    handle.job(&JobId::new(id)).await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn interval_method_job_fires_on_schedule() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);

    let handle = start(
        EngineConfig::default().with_worker_count(1),
        registry,
        &components(&recorder),
    );
    tokio::time::sleep(ms(3500)).await;

    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 3);
    assert_eq!(snap.succeeded, 3);
    assert_eq!(snap.in_flight, 0);
    assert_eq!(snap.peak_in_flight, 1);
    assert_eq!(snap.next_fire_at, Some(at(4)));
    assert!(!snap.retired);

    let scheduled: Vec<_> = recorder.fired().into_iter().map(|(_, t)| t).collect();
    assert_eq!(scheduled, vec![at(1), at(2), at(3)]);

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test(start_paused = true)]
async fn firings_beyond_max_instances_are_dropped() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.hold"), "Recorder", every(1), Recorder::hold);

    let handle = start(
        EngineConfig::default()
            .with_worker_count(4)
            .with_max_instances(2),
        registry,
        &components(&recorder),
    );
    tokio::time::sleep(ms(5500)).await;

    let snap = job(&handle, "tests.Recorder.hold").await;
    assert_eq!(snap.dispatched, 2);
    assert_eq!(snap.dropped, 3);
    assert_eq!(snap.in_flight, 2);
    assert_eq!(snap.peak_in_flight, 2);
    assert_eq!(recorder.runs(), 2);

    // cancellation releases both held executions
    let report = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(report.drained);

    // nothing is dispatched once shutdown has begun
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(recorder.runs(), 2);
}

#[tokio::test(start_paused = true)]
async fn per_job_max_instances_overrides_engine_default() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.register(
        JobDefinition::method(JobId::new("tests.Recorder.hold"), "Recorder", every(1), Recorder::hold)
            .with_max_instances(1),
    );

    let handle = start(
        EngineConfig::default().with_max_instances(3),
        registry,
        &components(&recorder),
    );
    tokio::time::sleep(ms(3500)).await;

    let snap = job(&handle, "tests.Recorder.hold").await;
    assert_eq!(snap.max_instances, 1);
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.dropped, 2);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn missed_firings_are_skipped_without_coalesce() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);

    let handle = start(
        EngineConfig::default().with_coalesce(false),
        registry,
        &components(&recorder),
    );

    tokio::time::sleep(ms(500)).await;
    handle.pause().await.unwrap();
    assert_eq!(handle.state().await.unwrap(), EngineState::Paused);

    tokio::time::sleep(ms(3000)).await;
    assert_eq!(recorder.runs(), 0);
    handle.resume().await.unwrap();
    assert_eq!(handle.state().await.unwrap(), EngineState::Running);

    tokio::time::sleep(ms(200)).await;
    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 0);
    assert_eq!(snap.skipped, 3);
    assert_eq!(snap.next_fire_at, Some(at(4)));

    // schedule continues with the first fire time after the backlog
    tokio::time::sleep(ms(500)).await;
    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.skipped, 3);
    assert_eq!(recorder.fired()[0].1, at(4));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn missed_firings_run_once_with_coalesce() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);

    let handle = start(
        EngineConfig::default().with_coalesce(true),
        registry,
        &components(&recorder),
    );

    tokio::time::sleep(ms(500)).await;
    handle.pause().await.unwrap();
    tokio::time::sleep(ms(3000)).await;
    handle.resume().await.unwrap();
    tokio::time::sleep(ms(200)).await;

    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.skipped, 2);
    // the single catch-up run carries the most recent missed fire time
    assert_eq!(recorder.fired()[0].1, at(3));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn firing_late_within_misfire_grace_runs_normally() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);

    let handle = start(
        EngineConfig::default()
            .with_coalesce(false)
            .with_misfire_grace(Duration::from_secs(1)),
        registry,
        &components(&recorder),
    );

    // the 1s firing is held back until 1.5s
    tokio::time::sleep(ms(500)).await;
    handle.pause().await.unwrap();
    tokio::time::sleep(ms(1000)).await;
    handle.resume().await.unwrap();
    tokio::time::sleep(ms(100)).await;

    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.skipped, 0);
    assert_eq!(snap.next_fire_at, Some(at(2)));
    assert_eq!(recorder.fired()[0].1, at(1));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// One 5s firing held back until 7s, two seconds past a one second grace.
async fn run_single_late_firing(coalesce: bool) -> (JobSnapshot, Vec<(String, DateTime<Utc>)>) {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(5), Recorder::record);

    let handle = start(
        EngineConfig::default()
            .with_coalesce(coalesce)
            .with_misfire_grace(Duration::from_secs(1)),
        registry,
        &components(&recorder),
    );

    tokio::time::sleep(ms(500)).await;
    handle.pause().await.unwrap();
    tokio::time::sleep(ms(6500)).await;
    handle.resume().await.unwrap();
    tokio::time::sleep(ms(100)).await;

    let snap = job(&handle, "tests.Recorder.record").await;
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
    (snap, recorder.fired())
}

#[tokio::test(start_paused = true)]
async fn firing_late_beyond_grace_is_skipped_without_coalesce() {
    let (snap, fired) = run_single_late_firing(false).await;
    assert_eq!(snap.dispatched, 0);
    assert_eq!(snap.skipped, 1);
    assert_eq!(snap.next_fire_at, Some(at(10)));
    assert!(fired.is_empty());
}

#[tokio::test(start_paused = true)]
async fn firing_late_beyond_grace_runs_once_with_coalesce() {
    let (snap, fired) = run_single_late_firing(true).await;
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.skipped, 0);
    assert_eq!(snap.next_fire_at, Some(at(10)));
    assert_eq!(fired[0].1, at(5));
}

#[tokio::test(start_paused = true)]
async fn long_backlog_is_capped_and_resumes_from_now() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(
        JobId::new("tests.Recorder.record"),
        "Recorder",
        Trigger::interval(ms(10)).unwrap(),
        Recorder::record,
    );

    let handle = start(
        EngineConfig::default().with_coalesce(false),
        registry,
        &components(&recorder),
    );

    // roughly two thousand 10ms firings elapse while paused
    tokio::time::sleep(ms(5)).await;
    handle.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    handle.resume().await.unwrap();
    tokio::time::sleep(ms(1)).await;

    let snap = job(&handle, "tests.Recorder.record").await;
    assert_eq!(snap.dispatched, 0);
    assert_eq!(snap.skipped, MAX_BACKLOG_SCAN as u64);
    // next fire is computed from the resume instant, 20.005s
    assert_eq!(
        snap.next_fire_at,
        Some(origin() + TimeDelta::milliseconds(20_015))
    );
    assert_eq!(recorder.runs(), 0);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unresolved_owner_fails_start_and_nothing_runs() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);
    registry.schedule_method(
        JobId::new("tests.Missing.record"),
        "Missing",
        every(1),
        Recorder::record,
    );

    let result = SchedulerEngine::new(EngineConfig::default())
        .with_clock(TokioClock::starting_at(origin()))
        .start(registry, &components(&recorder));
    assert!(matches!(
        result,
        Err(SchedulerError::UnresolvedOwner { ref owner_key, .. }) if owner_key == "Missing"
    ));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(recorder.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn owner_of_wrong_type_fails_start() {
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.record"), "Recorder", every(1), Recorder::record);

    let wrong = ComponentRegistry::new().with("Recorder", Arc::new(42_u32));
    let result = SchedulerEngine::new(EngineConfig::default()).start(registry, &wrong);
    assert!(matches!(
        result,
        Err(SchedulerError::OwnerTypeMismatch { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn zero_max_instances_override_is_rejected() {
    let mut registry = JobRegistry::new();
    registry.register(JobDefinition::function(JobId::new("tests.fail"), every(1), fail).with_max_instances(0));

    let result = SchedulerEngine::new(EngineConfig::default()).start(registry, &ComponentRegistry::new());
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn failures_and_panics_are_counted_and_job_stays_scheduled() {
    let mut registry = JobRegistry::new();
    registry.schedule(JobId::new("tests.fail"), every(1), fail);
    registry.schedule(JobId::new("tests.explode"), every(1), explode);

    let handle = start(EngineConfig::default(), registry, &ComponentRegistry::new());
    tokio::time::sleep(ms(2500)).await;

    let failing = job(&handle, "tests.fail").await;
    assert_eq!(failing.dispatched, 2);
    assert_eq!(failing.failed, 2);
    assert_eq!(failing.succeeded, 0);
    assert_eq!(failing.last_error.as_deref(), Some("disk full"));
    assert_eq!(failing.next_fire_at, Some(at(3)));

    let panicking = job(&handle, "tests.explode").await;
    assert_eq!(panicking.failed, 2);
    assert_eq!(panicking.in_flight, 0);
    assert_eq!(panicking.last_error.as_deref(), Some("boom"));
    assert!(!panicking.retired);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn date_trigger_fires_once_then_retires() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(
        JobId::new("tests.Recorder.once"),
        "Recorder",
        Trigger::date(at(2)),
        Recorder::record,
    );
    registry.schedule_method(
        JobId::new("tests.Recorder.past"),
        "Recorder",
        Trigger::date(at(-3600)),
        Recorder::record,
    );

    let handle = start(EngineConfig::default(), registry, &components(&recorder));

    let past = job(&handle, "tests.Recorder.past").await;
    assert!(past.retired);
    assert_eq!(past.next_fire_at, None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let once = job(&handle, "tests.Recorder.once").await;
    assert_eq!(once.dispatched, 1);
    assert!(once.retired);
    assert_eq!(
        recorder.fired(),
        vec![("tests.Recorder.once".to_string(), at(2))]
    );

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn simultaneous_firings_dispatch_in_identity_order() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.b"), "Recorder", every(1), Recorder::record);
    registry.schedule_method(JobId::new("tests.a"), "Recorder", every(1), Recorder::record);

    let handle = start(
        EngineConfig::default().with_worker_count(1),
        registry,
        &components(&recorder),
    );
    tokio::time::sleep(ms(2500)).await;

    let order: Vec<_> = recorder.fired().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, ["tests.a", "tests.b", "tests.a", "tests.b"]);

    let ids: Vec<_> = handle
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id.to_string())
        .collect();
    assert_eq!(ids, ["tests.a", "tests.b"]);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cron_job_fires_on_matching_seconds() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(
        JobId::new("tests.Recorder.cron"),
        "Recorder",
        Trigger::cron("*/2 * * * * *").unwrap(),
        Recorder::record,
    );

    let handle = start(EngineConfig::default(), registry, &components(&recorder));
    tokio::time::sleep(ms(5500)).await;

    let scheduled: Vec<_> = recorder.fired().into_iter().map(|(_, t)| t).collect();
    assert_eq!(scheduled, vec![at(2), at(4)]);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_jobs_that_outlive_the_grace_period() {
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.schedule_method(JobId::new("tests.Recorder.stuck"), "Recorder", every(1), Recorder::stuck);

    let handle = start(EngineConfig::default(), registry, &components(&recorder));
    tokio::time::sleep(ms(1500)).await;
    assert_eq!(job(&handle, "tests.Recorder.stuck").await.in_flight, 1);

    let report = handle.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);

    assert!(handle.is_stopped());
    assert!(matches!(
        handle.snapshot().await,
        Err(SchedulerError::EngineStopped)
    ));
    assert!(matches!(handle.pause().await, Err(SchedulerError::EngineStopped)));
}
