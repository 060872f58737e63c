use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    error::{Result, SchedulerError},
    job::{BoundCall, JobContext, JobDefinition, JobId, RunId},
    pool::{Completion, Outcome, Work, WorkerPool},
    registry::JobRegistry,
    resolver::InstanceResolver,
    types::{EngineState, JobSnapshot, ShutdownReport},
};

/// Buffer size for the command channel between SchedulerHandle and the dispatcher.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Most elapsed fire times inspected for one job when catching up.
pub const MAX_BACKLOG_SCAN: usize = 1_000;

/// Builds and starts the dispatcher and worker pool.
pub struct SchedulerEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl SchedulerEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock, e.g. with a [`TokioClock`](crate::TokioClock) in tests.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind every registered job and start dispatching.
    ///
    /// All owners are resolved before anything runs: a single unresolvable
    /// owner fails the whole start and nothing is dispatched. Must be called
    /// from within a tokio runtime.
    pub fn start(
        self,
        registry: JobRegistry,
        resolver: &dyn InstanceResolver,
    ) -> Result<SchedulerHandle> {
        self.config.validate()?;
        let misfire_grace = TimeDelta::from_std(self.config.misfire_grace())
            .map_err(|_| SchedulerError::Config("misfire grace is out of range".to_string()))?;
        let timezone = self.config.timezone();

        info!(
            workers = self.config.worker_count(),
            max_instances = self.config.max_instances(),
            %timezone,
            coalesce = self.config.coalesce(),
            jobs = registry.len(),
            "starting scheduler engine"
        );

        let mut definitions = registry.into_definitions();
        definitions.sort_by(|a, b| a.id().cmp(b.id()));

        let mut bound = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if definition.max_instances() == Some(0) {
                return Err(SchedulerError::Config(format!(
                    "job {} has max_instances = 0",
                    definition.id()
                )));
            }
            info!(job = %definition.id(), trigger = %definition.trigger(), "binding job");
            let call = definition.bind(resolver)?;
            bound.push((definition, call));
        }

        let now = self.clock.now();
        let mut jobs = Vec::with_capacity(bound.len());
        let mut queue = BinaryHeap::with_capacity(bound.len());
        for (slot, (definition, call)) in bound.into_iter().enumerate() {
            let next_fire_at = definition.trigger().next_fire_after(now, timezone);
            match next_fire_at {
                Some(at) => {
                    debug!(job = %definition.id(), next_fire_at = %at, "job scheduled");
                    queue.push(Reverse(Firing {
                        at,
                        id: definition.id().clone(),
                        slot,
                    }));
                }
                None => {
                    info!(job = %definition.id(), "trigger has no future fire time; job retired")
                }
            }
            let max_instances = definition
                .max_instances()
                .unwrap_or(self.config.max_instances());
            jobs.push(RunningJob::new(definition, call, max_instances, next_fire_at));
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(self.config.worker_count(), completion_tx);

        let dispatcher = Dispatcher {
            jobs,
            queue,
            pool: Some(pool),
            clock: self.clock,
            timezone,
            coalesce: self.config.coalesce(),
            misfire_grace,
            state: EngineState::Running,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(dispatcher.run(command_rx, completion_rx));

        Ok(SchedulerHandle {
            command_tx,
            shutdown_grace: self.config.shutdown_grace(),
        })
    }
}

/// Handle for controlling a running engine. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_grace: Duration,
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| SchedulerError::EngineStopped)?;
        response_rx.await.map_err(|_| SchedulerError::EngineStopped)
    }

    /// Stop dispatching. Running executions continue; due firings wait.
    pub async fn pause(&self) -> Result<()> {
        self.request(|response| Command::Pause { response }).await
    }

    /// Resume dispatching. Firings missed while paused go through the
    /// coalesce policy.
    pub async fn resume(&self) -> Result<()> {
        self.request(|response| Command::Resume { response }).await
    }

    pub async fn state(&self) -> Result<EngineState> {
        self.request(|response| Command::State { response }).await
    }

    /// Per-job state and counters, ordered by identity.
    pub async fn snapshot(&self) -> Result<Vec<JobSnapshot>> {
        self.request(|response| Command::Snapshot { response }).await
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<JobSnapshot>> {
        let jobs = self.snapshot().await?;
        Ok(jobs.into_iter().find(|job| &job.id == id))
    }

    /// Stop dispatching, cancel job tokens and wait up to `grace` for
    /// running executions to finish.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport> {
        self.request(|response| Command::Shutdown { grace, response })
            .await
    }

    /// [`shutdown`](Self::shutdown) with the configured grace period.
    pub async fn stop(&self) -> Result<ShutdownReport> {
        self.shutdown(self.shutdown_grace).await
    }

    /// True once the engine has shut down.
    pub fn is_stopped(&self) -> bool {
        self.command_tx.is_closed()
    }
}

enum Command {
    Pause {
        response: oneshot::Sender<()>,
    },
    Resume {
        response: oneshot::Sender<()>,
    },
    State {
        response: oneshot::Sender<EngineState>,
    },
    Snapshot {
        response: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Shutdown {
        grace: Duration,
        response: oneshot::Sender<ShutdownReport>,
    },
}

/// A pending firing in the wait queue. Ordered by time, then identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Firing {
    at: DateTime<Utc>,
    id: JobId,
    slot: usize,
}

struct RunningJob {
    definition: JobDefinition,
    call: BoundCall,
    max_instances: usize,
    next_fire_at: Option<DateTime<Utc>>,
    in_flight: usize,
    peak_in_flight: usize,
    dispatched: u64,
    succeeded: u64,
    failed: u64,
    dropped: u64,
    skipped: u64,
    last_error: Option<String>,
}

impl RunningJob {
    fn new(
        definition: JobDefinition,
        call: BoundCall,
        max_instances: usize,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            definition,
            call,
            max_instances,
            next_fire_at,
            in_flight: 0,
            peak_in_flight: 0,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            dropped: 0,
            skipped: 0,
            last_error: None,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.definition.id().clone(),
            trigger: self.definition.trigger().to_string(),
            next_fire_at: self.next_fire_at,
            in_flight: self.in_flight,
            peak_in_flight: self.peak_in_flight,
            max_instances: self.max_instances,
            dispatched: self.dispatched,
            succeeded: self.succeeded,
            failed: self.failed,
            dropped: self.dropped,
            skipped: self.skipped,
            last_error: self.last_error.clone(),
            retired: self.next_fire_at.is_none(),
        }
    }
}

/// Single task owning the wait queue and every job's running state.
struct Dispatcher {
    /// Indexed by slot; sorted by identity at start.
    jobs: Vec<RunningJob>,
    queue: BinaryHeap<Reverse<Firing>>,
    pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    coalesce: bool,
    misfire_grace: TimeDelta,
    state: EngineState,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!(jobs = self.jobs.len(), "scheduler dispatcher started");

        loop {
            let wait = self.time_until_next_firing();
            tokio::select! {
                biased;

                Some(command) = commands.recv() => {
                    if self.handle_command(command, &mut completions).await {
                        break;
                    }
                }

                Some(done) = completions.recv() => self.complete(done),

                _ = sleep_or_park(wait) => self.dispatch_due(),
            }
        }

        info!("scheduler dispatcher stopped");
    }

    /// Returns true when the dispatcher should stop.
    async fn handle_command(
        &mut self,
        command: Command,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) -> bool {
        match command {
            Command::Pause { response } => {
                if self.state == EngineState::Running {
                    info!("scheduler paused");
                }
                self.state = EngineState::Paused;
                let _ = response.send(());
            }
            Command::Resume { response } => {
                if self.state == EngineState::Paused {
                    info!("scheduler resumed");
                }
                self.state = EngineState::Running;
                let _ = response.send(());
            }
            Command::State { response } => {
                let _ = response.send(self.state);
            }
            Command::Snapshot { response } => {
                let _ = response.send(self.jobs.iter().map(RunningJob::snapshot).collect());
            }
            Command::Shutdown { grace, response } => {
                let report = self.shutdown(grace, completions).await;
                let _ = response.send(report);
                return true;
            }
        }
        false
    }

    fn time_until_next_firing(&self) -> Option<Duration> {
        if self.state == EngineState::Paused {
            return None;
        }
        let Reverse(next) = self.queue.peek()?;
        Some((next.at - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Pop and fire everything due, earliest first.
    fn dispatch_due(&mut self) {
        let now = self.clock.now();
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(next)| next.at <= now)
        {
            let Some(Reverse(firing)) = self.queue.pop() else {
                break;
            };
            self.fire(firing, now);
        }
    }

    /// Handle one due firing: catch-up policy, dispatch, reschedule.
    fn fire(&mut self, firing: Firing, now: DateTime<Utc>) {
        let Firing { at, id, slot } = firing;
        let trigger = self.jobs[slot].definition.trigger();

        // Every fire time that has already elapsed, starting with this one.
        let mut due = 1usize;
        let mut latest = at;
        let mut next = trigger.next_fire_after(at, self.timezone);
        while let Some(candidate) = next {
            if candidate > now || due >= MAX_BACKLOG_SCAN {
                break;
            }
            due += 1;
            latest = candidate;
            next = trigger.next_fire_after(candidate, self.timezone);
        }
        if next.is_some_and(|candidate| candidate <= now) {
            next = trigger.next_fire_after(now, self.timezone);
        }

        let on_time = due == 1 && now - at <= self.misfire_grace;
        let run_at = if on_time {
            Some(at)
        } else if self.coalesce {
            let job = &mut self.jobs[slot];
            job.skipped += (due - 1) as u64;
            info!(job = %id, missed = due, "coalescing missed firings into one run");
            Some(latest)
        } else {
            let job = &mut self.jobs[slot];
            job.skipped += due as u64;
            warn!(
                job = %id,
                missed = due,
                next_fire_at = ?next,
                "skipping missed firings"
            );
            None
        };

        if let Some(scheduled_at) = run_at {
            self.dispatch(slot, scheduled_at);
        }

        self.jobs[slot].next_fire_at = next;
        match next {
            Some(at) => self.queue.push(Reverse(Firing { at, id, slot })),
            None => info!(job = %id, "trigger exhausted; job retired"),
        }
    }

    /// Submit one execution unless the job is at its instance ceiling.
    fn dispatch(&mut self, slot: usize, scheduled_at: DateTime<Utc>) {
        let job = &mut self.jobs[slot];
        if job.in_flight >= job.max_instances {
            job.dropped += 1;
            warn!(
                job = %job.definition.id(),
                in_flight = job.in_flight,
                max_instances = job.max_instances,
                "maximum running instances reached; firing dropped"
            );
            return;
        }
        let Some(pool) = self.pool.as_ref() else {
            return;
        };

        let ctx = JobContext {
            job: job.definition.id().clone(),
            run_id: RunId::new(),
            scheduled_at,
            cancel: self.cancel.child_token(),
        };
        let run_id = ctx.run_id;
        let work = Work {
            slot,
            call: job.call.clone(),
            ctx,
        };

        match pool.submit(work) {
            Ok(()) => {
                job.in_flight += 1;
                job.peak_in_flight = job.peak_in_flight.max(job.in_flight);
                job.dispatched += 1;
                debug!(
                    job = %job.definition.id(),
                    %run_id,
                    %scheduled_at,
                    in_flight = job.in_flight,
                    "job dispatched"
                );
            }
            Err(_) => warn!(job = %job.definition.id(), "worker pool closed; firing lost"),
        }
    }

    fn complete(&mut self, done: Completion) {
        let Some(job) = self.jobs.get_mut(done.slot) else {
            return;
        };
        job.in_flight = job.in_flight.saturating_sub(1);
        match done.outcome {
            Outcome::Succeeded => job.succeeded += 1,
            Outcome::Failed(detail) | Outcome::Panicked(detail) => {
                job.failed += 1;
                job.last_error = Some(detail);
            }
        }
        debug!(
            job = %job.definition.id(),
            run_id = %done.run_id,
            in_flight = job.in_flight,
            "job completed"
        );
    }

    fn in_flight_total(&self) -> usize {
        self.jobs.iter().map(|job| job.in_flight).sum()
    }

    async fn shutdown(
        &mut self,
        grace: Duration,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) -> ShutdownReport {
        info!(
            in_flight = self.in_flight_total(),
            ?grace,
            "scheduler shutting down"
        );
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight_total() > 0 {
            match tokio::time::timeout_at(deadline, completions.recv()).await {
                Ok(Some(done)) => self.complete(done),
                Ok(None) | Err(_) => break,
            }
        }

        let abandoned = self.in_flight_total();
        if let Some(pool) = self.pool.take() {
            if abandoned == 0 {
                pool.stop().await;
            } else {
                warn!(abandoned, "shutdown grace period exceeded; abandoning running jobs");
                pool.abort();
            }
        }

        ShutdownReport {
            drained: abandoned == 0,
            abandoned,
        }
    }
}

async fn sleep_or_park(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
