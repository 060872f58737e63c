//! `cadence-scheduler` — in-process, tokio-based job scheduler.
//!
//! # Overview
//!
//! Jobs are registered into a [`JobRegistry`] and handed to a
//! [`SchedulerEngine`], which binds method-style jobs to their owning
//! components and then runs a single dispatcher task. The dispatcher keeps a
//! wait queue ordered by next fire time and hands due firings to a fixed-size
//! worker pool, enforcing a per-job ceiling on concurrent executions.
//!
//! # Trigger variants
//!
//! | Variant            | Behaviour                                               |
//! |--------------------|---------------------------------------------------------|
//! | `Interval`         | Repeat every fixed period, optionally on an anchored grid |
//! | `Cron`             | Cron expression in the engine timezone                  |
//! | `CalendarInterval` | Step whole days/weeks/months/years, keeping local time  |
//! | `Date`             | Single fire at an absolute instant                      |
//! | `And`              | Fire only when every child fires at the same instant    |
//! | `Or`               | Fire whenever any child fires                           |

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
mod pool;
pub mod registry;
pub mod resolver;
pub mod trigger;
pub mod types;

pub use clock::{Clock, SystemClock, TokioClock};
pub use config::EngineConfig;
pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use job::{JobContext, JobDefinition, JobFuture, JobId, RunId};
pub use registry::JobRegistry;
pub use resolver::{ComponentRegistry, Instance, InstanceResolver};
pub use trigger::{CalendarUnit, Trigger, TriggerError};
pub use types::{EngineState, JobSnapshot, ShutdownReport};

/// Start an engine on the system clock. Shorthand for
/// `SchedulerEngine::new(config).start(registry, resolver)`.
pub fn start(
    registry: JobRegistry,
    resolver: &dyn InstanceResolver,
    config: EngineConfig,
) -> Result<SchedulerHandle> {
    SchedulerEngine::new(config).start(registry, resolver)
}
