use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    job::{JobContext, JobDefinition, JobId},
    trigger::Trigger,
};

/// The set of jobs an engine will run, unique by identity.
///
/// Populated during a registration phase, then handed to
/// [`SchedulerEngine::start`](crate::SchedulerEngine::start), which consumes it.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashSet<JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `definition` unless a job with the same identity is already
    /// registered. The first registration wins; returns whether this one was
    /// inserted.
    pub fn register(&mut self, definition: JobDefinition) -> bool {
        if let Some(existing) = self.jobs.get(definition.id()) {
            let kept = existing.signature();
            let ignored = definition.signature();
            if kept == ignored {
                debug!(job = %definition.id(), "job already registered");
            } else {
                warn!(
                    job = %definition.id(),
                    %kept,
                    %ignored,
                    "conflicting registration ignored; first registration wins"
                );
            }
            return false;
        }

        info!(job = %definition.id(), trigger = %definition.trigger(), "scheduling job");
        self.jobs.insert(definition)
    }

    /// Register a free function.
    pub fn schedule<F, Fut>(&mut self, id: JobId, trigger: Trigger, f: F) -> bool
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(JobDefinition::function(id, trigger, f))
    }

    /// Register a method on the component resolved from `owner_key`.
    pub fn schedule_method<T, F, Fut>(
        &mut self,
        id: JobId,
        owner_key: impl Into<String>,
        trigger: Trigger,
        f: F,
    ) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(JobDefinition::method(id, owner_key, trigger, f))
    }

    /// Snapshot of every registered definition, in no particular order.
    pub fn all(&self) -> Vec<JobDefinition> {
        self.jobs.iter().cloned().collect()
    }

    pub fn get(&self, id: &JobId) -> Option<&JobDefinition> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn into_definitions(self) -> Vec<JobDefinition> {
        self.jobs.into_iter().collect()
    }
}
