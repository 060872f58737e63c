use std::any::{type_name, Any};
use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    resolver::{Instance, InstanceResolver},
    trigger::Trigger,
};

/// Future returned by a job body.
pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Stable, globally unique job identity.
///
/// Free functions are named `module.function`, methods
/// `module.Owner.method`. Two definitions with the same identity are the
/// same logical job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a free function: `module.function`.
    pub fn function(module: &str, function: &str) -> Self {
        Self(format!("{module}.{function}"))
    }

    /// Identity of a method: `module.Owner.method`.
    pub fn method(module: &str, owner: &str, method: &str) -> Self {
        Self(format!("{module}.{owner}.{method}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Derive a [`JobId`] from the declaration site at compile time.
///
/// `job_id!(heartbeat)` names a free function in the current module,
/// `job_id!(DigestService::flush)` a method on a component type.
#[macro_export]
macro_rules! job_id {
    ($owner:ident :: $method:ident) => {
        $crate::JobId::method(module_path!(), stringify!($owner), stringify!($method))
    };
    ($function:ident) => {
        $crate::JobId::function(module_path!(), stringify!($function))
    };
}

/// Identifier of a single dispatch (UUID v7, time ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a job body gets to know about the firing it serves.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobId,
    pub run_id: RunId,
    /// Scheduled fire time (not the wall-clock dispatch time).
    pub scheduled_at: DateTime<Utc>,
    /// Cancelled when the engine begins shutting down. Cooperative only.
    pub cancel: CancellationToken,
}

/// A callable ready to run: free function, or method already bound to its owner.
#[derive(Clone)]
pub(crate) struct BoundCall(Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>);

impl BoundCall {
    fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub(crate) fn invoke(&self, ctx: JobContext) -> JobFuture {
        (self.0)(ctx)
    }
}

impl fmt::Debug for BoundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCall").finish_non_exhaustive()
    }
}

type Binder = Arc<dyn Fn(Instance) -> Option<BoundCall> + Send + Sync>;

#[derive(Clone)]
enum JobTarget {
    Function(BoundCall),
    Method {
        owner_key: String,
        owner_type: &'static str,
        binder: Binder,
    },
}

/// One schedulable unit: identity, trigger and the work to perform.
///
/// Equality and hashing look at the identity only.
#[derive(Clone)]
pub struct JobDefinition {
    id: JobId,
    trigger: Trigger,
    target: JobTarget,
    max_instances: Option<usize>,
}

impl JobDefinition {
    /// A job that runs a free function.
    pub fn function<F, Fut>(id: JobId, trigger: Trigger, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id,
            trigger,
            target: JobTarget::Function(BoundCall::new(f)),
            max_instances: None,
        }
    }

    /// A job that runs a method on the component registered as `owner_key`.
    ///
    /// The component is resolved once at engine start and passed to every
    /// call as the first argument.
    pub fn method<T, F, Fut>(id: JobId, owner_key: impl Into<String>, trigger: Trigger, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let binder: Binder = Arc::new(move |instance: Instance| {
            let owner = instance.downcast::<T>().ok()?;
            let f = Arc::clone(&f);
            Some(BoundCall::new(move |ctx| (*f)(Arc::clone(&owner), ctx)))
        });
        Self {
            id,
            trigger,
            target: JobTarget::Method {
                owner_key: owner_key.into(),
                owner_type: type_name::<T>(),
                binder,
            },
            max_instances: None,
        }
    }

    /// Override the engine-wide max-instances ceiling for this job.
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn owner_key(&self) -> Option<&str> {
        match &self.target {
            JobTarget::Function(_) => None,
            JobTarget::Method { owner_key, .. } => Some(owner_key),
        }
    }

    pub fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    /// Trigger and owner rendered as text; two registrations of one identity
    /// with different signatures are a conflict.
    pub(crate) fn signature(&self) -> String {
        match self.owner_key() {
            Some(owner) => format!("{} on {owner}", self.trigger),
            None => self.trigger.to_string(),
        }
    }

    /// Resolve the owner (if any) and produce a ready-to-run call.
    pub(crate) fn bind(&self, resolver: &dyn InstanceResolver) -> Result<BoundCall> {
        match &self.target {
            JobTarget::Function(call) => Ok(call.clone()),
            JobTarget::Method {
                owner_key,
                owner_type,
                binder,
            } => {
                let instance =
                    resolver
                        .resolve(owner_key)
                        .ok_or_else(|| SchedulerError::UnresolvedOwner {
                            job: self.id.clone(),
                            owner_key: owner_key.clone(),
                        })?;
                binder(instance).ok_or_else(|| SchedulerError::OwnerTypeMismatch {
                    job: self.id.clone(),
                    owner_key: owner_key.clone(),
                    expected: owner_type,
                })
            }
        }
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("trigger", &self.trigger.to_string())
            .field("owner_key", &self.owner_key())
            .field("max_instances", &self.max_instances)
            .finish()
    }
}

impl PartialEq for JobDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobDefinition {}

impl Hash for JobDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Borrow<JobId> for JobDefinition {
    fn borrow(&self) -> &JobId {
        &self.id
    }
}
