//! Worker-wide hooks set by the host before `Worker::run`.

use std::fmt;

use tubeworker_core::{Job, JobId, QueueError};

use crate::dispatch::DispatchError;
use crate::held::HeldJob;

/// Replaces the default error policy (or a per-handler override of it).
pub type ErrorHook =
    Box<dyn Fn(&mut HeldJob<'_>, &DispatchError) -> Result<(), QueueError> + Send + Sync>;

/// Replaces the default timeout policy.
pub type TimeoutHook = Box<dyn Fn(&mut HeldJob<'_>) -> Result<(), QueueError> + Send + Sync>;

/// Runs before a direct job executes; returning `false` vetoes it.
pub type BeforeFilter = Box<dyn Fn(&Job) -> bool + Send + Sync>;

/// Runs before every reservation attempt.
pub type BeforeReserveHook = Box<dyn Fn() + Send + Sync>;

/// Runs once on shutdown, after the last dispatch.
pub type FinishHook = Box<dyn Fn() + Send + Sync>;

/// Runs after every job lifecycle transition the worker counts.
pub type JobEventHook = Box<dyn Fn(&JobEvent) + Send + Sync>;

/// A lifecycle transition of one job, as reported to [`JobEventHook`].
///
/// `Reserved` comes first for every job. `Failed` and `TimedOut` are
/// followed by `Buried` or `Decayed` when the failure policy settles the job
/// that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Reserved(JobId),
    Completed(JobId),
    Failed(JobId),
    TimedOut(JobId),
    Buried(JobId),
    Decayed(JobId),
    Unroutable(JobId),
    Vetoed(JobId),
    StaleRecord(JobId),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match *self {
            Self::Reserved(id)
            | Self::Completed(id)
            | Self::Failed(id)
            | Self::TimedOut(id)
            | Self::Buried(id)
            | Self::Decayed(id)
            | Self::Unroutable(id)
            | Self::Vetoed(id)
            | Self::StaleRecord(id) => id,
        }
    }
}

/// Hook registry handed to the worker at construction; read-only afterwards.
#[derive(Default)]
pub struct WorkerHooks {
    pub(crate) error_handler: Option<ErrorHook>,
    pub(crate) timeout_handler: Option<TimeoutHook>,
    pub(crate) before_filter: Option<BeforeFilter>,
    pub(crate) before_reserve: Vec<BeforeReserveHook>,
    pub(crate) finish: Option<FinishHook>,
    pub(crate) job_event: Option<JobEventHook>,
}

impl fmt::Debug for WorkerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHooks")
            .field("error_handler", &self.error_handler.is_some())
            .field("timeout_handler", &self.timeout_handler.is_some())
            .field("before_filter", &self.before_filter.is_some())
            .field("before_reserve", &self.before_reserve.len())
            .field("finish", &self.finish.is_some())
            .field("job_event", &self.job_event.is_some())
            .finish()
    }
}

impl WorkerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HeldJob<'_>, &DispatchError) -> Result<(), QueueError> + Send + Sync + 'static,
    {
        self.error_handler = Some(Box::new(hook));
        self
    }

    pub fn on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HeldJob<'_>) -> Result<(), QueueError> + Send + Sync + 'static,
    {
        self.timeout_handler = Some(Box::new(hook));
        self
    }

    pub fn before_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Job) -> bool + Send + Sync + 'static,
    {
        self.before_filter = Some(Box::new(filter));
        self
    }

    /// Hooks accumulate and run in registration order.
    pub fn before_reserve<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_reserve.push(Box::new(hook));
        self
    }

    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.finish = Some(Box::new(hook));
        self
    }

    /// Observe job transitions (metrics, audit trails). The hook cannot
    /// touch the job.
    pub fn on_job_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.job_event = Some(Box::new(hook));
        self
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        if let Some(hook) = &self.job_event {
            hook(&event);
        }
    }

    pub(crate) fn run_before_reserve(&self) {
        for hook in &self.before_reserve {
            hook();
        }
    }

    pub(crate) fn allows(&self, job: &Job) -> bool {
        self.before_filter.as_ref().is_none_or(|f| f(job))
    }
}
