//! Dispatch pipeline: classify a reserved job, run its handler, acknowledge.
//!
//! Classification decodes a job's body into a [`Plan`], reading stats only
//! for jobs that will run.
//! Execution runs the plan and performs the success-path acknowledgment.
//! Failure handling lives in [`crate::policy`]; the worker decides which
//! policy applies from the returned [`DispatchError`].
//!
//! Job bodies are JSON objects `{"kind": .., "data": ..}`:
//!
//! - a routed job carries `data = {"method": .., "body": ..}` and is resolved
//!   through the [`JobRouter`];
//! - a direct job uses the configured direct kind and carries
//!   `data = {"code": <handler name>, "args": .., "deleteFirst": bool}`,
//!   resolved through the [`HandlerCatalog`].

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use tubeworker_core::QueueError;

use crate::catalog::{Handler, HandlerCatalog, RecordMissing};
use crate::config::WorkerConfig;
use crate::deadline::{deadline_for, run_handler};
use crate::held::HeldJob;
use crate::hooks::WorkerHooks;
use crate::router::{JobRouter, RouteError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Stats for the job could not be read.
    #[error("failed to inspect job: {0}")]
    Inspect(#[source] QueueError),

    #[error("malformed job body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("handler exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl DispatchError {
    /// The job could not be turned into a plan; it goes to the buried state.
    pub fn is_classification(&self) -> bool {
        matches!(self, Self::Inspect(_) | Self::MalformedBody(_) | Self::Route(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Inspect(e) | Self::Queue(e) if e.is_interrupt())
    }
}

/// What a successful dispatch did with the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// No handler for the job's kind; deleted.
    Unroutable,
    /// A before-filter refused the job; left reserved.
    Vetoed,
    /// A direct job's record no longer exists; deleted or decayed by age.
    StaleRecord,
}

/// A classified job, ready to execute.
pub enum Plan {
    Mapped {
        kind: String,
        method: String,
        handler: Handler,
        body: Value,
        deadline: Option<Duration>,
    },
    Direct {
        code: String,
        handler: Handler,
        args: Value,
        delete_first: bool,
        deadline: Option<Duration>,
        age: Duration,
    },
    Unroutable {
        kind: Option<String>,
    },
}

impl Plan {
    /// Handler name of a direct job, used to look up its error override.
    pub fn direct_target(&self) -> Option<&str> {
        match self {
            Self::Direct { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MappedData {
    method: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Deserialize)]
struct DirectData {
    code: String,
    #[serde(default)]
    args: Value,
    #[serde(default, rename = "deleteFirst", alias = "delete_first")]
    delete_first: bool,
}

/// The parts of [`WorkerConfig`] the pipeline reads.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub enforce_deadline: bool,
    pub deadline_ratio: f64,
    pub direct_kind: String,
    pub stale_record_age: Duration,
    pub decay_factor: f64,
}

impl From<&WorkerConfig> for DispatchSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            enforce_deadline: config.enforce_deadline,
            deadline_ratio: config.deadline_ratio,
            direct_kind: config.direct_kind.clone(),
            stale_record_age: config.stale_record_age(),
            decay_factor: config.decay_factor,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

pub struct Dispatcher<'w> {
    router: &'w JobRouter,
    catalog: &'w HandlerCatalog,
    hooks: &'w WorkerHooks,
    settings: &'w DispatchSettings,
}

impl<'w> Dispatcher<'w> {
    pub fn new(
        router: &'w JobRouter,
        catalog: &'w HandlerCatalog,
        hooks: &'w WorkerHooks,
        settings: &'w DispatchSettings,
    ) -> Self {
        Self {
            router,
            catalog,
            hooks,
            settings,
        }
    }

    /// Decode the body, resolve its handler and read stats into a plan.
    ///
    /// An unknown, missing or non-string kind is not an error: it plans a
    /// [`Plan::Unroutable`] deletion without touching stats. An unknown
    /// method under a known kind, an unknown direct handler and an
    /// undecodable body are errors.
    pub fn classify(&self, held: &mut HeldJob<'_>) -> Result<Plan, DispatchError> {
        let body = held.job().decode()?;

        let kind = match body.kind {
            Some(Value::String(kind)) => kind,
            Some(other) => return Ok(Plan::Unroutable { kind: Some(other.to_string()) }),
            None => return Ok(Plan::Unroutable { kind: None }),
        };

        if kind == self.settings.direct_kind {
            let data: DirectData = serde_json::from_value(body.data)?;
            let handler = self
                .catalog
                .get(&data.code)
                .cloned()
                .ok_or_else(|| RouteError::HandlerUnknown(data.code.clone()))?;
            let (deadline, age) = self.inspect(held)?;
            return Ok(Plan::Direct {
                code: data.code,
                handler,
                args: data.args,
                delete_first: data.delete_first,
                deadline,
                age,
            });
        }

        if !self.router.can_handle(&kind) {
            return Ok(Plan::Unroutable { kind: Some(kind) });
        }

        let data: MappedData = serde_json::from_value(body.data)?;
        let handler = self.router.resolve(&kind, &data.method)?.clone();
        let (deadline, _) = self.inspect(held)?;
        Ok(Plan::Mapped {
            kind,
            method: data.method,
            handler,
            body: data.body,
            deadline,
        })
    }

    /// Deadline and age of a job that is about to run.
    fn inspect(&self, held: &mut HeldJob<'_>) -> Result<(Option<Duration>, Duration), DispatchError> {
        let stats = held.stats().map_err(DispatchError::Inspect)?;
        debug!(job_id = %stats.id, ?stats, "job stats");

        let deadline = self
            .settings
            .enforce_deadline
            .then(|| deadline_for(stats.ttr, self.settings.deadline_ratio));
        Ok((deadline, Duration::from_secs(stats.age)))
    }

    /// Run the plan and acknowledge the job on success.
    ///
    /// On error the job is left for the failure policies, except when a
    /// direct job already deleted itself up front.
    pub fn execute(&self, held: &mut HeldJob<'_>, plan: Plan) -> Result<Outcome, DispatchError> {
        let label = format!("job-{}", held.job().id);
        match plan {
            Plan::Unroutable { kind } => {
                warn!(job_id = %held.job().id, ?kind, "no handler for job kind; deleting");
                held.delete()?;
                Ok(Outcome::Unroutable)
            }
            Plan::Mapped {
                kind,
                method,
                handler,
                body,
                deadline,
            } => {
                info!(job_id = %held.job().id, %kind, %method, "dispatching job");
                run_handler(&handler, body, deadline, &label)?;
                held.delete()?;
                Ok(Outcome::Completed)
            }
            Plan::Direct {
                code,
                handler,
                args,
                delete_first,
                deadline,
                age,
            } => {
                info!(job_id = %held.job().id, %code, "running direct job");
                if !self.hooks.allows(held.job()) {
                    info!(job_id = %held.job().id, "job vetoed by before-filter; leaving it reserved");
                    return Ok(Outcome::Vetoed);
                }
                if delete_first {
                    held.delete()?;
                }

                match run_handler(&handler, args, deadline, &label) {
                    Ok(()) => {}
                    Err(DispatchError::Handler(err)) if err.downcast_ref::<RecordMissing>().is_some() => {
                        if !delete_first {
                            self.settle_stale(held, age)?;
                        }
                        warn!(job_id = %held.job().id, error = %err, "record not found");
                        return Ok(Outcome::StaleRecord);
                    }
                    Err(err) => return Err(err),
                }

                if !delete_first {
                    held.delete()?;
                }
                Ok(Outcome::Completed)
            }
        }
    }

    fn settle_stale(&self, held: &mut HeldJob<'_>, age: Duration) -> Result<(), QueueError> {
        if age > self.settings.stale_record_age {
            held.delete()
        } else {
            held.decay(self.settings.decay_factor)
        }
    }
}
