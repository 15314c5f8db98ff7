//! The worker process: startup, the reserve/dispatch loop and shutdown.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use tubeworker_core::{DEFAULT_PRIORITY, Job, JobId, Queue, QueueError};

use crate::catalog::HandlerCatalog;
use crate::config::{ConfigError, WorkerConfig};
use crate::dispatch::{DispatchError, DispatchSettings, Dispatcher, Outcome};
use crate::held::HeldJob;
use crate::hint::HintSelector;
use crate::hooks::{JobEvent, WorkerHooks};
use crate::lifecycle::{StopFlag, install_signal_handlers};
use crate::policy::{ErrorPolicy, TimeoutPolicy, Verdict};
use crate::reserve::ReservationLoop;
use crate::router::{JobRouter, RouteError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker startup failed: {0}")]
    Startup(#[source] QueueError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Routes(#[from] RouteError),
}

/// Counters for one `run`, returned when the worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub buried: u64,
    pub decayed: u64,
    pub unroutable: u64,
    pub vetoed: u64,
    pub stale_records: u64,
}

impl WorkerStats {
    fn record(&mut self, event: &JobEvent) {
        let counter = match event {
            JobEvent::Reserved(_) => &mut self.reserved,
            JobEvent::Completed(_) => &mut self.completed,
            JobEvent::Failed(_) => &mut self.failed,
            JobEvent::TimedOut(_) => &mut self.timed_out,
            JobEvent::Buried(_) => &mut self.buried,
            JobEvent::Decayed(_) => &mut self.decayed,
            JobEvent::Unroutable(_) => &mut self.unroutable,
            JobEvent::Vetoed(_) => &mut self.vetoed,
            JobEvent::StaleRecord(_) => &mut self.stale_records,
        };
        *counter += 1;
    }
}

/// Count `event` and hand it to the host's job-event hook.
fn track(stats: &mut WorkerStats, hooks: &WorkerHooks, event: JobEvent) {
    stats.record(&event);
    hooks.emit(event);
}

fn verdict_event(verdict: Verdict, id: JobId) -> Option<JobEvent> {
    match verdict {
        Verdict::Buried => Some(JobEvent::Buried(id)),
        Verdict::Decayed => Some(JobEvent::Decayed(id)),
        Verdict::Overridden | Verdict::Custom | Verdict::Unsettled | Verdict::AlreadySettled => None,
    }
}

pub struct Worker<Q: Queue> {
    queue: Q,
    config: WorkerConfig,
    router: JobRouter,
    catalog: HandlerCatalog,
    hooks: WorkerHooks,
    settings: DispatchSettings,
    reservations: ReservationLoop,
    stop: StopFlag,
    stats: WorkerStats,
}

impl<Q: Queue> Worker<Q> {
    pub fn new(
        queue: Q,
        config: WorkerConfig,
        router: JobRouter,
        catalog: HandlerCatalog,
        hooks: WorkerHooks,
    ) -> Self {
        let stop = StopFlag::new();
        let reservations = ReservationLoop::new(
            HintSelector::new(config.brief_reserve()),
            config.reserve_backoff(),
            stop.clone(),
        );
        Self {
            queue,
            settings: DispatchSettings::from(&config),
            config,
            router,
            catalog,
            hooks,
            reservations,
            stop,
            stats: WorkerStats::default(),
        }
    }

    /// Build the routing table from `config.route_files`.
    pub fn from_config(
        queue: Q,
        config: WorkerConfig,
        catalog: HandlerCatalog,
        hooks: WorkerHooks,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let router = JobRouter::from_files(&config.route_files, &catalog)?;
        Ok(Self::new(queue, config, router, catalog, hooks))
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn router(&self) -> &JobRouter {
        &self.router
    }

    /// Run until stopped or interrupted, then drain.
    pub fn run(&mut self) -> Result<WorkerStats, WorkerError> {
        if self.config.trap_signals {
            install_signal_handlers(&self.stop)?;
        }
        self.startup()?;

        match self.main_loop() {
            Ok(()) => info!(worker = %self.config.name, "stop requested"),
            Err(err) => info!(worker = %self.config.name, reason = %err, "worker interrupted"),
        }

        self.shutdown();
        Ok(self.stats.clone())
    }

    /// Watch the configured tubes and ignore everything else.
    fn startup(&mut self) -> Result<(), WorkerError> {
        let kinds: Vec<&str> = self.router.kinds().collect();
        info!(worker = %self.config.name, servers = ?self.config.servers, ?kinds, "starting worker");
        for tube in &self.config.tubes {
            self.queue.watch(tube).map_err(WorkerError::Startup)?;
            info!(%tube, "watching tube");
        }
        let watched = self.queue.list_tubes_watched().map_err(WorkerError::Startup)?;
        for tube in watched.iter().filter(|t| !self.config.tubes.contains(*t)) {
            self.queue.ignore(tube).map_err(WorkerError::Startup)?;
            info!(%tube, "ignoring tube");
        }
        Ok(())
    }

    fn main_loop(&mut self) -> Result<(), QueueError> {
        loop {
            if self.stop.is_set() {
                return Ok(());
            }
            let job = self.reservations.get_job(&mut self.queue, &self.hooks)?;
            track(&mut self.stats, &self.hooks, JobEvent::Reserved(job.id));
            self.safe_dispatch(job)?;
        }
    }

    /// Dispatch one job and settle it on every path.
    ///
    /// Only an interruption escapes, after the job has been handed back.
    fn safe_dispatch(&mut self, job: Job) -> Result<(), QueueError> {
        info!(job_id = %job.id, server = %job.server, "got job");
        let id = job.id;

        let dispatcher = Dispatcher::new(&self.router, &self.catalog, &self.hooks, &self.settings);
        let mut held = HeldJob::new(&mut self.queue, job);

        let plan = match dispatcher.classify(&mut held) {
            Ok(plan) => plan,
            Err(err) if err.is_interrupt() => return hand_back(&mut held),
            Err(err) => {
                let reason = match &err {
                    DispatchError::Route(e) if e.is_not_acceptable() => "job not acceptable",
                    _ => "cannot classify job",
                };
                warn!(job_id = %id, error = %err, "{reason}; burying");
                match held.bury() {
                    Ok(()) => track(&mut self.stats, &self.hooks, JobEvent::Buried(id)),
                    Err(e) if e.is_interrupt() => return hand_back(&mut held),
                    Err(e) => warn!(job_id = %id, error = %e, "failed to bury job"),
                }
                return Ok(());
            }
        };
        let target = plan.direct_target().map(str::to_owned);

        let verdict = match dispatcher.execute(&mut held, plan) {
            Ok(outcome) => {
                let event = match outcome {
                    Outcome::Completed => JobEvent::Completed(id),
                    Outcome::Unroutable => JobEvent::Unroutable(id),
                    Outcome::Vetoed => JobEvent::Vetoed(id),
                    Outcome::StaleRecord => JobEvent::StaleRecord(id),
                };
                track(&mut self.stats, &self.hooks, event);
                return Ok(());
            }
            Err(err) if err.is_interrupt() => return hand_back(&mut held),
            Err(DispatchError::Timeout(limit)) => {
                track(&mut self.stats, &self.hooks, JobEvent::TimedOut(id));
                let policy = TimeoutPolicy {
                    decay_factor: self.config.decay_factor,
                    custom: self.hooks.timeout_handler.as_ref(),
                };
                policy.handle(&mut held, limit)
            }
            Err(err) => {
                track(&mut self.stats, &self.hooks, JobEvent::Failed(id));
                let policy = ErrorPolicy {
                    bury_after_releases: self.config.bury_after_releases,
                    decay_factor: self.config.decay_factor,
                    custom: self.hooks.error_handler.as_ref(),
                };
                let handler_override = target.as_deref().and_then(|name| self.catalog.error_handler(name));
                policy.handle(&mut held, &err, handler_override)
            }
        };
        if let Some(event) = verdict_event(verdict, id) {
            track(&mut self.stats, &self.hooks, event);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("finishing all running jobs; interrupt again to kill them");
        if let Some(finish) = &self.hooks.finish {
            finish();
        }
        info!(worker = %self.config.name, stats = ?self.stats, "worker stopped");
    }
}

/// Release an interrupted job for immediate retry, then propagate.
fn hand_back(held: &mut HeldJob<'_>) -> Result<(), QueueError> {
    if !held.is_settled() {
        let pri = held.stats().map(|s| s.pri).unwrap_or(DEFAULT_PRIORITY);
        if let Err(e) = held.release(pri, Duration::ZERO) {
            warn!(job_id = %held.job().id, error = %e, "failed to release interrupted job");
        }
    }
    Err(QueueError::Interrupted)
}
