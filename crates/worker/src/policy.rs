//! What happens to a job after its handler failed or ran out of time.
//!
//! Both policies settle the job at most once through [`HeldJob`] and never
//! return an error: a failure while cleaning up is logged and dropped, and
//! the job stays reserved until its TTR hands it back to the queue.

use std::time::Duration;

use tracing::{debug, info, warn};

use tubeworker_core::{JobId, JobState, QueueError};

use crate::dispatch::DispatchError;
use crate::held::HeldJob;
use crate::hooks::{ErrorHook, TimeoutHook};

/// How a failure policy left the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Buried,
    Decayed,
    /// The handler's own error override settled the job (or let it go).
    Overridden,
    /// A worker-wide custom hook handled the job.
    Custom,
    /// Cleanup failed; the job is still reserved.
    Unsettled,
    /// The job was acknowledged before its handler ran (`deleteFirst`);
    /// there was nothing left to clean up.
    AlreadySettled,
}

/// Handler errors: bury jobs that keep failing, decay the rest.
#[derive(Clone, Copy)]
pub struct ErrorPolicy<'h> {
    pub bury_after_releases: u32,
    pub decay_factor: f64,
    pub custom: Option<&'h ErrorHook>,
}

impl ErrorPolicy<'_> {
    /// Apply the policy to a job whose handler returned `error`.
    ///
    /// `handler_override` is the per-handler error hook, if the job's
    /// handler has one. It runs first; if the job is no longer reserved
    /// afterwards, nothing else happens.
    pub fn handle(
        &self,
        held: &mut HeldJob<'_>,
        error: &DispatchError,
        handler_override: Option<&ErrorHook>,
    ) -> Verdict {
        let job_id = held.job().id;
        warn!(%job_id, server = %held.job().server, error = %error, "job failed");
        if held.is_settled() {
            return Verdict::AlreadySettled;
        }

        if let Some(hook) = handler_override {
            if let Err(e) = hook(held, error) {
                cleanup_failed(job_id, "handler error override", &e);
            }
            if !still_reserved(held) {
                return Verdict::Overridden;
            }
        }

        if let Some(hook) = self.custom {
            if let Err(e) = hook(held, error) {
                cleanup_failed(job_id, "custom error handler", &e);
            }
            return Verdict::Custom;
        }

        let releases = match held.stats() {
            Ok(stats) => stats.releases,
            Err(e) => {
                cleanup_failed(job_id, "stats", &e);
                return Verdict::Unsettled;
            }
        };

        if releases > self.bury_after_releases {
            match held.bury() {
                Ok(()) => {
                    warn!(%job_id, releases, "job kept failing; buried");
                    Verdict::Buried
                }
                Err(e) => {
                    cleanup_failed(job_id, "bury", &e);
                    Verdict::Unsettled
                }
            }
        } else {
            decay(held, self.decay_factor)
        }
    }
}

/// Deadline overruns: always decay, since timing out says nothing about
/// whether the job can ever succeed.
#[derive(Clone, Copy)]
pub struct TimeoutPolicy<'h> {
    pub decay_factor: f64,
    pub custom: Option<&'h TimeoutHook>,
}

impl TimeoutPolicy<'_> {
    pub fn handle(&self, held: &mut HeldJob<'_>, limit: Duration) -> Verdict {
        let job_id = held.job().id;
        info!(%job_id, limit_ms = limit.as_millis() as u64, "job timed out");
        if held.is_settled() {
            return Verdict::AlreadySettled;
        }

        if let Some(hook) = self.custom {
            if let Err(e) = hook(held) {
                cleanup_failed(job_id, "custom timeout handler", &e);
            }
            return Verdict::Custom;
        }
        decay(held, self.decay_factor)
    }
}

fn decay(held: &mut HeldJob<'_>, factor: f64) -> Verdict {
    match held.decay(factor) {
        Ok(()) => Verdict::Decayed,
        Err(e) => {
            cleanup_failed(held.job().id, "decay", &e);
            Verdict::Unsettled
        }
    }
}

fn still_reserved(held: &mut HeldJob<'_>) -> bool {
    if held.is_settled() {
        return false;
    }
    match held.stats() {
        Ok(stats) => stats.state == JobState::Reserved,
        Err(e) => {
            debug!(job_id = %held.job().id, error = %e, "job gone after error override");
            false
        }
    }
}

fn cleanup_failed(job_id: JobId, step: &str, error: &QueueError) {
    warn!(%job_id, step, error = %error, "failed to clean up after job failure; ignoring");
}
