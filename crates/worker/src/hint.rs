//! Connection affinity for reservations.
//!
//! A connection that hands out a job quickly probably has more queued, while
//! a slow answer usually means an empty tube. Sticking to a fast connection
//! keeps a busy server from starving behind round-robin polling of idle
//! ones; the preference drops as soon as that connection slows down.

use std::time::{Duration, Instant};

use tubeworker_core::{Job, Queue, QueueError, ServerId};

#[derive(Debug, Clone)]
pub struct HintSelector {
    hint: Option<ServerId>,
    brief: Duration,
}

impl HintSelector {
    pub fn new(brief: Duration) -> Self {
        Self { hint: None, brief }
    }

    /// The connection the next reservation will prefer, if any.
    pub fn hint(&self) -> Option<&ServerId> {
        self.hint.as_ref()
    }

    pub fn clear(&mut self) {
        self.hint = None;
    }

    /// Reserve through the preferred connection (or the pool), then recompute
    /// the hint from this attempt's latency and result.
    pub fn reserve(&mut self, queue: &mut dyn Queue) -> Result<Job, QueueError> {
        let mut attempt = Attempt {
            selector: self,
            started: Instant::now(),
            server: None,
        };
        let result = queue.reserve(attempt.selector.hint.as_ref());
        if let Ok(job) = &result {
            attempt.server = Some(job.server.clone());
        }
        result
    }

    /// Keep `server` preferred iff the attempt was brief and produced a job.
    pub fn record(&mut self, elapsed: Duration, server: Option<ServerId>) {
        self.hint = match server {
            Some(server) if elapsed < self.brief => Some(server),
            _ => None,
        };
    }
}

/// Recomputes the hint when dropped, so it runs on every exit path.
struct Attempt<'a> {
    selector: &'a mut HintSelector,
    started: Instant,
    server: Option<ServerId>,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.selector.record(elapsed, self.server.take());
    }
}
