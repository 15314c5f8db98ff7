//! The job currently held by the worker, and its single acknowledgment.

use std::time::Duration;

use tracing::debug;

use tubeworker_core::{DEFAULT_PRIORITY, Job, JobStats, Queue, QueueError};

/// How a held job was acknowledged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ack {
    Deleted,
    Released,
    Buried,
}

/// A reserved job plus the queue it came from.
///
/// The first successful delete/release/bury is recorded; any later attempt
/// returns [`QueueError::AlreadySettled`] without touching the queue. A
/// failed acknowledgment is not recorded, so the caller may still fall back
/// to another one.
pub struct HeldJob<'q> {
    queue: &'q mut dyn Queue,
    job: Job,
    ack: Option<Ack>,
}

impl<'q> HeldJob<'q> {
    pub fn new(queue: &'q mut dyn Queue, job: Job) -> Self {
        Self {
            queue,
            job,
            ack: None,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn ack(&self) -> Option<Ack> {
        self.ack
    }

    pub fn is_settled(&self) -> bool {
        self.ack.is_some()
    }

    /// Fresh stats from the queue.
    pub fn stats(&mut self) -> Result<JobStats, QueueError> {
        self.queue.stats(&self.job)
    }

    pub fn delete(&mut self) -> Result<(), QueueError> {
        self.guard()?;
        self.queue.delete(&self.job)?;
        self.settle(Ack::Deleted);
        Ok(())
    }

    pub fn release(&mut self, pri: u32, delay: Duration) -> Result<(), QueueError> {
        self.guard()?;
        self.queue.release(&self.job, pri, delay)?;
        self.settle(Ack::Released);
        Ok(())
    }

    /// Bury at the job's current priority, or the default priority when
    /// stats cannot be read.
    pub fn bury(&mut self) -> Result<(), QueueError> {
        self.guard()?;
        let pri = match self.stats() {
            Ok(stats) => stats.pri,
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                debug!(job_id = %self.job.id, error = %e, "stats unavailable; burying at default priority");
                DEFAULT_PRIORITY
            }
        };
        self.queue.bury(&self.job, pri)?;
        self.settle(Ack::Buried);
        Ok(())
    }

    /// Release for retry with a grown delay:
    /// `ceil(max(1, current delay) * factor)` seconds, same priority.
    pub fn decay(&mut self, factor: f64) -> Result<(), QueueError> {
        self.guard()?;
        let stats = self.stats()?;
        let delay = decay_delay(stats.delay, factor);
        self.release(stats.pri, delay)
    }

    fn guard(&self) -> Result<(), QueueError> {
        match self.ack {
            Some(_) => Err(QueueError::AlreadySettled(self.job.id)),
            None => Ok(()),
        }
    }

    fn settle(&mut self, ack: Ack) {
        debug!(job_id = %self.job.id, ?ack, "job settled");
        self.ack = Some(ack);
    }
}

pub(crate) fn decay_delay(current_secs: u64, factor: f64) -> Duration {
    let base = current_secs.max(1) as f64;
    Duration::from_secs((base * factor).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubeworker_core::{InMemoryQueue, JobState, Op, QueueEvent};

    fn reserved(q: &mut InMemoryQueue) -> Job {
        q.put("default", "{}");
        q.reserve(None).unwrap()
    }

    #[test]
    fn second_ack_never_reaches_the_queue() {
        let mut q = InMemoryQueue::new();
        let job = reserved(&mut q);
        let id = job.id;
        let observer = q.clone();

        let mut held = HeldJob::new(&mut q, job);
        held.release(1, Duration::ZERO).unwrap();

        assert_eq!(held.bury(), Err(QueueError::AlreadySettled(id)));
        assert_eq!(held.delete(), Err(QueueError::AlreadySettled(id)));
        assert_eq!(held.ack(), Some(Ack::Released));
        assert_eq!(observer.acks_for(id).len(), 1);
    }

    #[test]
    fn failed_ack_is_not_recorded() {
        let mut q = InMemoryQueue::new();
        let job = reserved(&mut q);
        q.fail_next(Op::Delete, QueueError::unexpected("INTERNAL_ERROR"));
        let observer = q.clone();

        let mut held = HeldJob::new(&mut q, job);
        assert!(held.delete().is_err());
        assert!(!held.is_settled());

        held.bury().unwrap();
        assert_eq!(held.ack(), Some(Ack::Buried));
        assert_eq!(observer.state_of(held.job().id), Some(JobState::Buried));
    }

    #[test]
    fn bury_survives_a_stats_failure() {
        let mut q = InMemoryQueue::new();
        let job = reserved(&mut q);
        let id = job.id;
        q.fail_next(Op::Stats, QueueError::unexpected("INTERNAL_ERROR"));
        let observer = q.clone();

        let mut held = HeldJob::new(&mut q, job);
        held.bury().unwrap();

        assert_eq!(held.ack(), Some(Ack::Buried));
        assert_eq!(observer.acks_for(id), vec![QueueEvent::Buried(id)]);
        assert_eq!(observer.state_of(id), Some(JobState::Buried));
    }

    #[test]
    fn interrupted_stats_aborts_the_bury() {
        let mut q = InMemoryQueue::new();
        let job = reserved(&mut q);
        q.fail_next(Op::Stats, QueueError::Interrupted);

        let mut held = HeldJob::new(&mut q, job);
        assert_eq!(held.bury(), Err(QueueError::Interrupted));
        assert!(!held.is_settled());
    }

    #[test]
    fn decay_grows_delay_from_stats() {
        let mut q = InMemoryQueue::new();
        let job = reserved(&mut q);
        let id = job.id;
        let observer = q.clone();

        let mut held = HeldJob::new(&mut q, job);
        held.decay(1.3).unwrap();

        // max(1, 0) * 1.3 rounds up to 2 seconds.
        assert_eq!(observer.acks_for(id), vec![QueueEvent::Released { id, delay: 2 }]);
    }

    #[test]
    fn decay_delay_rounds_up() {
        assert_eq!(decay_delay(0, 1.3), Duration::from_secs(2));
        assert_eq!(decay_delay(2, 1.3), Duration::from_secs(3));
        assert_eq!(decay_delay(10, 1.3), Duration::from_secs(13));
        assert_eq!(decay_delay(5, 1.0), Duration::from_secs(5));
    }
}
