//! Reservation loop: the only place reservation failures become a retry
//! policy.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use tubeworker_core::{Job, Queue, QueueError};

use crate::hint::HintSelector;
use crate::hooks::WorkerHooks;
use crate::lifecycle::StopFlag;

/// Granularity at which the backoff sleep checks the stop flag.
const BACKOFF_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct ReservationLoop {
    selector: HintSelector,
    backoff: Duration,
    stop: StopFlag,
}

impl ReservationLoop {
    pub fn new(selector: HintSelector, backoff: Duration, stop: StopFlag) -> Self {
        Self {
            selector,
            backoff,
            stop,
        }
    }

    pub fn selector(&self) -> &HintSelector {
        &self.selector
    }

    /// Block until a job is reserved.
    ///
    /// Only [`QueueError::Interrupted`] is ever returned; every other failure
    /// is retried, `DeadlineSoon` immediately and the rest after the backoff.
    pub fn get_job(&mut self, queue: &mut dyn Queue, hooks: &WorkerHooks) -> Result<Job, QueueError> {
        loop {
            match self.attempt(queue, hooks) {
                Ok(job) => return Ok(job),
                Err(err) if err.is_interrupt() => return Err(err),
                Err(QueueError::DeadlineSoon) => {
                    // Expected and self-limiting; the before-reserve hooks get
                    // a chance to clean up on the next attempt.
                    info!("job deadline soon; you should clean up");
                }
                Err(err) => {
                    self.selector.clear();
                    warn!(
                        error = %err,
                        backoff_secs = self.backoff.as_secs_f64(),
                        "failed to get a job; backing off"
                    );
                    self.sleep_backoff()?;
                }
            }
        }
    }

    fn attempt(&mut self, queue: &mut dyn Queue, hooks: &WorkerHooks) -> Result<Job, QueueError> {
        queue.connect()?;
        hooks.run_before_reserve();
        if self.stop.is_set() {
            return Err(QueueError::Interrupted);
        }
        self.selector.reserve(queue)
    }

    fn sleep_backoff(&self) -> Result<(), QueueError> {
        let until = Instant::now() + self.backoff;
        loop {
            if self.stop.is_set() {
                return Err(QueueError::Interrupted);
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(BACKOFF_SLICE.min(until - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tubeworker_core::{InMemoryQueue, Op, QueueEvent, ServerId};

    fn reservation_loop(backoff: Duration, stop: StopFlag) -> ReservationLoop {
        ReservationLoop::new(HintSelector::new(Duration::from_millis(100)), backoff, stop)
    }

    #[test]
    fn deadline_soon_retries_without_backoff() {
        let mut q = InMemoryQueue::new();
        let id = q.put("default", "{}");
        q.fail_next(Op::Reserve, QueueError::DeadlineSoon);
        q.fail_next(Op::Reserve, QueueError::DeadlineSoon);

        // A backoff this long would hang the test if it were applied.
        let mut rl = reservation_loop(Duration::from_secs(3600), StopFlag::new());
        let started = Instant::now();
        let job = rl.get_job(&mut q, &WorkerHooks::new()).unwrap();

        assert_eq!(job.id, id);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn other_failures_back_off_and_retry() {
        let mut q = InMemoryQueue::new();
        q.put("default", "{}");
        q.fail_next(Op::Reserve, QueueError::TimedOut);
        q.fail_next(
            Op::Connect,
            QueueError::connection(&ServerId::from("127.0.0.1:11300"), "refused"),
        );

        let mut rl = reservation_loop(Duration::from_millis(20), StopFlag::new());
        let started = Instant::now();
        assert!(rl.get_job(&mut q, &WorkerHooks::new()).is_ok());

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(q.connects(), 3);
    }

    #[test]
    fn failure_clears_hint() {
        let mut q = InMemoryQueue::new();
        q.put("default", "{}");
        q.put("default", "{}");

        let mut rl = reservation_loop(Duration::from_millis(1), StopFlag::new());
        rl.get_job(&mut q, &WorkerHooks::new()).unwrap();
        assert!(rl.selector().hint().is_some());

        q.fail_next(Op::Reserve, QueueError::unexpected("OUT_OF_MEMORY"));
        rl.get_job(&mut q, &WorkerHooks::new()).unwrap();

        // The retry after the failure went through the pool.
        let hinted = q
            .events()
            .into_iter()
            .filter(|e| matches!(e, QueueEvent::Reserved { hint: Some(_), .. }))
            .count();
        assert_eq!(hinted, 0);
    }

    #[test]
    fn interruption_propagates() {
        let mut q = InMemoryQueue::new();
        let mut rl = reservation_loop(Duration::from_secs(3600), StopFlag::new());
        assert_eq!(
            rl.get_job(&mut q, &WorkerHooks::new()),
            Err(QueueError::Interrupted)
        );
    }

    #[test]
    fn stop_requested_before_reserve_interrupts() {
        let mut q = InMemoryQueue::new();
        q.put("default", "{}");
        let stop = StopFlag::new();
        let trigger = stop.clone();
        let hooks = WorkerHooks::new().before_reserve(move || trigger.request_stop());

        let mut rl = reservation_loop(Duration::from_secs(3600), stop);
        assert_eq!(rl.get_job(&mut q, &hooks), Err(QueueError::Interrupted));
    }

    #[test]
    fn stop_during_backoff_interrupts() {
        let mut q = InMemoryQueue::new();
        q.interrupt_when_empty(false);
        let stop = StopFlag::new();
        let trigger = stop.clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request_stop();
        });

        let mut rl = reservation_loop(Duration::from_secs(3600), stop);
        let started = Instant::now();
        assert_eq!(
            rl.get_job(&mut q, &WorkerHooks::new()),
            Err(QueueError::Interrupted)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        signaller.join().unwrap();
    }

    #[test]
    fn before_reserve_hooks_run_every_attempt() {
        let mut q = InMemoryQueue::new();
        q.put("default", "{}");
        q.fail_next(Op::Reserve, QueueError::DeadlineSoon);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hooks = WorkerHooks::new().before_reserve(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut rl = reservation_loop(Duration::from_secs(3600), StopFlag::new());
        rl.get_job(&mut q, &hooks).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
