use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::Queue;
use crate::error::QueueError;
use crate::job::{DEFAULT_PRIORITY, Job, JobId, JobState, JobStats, ServerId};

const DEFAULT_SERVER: &str = "127.0.0.1:11300";
const DEFAULT_TUBE: &str = "default";
const DEFAULT_TTR_SECS: u64 = 120;

/// Queue operations that can be scripted to fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    Reserve,
    Delete,
    Release,
    Bury,
    Stats,
}

/// Everything the queue did, in order. Tests assert on this log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Reserved {
        id: JobId,
        server: ServerId,
        hint: Option<ServerId>,
    },
    Deleted(JobId),
    Released {
        id: JobId,
        delay: u64,
    },
    Buried(JobId),
}

impl QueueEvent {
    /// The job this event acknowledged, if it is a delete/release/bury.
    pub fn acked_job(&self) -> Option<JobId> {
        match self {
            Self::Deleted(id) | Self::Buried(id) | Self::Released { id, .. } => Some(*id),
            Self::Reserved { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    server: ServerId,
    tube: String,
    body: Vec<u8>,
    state: JobState,
    pri: u32,
    delay: u64,
    ttr: u64,
    reserves: u32,
    timeouts: u32,
    releases: u32,
    buries: u32,
    created: Instant,
    age_offset: u64,
}

#[derive(Debug)]
struct State {
    servers: Vec<ServerId>,
    jobs: BTreeMap<JobId, Entry>,
    watched: Vec<String>,
    next_id: u64,
    cursor: usize,
    reserve_latency: Duration,
    interrupt_when_empty: bool,
    failures: HashMap<Op, VecDeque<QueueError>>,
    events: Vec<QueueEvent>,
    connects: usize,
}

impl State {
    fn take_failure(&mut self, op: Op) -> Option<QueueError> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn reserved_entry(&mut self, job: &Job) -> Result<&mut Entry, QueueError> {
        match self.jobs.get_mut(&job.id) {
            Some(entry) if entry.state == JobState::Reserved => Ok(entry),
            _ => Err(QueueError::NotFound(job.id)),
        }
    }

    fn next_ready(&self, server: &ServerId) -> Option<JobId> {
        self.jobs
            .iter()
            .filter(|(_, e)| {
                &e.server == server
                    && e.state == JobState::Ready
                    && self.watched.iter().any(|t| t == &e.tube)
            })
            .min_by_key(|(id, e)| (e.pri, **id))
            .map(|(id, _)| *id)
    }
}

/// In-process pool of one or more "servers".
///
/// Intended for tests/dev. Clones share state, so a test can hand one clone
/// to the worker and inspect another. Released jobs with a delay stay
/// `delayed` until [`InMemoryQueue::promote_delayed`] is called.
///
/// An empty reservation returns [`QueueError::Interrupted`] by default, as if
/// a termination signal arrived while blocked; see
/// [`InMemoryQueue::interrupt_when_empty`].
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<State>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_servers([DEFAULT_SERVER])
    }

    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers: Vec<ServerId> = servers.into_iter().map(ServerId::new).collect();
        Self {
            inner: Arc::new(Mutex::new(State {
                servers,
                jobs: BTreeMap::new(),
                watched: vec![DEFAULT_TUBE.to_string()],
                next_id: 1,
                cursor: 0,
                reserve_latency: Duration::ZERO,
                interrupt_when_empty: true,
                failures: HashMap::new(),
                events: Vec::new(),
                connects: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn servers(&self) -> Vec<ServerId> {
        self.state().servers.clone()
    }

    /// Put a job on the first server.
    pub fn put(&self, tube: &str, body: impl Into<Vec<u8>>) -> JobId {
        let server = self.state().servers.first().cloned();
        let server = server.unwrap_or_else(|| ServerId::from(DEFAULT_SERVER));
        self.put_on(&server, tube, body)
    }

    pub fn put_json(&self, tube: &str, body: &Value) -> JobId {
        self.put(tube, body.to_string())
    }

    pub fn put_on(&self, server: &ServerId, tube: &str, body: impl Into<Vec<u8>>) -> JobId {
        let mut state = self.state();
        let id = JobId(state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            id,
            Entry {
                server: server.clone(),
                tube: tube.to_string(),
                body: body.into(),
                state: JobState::Ready,
                pri: DEFAULT_PRIORITY,
                delay: 0,
                ttr: DEFAULT_TTR_SECS,
                reserves: 0,
                timeouts: 0,
                releases: 0,
                buries: 0,
                created: Instant::now(),
                age_offset: 0,
            },
        );
        id
    }

    pub fn set_releases(&self, id: JobId, releases: u32) {
        if let Some(e) = self.state().jobs.get_mut(&id) {
            e.releases = releases;
        }
    }

    pub fn set_ttr(&self, id: JobId, ttr_secs: u64) {
        if let Some(e) = self.state().jobs.get_mut(&id) {
            e.ttr = ttr_secs;
        }
    }

    /// Make a job look `secs` older than it is.
    pub fn backdate(&self, id: JobId, secs: u64) {
        if let Some(e) = self.state().jobs.get_mut(&id) {
            e.age_offset += secs;
        }
    }

    /// Make every delayed job ready again.
    pub fn promote_delayed(&self) {
        for e in self.state().jobs.values_mut() {
            if e.state == JobState::Delayed {
                e.state = JobState::Ready;
            }
        }
    }

    /// Sleep this long inside every `reserve`.
    pub fn set_reserve_latency(&self, latency: Duration) {
        self.state().reserve_latency = latency;
    }

    /// When false, an empty reservation returns [`QueueError::TimedOut`]
    /// instead of [`QueueError::Interrupted`].
    pub fn interrupt_when_empty(&self, interrupt: bool) {
        self.state().interrupt_when_empty = interrupt;
    }

    /// Make the next call of `op` fail with `err` (calls queue up FIFO).
    pub fn fail_next(&self, op: Op, err: QueueError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn state_of(&self, id: JobId) -> Option<JobState> {
        self.state().jobs.get(&id).map(|e| e.state)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.state().jobs.contains_key(&id)
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.state().events.clone()
    }

    /// Delete/release/bury events for one job.
    pub fn acks_for(&self, id: JobId) -> Vec<QueueEvent> {
        self.state()
            .events
            .iter()
            .filter(|e| e.acked_job() == Some(id))
            .cloned()
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

impl Queue for InMemoryQueue {
    fn connect(&mut self) -> Result<(), QueueError> {
        let mut state = self.state();
        state.connects += 1;
        match state.take_failure(Op::Connect) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reserve(&mut self, on: Option<&ServerId>) -> Result<Job, QueueError> {
        let (latency, scripted) = {
            let mut state = self.state();
            (state.reserve_latency, state.take_failure(Op::Reserve))
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if let Some(err) = scripted {
            return Err(err);
        }

        let mut state = self.state();
        let order: Vec<ServerId> = match on {
            Some(server) => {
                if !state.servers.contains(server) {
                    return Err(QueueError::connection(server, "unknown server"));
                }
                vec![server.clone()]
            }
            None => {
                let n = state.servers.len();
                let start = state.cursor;
                state.cursor = (start + 1) % n.max(1);
                (0..n)
                    .map(|i| state.servers[(start + i) % n].clone())
                    .collect()
            }
        };

        let found = order.iter().find_map(|s| state.next_ready(s));
        let Some(id) = found else {
            return Err(if state.interrupt_when_empty {
                QueueError::Interrupted
            } else {
                QueueError::TimedOut
            });
        };

        let job = {
            let entry = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| QueueError::unexpected("job vanished while reserving"))?;
            entry.state = JobState::Reserved;
            entry.reserves += 1;
            Job::new(id, entry.server.clone(), entry.body.clone())
        };
        state.events.push(QueueEvent::Reserved {
            id,
            server: job.server.clone(),
            hint: on.cloned(),
        });
        Ok(job)
    }

    fn delete(&mut self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::Delete) {
            return Err(err);
        }
        state
            .jobs
            .remove(&job.id)
            .ok_or(QueueError::NotFound(job.id))?;
        state.events.push(QueueEvent::Deleted(job.id));
        Ok(())
    }

    fn release(&mut self, job: &Job, pri: u32, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::Release) {
            return Err(err);
        }
        let entry = state.reserved_entry(job)?;
        let delay = delay.as_secs();
        entry.pri = pri;
        entry.delay = delay;
        entry.releases += 1;
        entry.state = if delay > 0 {
            JobState::Delayed
        } else {
            JobState::Ready
        };
        state.events.push(QueueEvent::Released { id: job.id, delay });
        Ok(())
    }

    fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::Bury) {
            return Err(err);
        }
        let entry = state.reserved_entry(job)?;
        entry.pri = pri;
        entry.buries += 1;
        entry.state = JobState::Buried;
        state.events.push(QueueEvent::Buried(job.id));
        Ok(())
    }

    fn stats(&mut self, job: &Job) -> Result<JobStats, QueueError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::Stats) {
            return Err(err);
        }
        let e = state.jobs.get(&job.id).ok_or(QueueError::NotFound(job.id))?;
        Ok(JobStats {
            id: job.id,
            tube: e.tube.clone(),
            state: e.state,
            pri: e.pri,
            age: e.created.elapsed().as_secs() + e.age_offset,
            delay: e.delay,
            ttr: e.ttr,
            time_left: e.ttr,
            reserves: e.reserves,
            timeouts: e.timeouts,
            releases: e.releases,
            buries: e.buries,
        })
    }

    fn watch(&mut self, tube: &str) -> Result<usize, QueueError> {
        let mut state = self.state();
        if !state.watched.iter().any(|t| t == tube) {
            state.watched.push(tube.to_string());
        }
        Ok(state.watched.len())
    }

    fn ignore(&mut self, tube: &str) -> Result<usize, QueueError> {
        let mut state = self.state();
        if state.watched.len() == 1 && state.watched[0] == tube {
            return Err(QueueError::unexpected("NOT_IGNORED"));
        }
        state.watched.retain(|t| t != tube);
        Ok(state.watched.len())
    }

    fn list_tubes_watched(&mut self) -> Result<Vec<String>, QueueError> {
        Ok(self.state().watched.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_lowest_id_on_watched_tube() {
        let mut q = InMemoryQueue::new();
        let first = q.put("default", "a");
        q.put("default", "b");
        q.put("other", "c");

        let job = q.reserve(None).unwrap();
        assert_eq!(job.id, first);
        assert_eq!(q.state_of(first), Some(JobState::Reserved));
    }

    #[test]
    fn ignores_unwatched_tubes_until_watched() {
        let mut q = InMemoryQueue::new();
        let id = q.put("emails", "x");

        assert_eq!(q.reserve(None), Err(QueueError::Interrupted));

        q.watch("emails").unwrap();
        assert_eq!(q.reserve(None).unwrap().id, id);
    }

    #[test]
    fn empty_reservation_can_time_out_instead() {
        let mut q = InMemoryQueue::new();
        q.interrupt_when_empty(false);
        assert_eq!(q.reserve(None), Err(QueueError::TimedOut));
    }

    #[test]
    fn pinned_reservation_only_uses_that_server() {
        let mut q = InMemoryQueue::with_servers(["a:1", "b:1"]);
        let b = ServerId::from("b:1");
        q.put_on(&ServerId::from("a:1"), "default", "on-a");
        let on_b = q.put_on(&b, "default", "on-b");

        let job = q.reserve(Some(&b)).unwrap();
        assert_eq!(job.id, on_b);
        assert_eq!(
            q.events(),
            vec![QueueEvent::Reserved {
                id: on_b,
                server: b.clone(),
                hint: Some(b)
            }]
        );
    }

    #[test]
    fn default_pool_rotates_across_servers() {
        let mut q = InMemoryQueue::with_servers(["a:1", "b:1"]);
        q.put_on(&ServerId::from("a:1"), "default", "1");
        q.put_on(&ServerId::from("a:1"), "default", "2");
        q.put_on(&ServerId::from("b:1"), "default", "3");

        let servers: Vec<_> = (0..3).map(|_| q.reserve(None).unwrap().server).collect();
        assert_eq!(servers[0].as_str(), "a:1");
        assert_eq!(servers[1].as_str(), "b:1");
        assert_eq!(servers[2].as_str(), "a:1");
    }

    #[test]
    fn release_with_delay_counts_and_delays() {
        let mut q = InMemoryQueue::new();
        let id = q.put("default", "x");
        let job = q.reserve(None).unwrap();

        q.release(&job, 10, Duration::from_secs(3)).unwrap();
        let stats = q.stats(&job).unwrap();
        assert_eq!(stats.state, JobState::Delayed);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.delay, 3);
        assert_eq!(stats.pri, 10);

        q.promote_delayed();
        assert_eq!(q.state_of(id), Some(JobState::Ready));
    }

    #[test]
    fn release_and_bury_require_a_reservation() {
        let mut q = InMemoryQueue::new();
        let id = q.put("default", "x");
        let job = Job::new(id, ServerId::from(DEFAULT_SERVER), "x");

        assert_eq!(q.bury(&job, 1), Err(QueueError::NotFound(id)));
        assert_eq!(
            q.release(&job, 1, Duration::ZERO),
            Err(QueueError::NotFound(id))
        );
        q.delete(&job).unwrap();
        assert!(!q.contains(id));
    }

    #[test]
    fn scripted_failures_fire_once_in_order() {
        let mut q = InMemoryQueue::new();
        q.put("default", "x");
        q.fail_next(Op::Reserve, QueueError::DeadlineSoon);
        q.fail_next(Op::Reserve, QueueError::TimedOut);

        assert_eq!(q.reserve(None), Err(QueueError::DeadlineSoon));
        assert_eq!(q.reserve(None), Err(QueueError::TimedOut));
        assert!(q.reserve(None).is_ok());
    }

    #[test]
    fn cannot_ignore_last_watched_tube() {
        let mut q = InMemoryQueue::new();
        assert!(q.ignore("default").is_err());
        q.watch("emails").unwrap();
        assert_eq!(q.ignore("default").unwrap(), 1);
        assert_eq!(q.list_tubes_watched().unwrap(), vec!["emails".to_string()]);
    }

    #[test]
    fn backdate_ages_job() {
        let mut q = InMemoryQueue::new();
        q.put("default", "x");
        let job = q.reserve(None).unwrap();
        q.backdate(job.id, 90);
        assert!(q.stats(&job).unwrap().age >= 90);
    }
}
