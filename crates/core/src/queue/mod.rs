//! Queue client boundary.
//!
//! [`Queue`] is the set of protocol primitives the worker relies on. It is a
//! pool-level view: `reserve(None)` load-balances across every configured
//! server, `reserve(Some(server))` pins the reservation to one connection.
//! All calls are blocking and are only ever made from the worker thread.

pub mod in_memory;

use std::time::Duration;

use crate::error::QueueError;
use crate::job::{Job, JobStats, ServerId};

pub use in_memory::{InMemoryQueue, Op, QueueEvent};

/// Protocol primitives consumed by the worker.
///
/// Implementations map a blocking read interrupted by a signal (`EINTR`) to
/// [`QueueError::Interrupted`].
pub trait Queue {
    /// Ensure every configured server has a live connection.
    fn connect(&mut self) -> Result<(), QueueError>;

    /// Block until a job is available on a watched tube.
    ///
    /// With `on` set, only that server's connection is used.
    fn reserve(&mut self, on: Option<&ServerId>) -> Result<Job, QueueError>;

    fn delete(&mut self, job: &Job) -> Result<(), QueueError>;

    fn release(&mut self, job: &Job, pri: u32, delay: Duration) -> Result<(), QueueError>;

    fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError>;

    fn stats(&mut self, job: &Job) -> Result<JobStats, QueueError>;

    /// Add a tube to the watch list; returns the number of watched tubes.
    fn watch(&mut self, tube: &str) -> Result<usize, QueueError>;

    /// Remove a tube from the watch list; returns the number of watched tubes.
    fn ignore(&mut self, tube: &str) -> Result<usize, QueueError>;

    fn list_tubes_watched(&mut self) -> Result<Vec<String>, QueueError>;
}

impl<Q: Queue + ?Sized> Queue for Box<Q> {
    fn connect(&mut self) -> Result<(), QueueError> {
        (**self).connect()
    }

    fn reserve(&mut self, on: Option<&ServerId>) -> Result<Job, QueueError> {
        (**self).reserve(on)
    }

    fn delete(&mut self, job: &Job) -> Result<(), QueueError> {
        (**self).delete(job)
    }

    fn release(&mut self, job: &Job, pri: u32, delay: Duration) -> Result<(), QueueError> {
        (**self).release(job, pri, delay)
    }

    fn bury(&mut self, job: &Job, pri: u32) -> Result<(), QueueError> {
        (**self).bury(job, pri)
    }

    fn stats(&mut self, job: &Job) -> Result<JobStats, QueueError> {
        (**self).stats(job)
    }

    fn watch(&mut self, tube: &str) -> Result<usize, QueueError> {
        (**self).watch(tube)
    }

    fn ignore(&mut self, tube: &str) -> Result<usize, QueueError> {
        (**self).ignore(tube)
    }

    fn list_tubes_watched(&mut self) -> Result<Vec<String>, QueueError> {
        (**self).list_tubes_watched()
    }
}
