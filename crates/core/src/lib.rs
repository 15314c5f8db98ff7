//! `tubeworker-core`: the work-queue boundary.
//!
//! This crate describes what the worker consumes from a beanstalkd-style
//! queue (jobs, their stats, the client operations) without implementing the
//! wire protocol. The worker crate only ever talks to a [`Queue`].

pub mod error;
pub mod job;
pub mod queue;

pub use error::QueueError;
pub use job::{DEFAULT_PRIORITY, Job, JobBody, JobId, JobState, JobStats, ServerId};
pub use queue::{InMemoryQueue, Op, Queue, QueueEvent};
