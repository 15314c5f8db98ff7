//! Queue client error model.

use thiserror::Error;

use crate::job::{JobId, ServerId};

/// Errors surfaced by a [`Queue`](crate::Queue) implementation.
///
/// `Interrupted` is special: it means a termination signal arrived while the
/// client was blocked, and every layer above must propagate it untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A termination signal interrupted a blocking call.
    #[error("interrupted by termination signal")]
    Interrupted,

    /// Advisory: the TTR of a job already reserved on this connection is
    /// about to expire.
    #[error("deadline soon for a reserved job")]
    DeadlineSoon,

    /// The reservation returned without a job.
    #[error("reservation timed out")]
    TimedOut,

    /// The job no longer exists (or is not reserved by us).
    #[error("job {0} not found")]
    NotFound(JobId),

    /// Could not reach a server.
    #[error("connection to {server} failed: {reason}")]
    Connection { server: ServerId, reason: String },

    /// The server answered something the client did not expect.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The worker already acknowledged this job; the call never left the
    /// process.
    #[error("job {0} was already settled")]
    AlreadySettled(JobId),
}

impl QueueError {
    pub fn connection(server: &ServerId, reason: impl Into<String>) -> Self {
        Self::Connection {
            server: server.clone(),
            reason: reason.into(),
        }
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse(msg.into())
    }

    /// Whether this error must unwind to the lifecycle controller.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
