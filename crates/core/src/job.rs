//! Jobs as seen by the worker: identity, raw body and a stats snapshot.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority beanstalkd assigns when a client does not pick one.
pub const DEFAULT_PRIORITY: u32 = 65_536;

/// Queue-assigned job identifier (unique per server).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the server (connection) a job was reserved from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A reserved job.
///
/// The queue owns the job; the worker only holds it between `reserve` and
/// one of delete/release/bury.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub server: ServerId,
    pub body: Vec<u8>,
}

impl Job {
    pub fn new(id: JobId, server: ServerId, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            server,
            body: body.into(),
        }
    }

    /// Decode the structured body (`{"kind": .., "data": ..}`).
    pub fn decode(&self) -> Result<JobBody, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Structured job payload.
///
/// `kind` is the dispatch key. It is kept as raw JSON so that a body with a
/// missing or non-string `kind` still decodes; such a job is unroutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBody {
    #[serde(default)]
    pub kind: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

impl JobBody {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(Value::String(kind.into())),
            data,
        }
    }

    /// The dispatch key, if `kind` is present and a string.
    pub fn kind_str(&self) -> Option<&str> {
        self.kind.as_ref().and_then(Value::as_str)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a `Value`-backed struct cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Queue-reported job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Reserved,
    Delayed,
    Buried,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::Reserved => "reserved",
            Self::Delayed => "delayed",
            Self::Buried => "buried",
        })
    }
}

/// Stats snapshot for a single job. Durations are whole seconds, as the
/// protocol reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub id: JobId,
    pub tube: String,
    pub state: JobState,
    pub pri: u32,
    pub age: u64,
    pub delay: u64,
    pub ttr: u64,
    pub time_left: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
}
