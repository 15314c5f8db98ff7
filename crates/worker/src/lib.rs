//! `tubeworker-worker`: a long-running consumer for beanstalkd-style queues.
//!
//! The worker reserves jobs (preferring a connection that answered quickly
//! last time), classifies each one by its `kind`/`method`, runs the matching
//! handler under an optional deadline, and acknowledges the job exactly once:
//! delete on success, decay or bury on failure, decay on timeout.
//!
//! ```no_run
//! use tubeworker_core::InMemoryQueue;
//! use tubeworker_worker::{HandlerCatalog, JobRouter, Worker, WorkerConfig, WorkerHooks};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = JobRouter::builder();
//! router.with("jobs", |r| {
//!     r.on("send_email", |body| {
//!         tracing::info!(to = %body["to"], "sending");
//!         Ok(())
//!     })?;
//!     Ok(())
//! })?;
//!
//! let mut worker = Worker::new(
//!     InMemoryQueue::new(),
//!     WorkerConfig::default(),
//!     router.build(),
//!     HandlerCatalog::new(),
//!     WorkerHooks::new(),
//! );
//! let stats = worker.run()?;
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod deadline;
pub mod dispatch;
pub mod held;
pub mod hint;
pub mod hooks;
pub mod lifecycle;
pub mod policy;
pub mod reserve;
pub mod router;
pub mod worker;

pub use catalog::{Handler, HandlerCatalog, RecordMissing};
pub use config::{ConfigError, WorkerConfig};
pub use dispatch::{DispatchError, DispatchSettings, Dispatcher, Outcome, Plan};
pub use held::{Ack, HeldJob};
pub use hint::HintSelector;
pub use hooks::{ErrorHook, JobEvent, JobEventHook, TimeoutHook, WorkerHooks};
pub use lifecycle::{StopFlag, install_signal_handlers};
pub use policy::{ErrorPolicy, TimeoutPolicy, Verdict};
pub use reserve::ReservationLoop;
pub use router::{JobRouter, RouteDefinition, RouteError, RouterBuilder};
pub use worker::{Worker, WorkerError, WorkerStats};

/// Load configuration from `path`, set up logging from it, and build a
/// worker whose routes come from the configured route files.
pub fn bootstrap<Q: tubeworker_core::Queue>(
    path: impl AsRef<std::path::Path>,
    queue: Q,
    catalog: HandlerCatalog,
    hooks: WorkerHooks,
) -> Result<Worker<Q>, WorkerError> {
    let config = WorkerConfig::load(path)?;
    tubeworker_observability::init_from(&config.log);
    Worker::from_config(queue, config, catalog, hooks)
}
