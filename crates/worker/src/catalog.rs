//! Named handlers supplied by the host application.
//!
//! Route definitions and direct jobs refer to handlers by name; the catalog
//! is the only place those names resolve to code. It also carries the
//! optional per-handler error override consulted by the error policy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use tubeworker_core::QueueError;

use crate::dispatch::DispatchError;
use crate::held::HeldJob;
use crate::hooks::ErrorHook;

/// Application job handler. Receives the job payload.
///
/// Must be `Send + Sync + 'static` because deadline enforcement runs it on a
/// separate thread.
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Returned by a handler when the record a job refers to does not exist.
///
/// For direct jobs this selects the stale-record policy (delete when old,
/// decay when young) instead of the error policy.
#[derive(Debug, Error)]
#[error("record not found: {0}")]
pub struct RecordMissing(pub String);

/// Registry of handler name → handler (+ optional error override).
#[derive(Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Handler>,
    error_handlers: HashMap<String, ErrorHook>,
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerCatalog")
            .field("handlers", &names)
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register an error override for the handler called `name`.
    ///
    /// Only direct jobs consult it; it runs before the worker-wide policy.
    pub fn register_error_handler<F>(&mut self, name: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&mut HeldJob<'_>, &DispatchError) -> Result<(), QueueError> + Send + Sync + 'static,
    {
        self.error_handlers.insert(name.into(), Box::new(hook));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn error_handler(&self, name: &str) -> Option<&ErrorHook> {
        self.error_handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
