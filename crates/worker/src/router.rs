//! Routing table: (kind, method) → handler.
//!
//! The table is built once at startup from definitions, either through the
//! builder's grouping/registration calls (`with` + `on`) or from TOML route
//! files, and is immutable afterwards. Reloading means building a new one.
//!
//! Route file format:
//!
//! ```toml
//! [[with]]
//! kind = "jobs"
//!
//!   [[with.on]]
//!   method = "send_email"
//!   handler = "mailer.send_email"
//! ```
//!
//! `handler` is a name registered in the [`HandlerCatalog`]. A top-level
//! `[[on]]` entry (outside any `[[with]]` block) is rejected.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::catalog::{Handler, HandlerCatalog};

#[derive(Debug, Error)]
pub enum RouteError {
    /// A method was registered outside any kind group.
    #[error("route `{method}` registered outside a `with` block; wrap it with the kind it belongs to")]
    WithBlockNotPresent { method: String },

    #[error("no handler for kind = {0:?}")]
    KindUnknown(String),

    #[error("no handler for task = {method:?} (kind = {kind:?})")]
    TaskUnknown { kind: String, method: String },

    /// A definition names a handler the catalog does not have.
    #[error("handler {0:?} is not registered")]
    HandlerUnknown(String),

    #[error("failed to read route file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse route file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RouteError {
    /// The job names a kind or task the table does not accept.
    pub fn is_not_acceptable(&self) -> bool {
        matches!(self, Self::KindUnknown(_) | Self::TaskUnknown { .. })
    }
}

/// One `(kind, method, handler)` triple; `kind` is `None` for a method
/// declared outside any group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefinition {
    pub kind: Option<String>,
    pub method: String,
    pub handler: String,
}

#[derive(Debug, Deserialize)]
struct RouteFile {
    #[serde(default)]
    with: Vec<KindBlock>,
    #[serde(default)]
    on: Vec<MethodEntry>,
}

#[derive(Debug, Deserialize)]
struct KindBlock {
    kind: String,
    #[serde(default)]
    on: Vec<MethodEntry>,
}

#[derive(Debug, Deserialize)]
struct MethodEntry {
    method: String,
    handler: String,
}

/// Parse a route file's text into definitions.
pub fn parse_definitions(raw: &str, path: &Path) -> Result<Vec<RouteDefinition>, RouteError> {
    let file: RouteFile = toml::from_str(raw).map_err(|source| RouteError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let loose = file.on.into_iter().map(|e| RouteDefinition {
        kind: None,
        method: e.method,
        handler: e.handler,
    });
    let grouped = file.with.into_iter().flat_map(|block| {
        let kind = block.kind;
        block.on.into_iter().map(move |e| RouteDefinition {
            kind: Some(kind.clone()),
            method: e.method,
            handler: e.handler,
        })
    });

    Ok(loose.chain(grouped).collect())
}

/// Mutable stage of the routing table.
#[derive(Default)]
pub struct RouterBuilder {
    mapping: HashMap<String, HashMap<String, Handler>>,
    current_kind: Option<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group registrations under `kind` for the duration of `f`.
    pub fn with<F>(&mut self, kind: impl Into<String>, f: F) -> Result<&mut Self, RouteError>
    where
        F: FnOnce(&mut Self) -> Result<(), RouteError>,
    {
        let previous = self.current_kind.replace(kind.into());
        let result = f(self);
        self.current_kind = previous;
        result.map(|()| self)
    }

    /// Bind `method` to `handler` under the current kind.
    pub fn on<F>(&mut self, method: impl Into<String>, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_handler(method, Arc::new(handler))
    }

    /// Like [`RouterBuilder::on`] with an already shared handler.
    pub fn on_handler(
        &mut self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<&mut Self, RouteError> {
        let method = method.into();
        let Some(kind) = self.current_kind.clone() else {
            return Err(RouteError::WithBlockNotPresent { method });
        };
        info!(kind = %kind, method = %method, "registering route");
        self.mapping.entry(kind).or_default().insert(method, handler);
        Ok(self)
    }

    /// Register structured definitions, resolving handler names in `catalog`.
    pub fn define<I>(&mut self, defs: I, catalog: &HandlerCatalog) -> Result<&mut Self, RouteError>
    where
        I: IntoIterator<Item = RouteDefinition>,
    {
        for def in defs {
            let handler = catalog
                .get(&def.handler)
                .cloned()
                .ok_or_else(|| RouteError::HandlerUnknown(def.handler.clone()));
            match def.kind {
                Some(kind) => {
                    self.with(kind, |b| b.on_handler(def.method, handler?).map(|_| ()))?;
                }
                None => {
                    return Err(RouteError::WithBlockNotPresent { method: def.method });
                }
            }
        }
        Ok(self)
    }

    /// Load one route file.
    pub fn load_file(
        &mut self,
        path: impl AsRef<Path>,
        catalog: &HandlerCatalog,
    ) -> Result<&mut Self, RouteError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RouteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let defs = parse_definitions(&raw, path)?;
        self.define(defs, catalog)
    }

    pub fn build(self) -> JobRouter {
        JobRouter {
            mapping: self.mapping,
        }
    }
}

/// Immutable routing table.
#[derive(Default, Clone)]
pub struct JobRouter {
    mapping: HashMap<String, HashMap<String, Handler>>,
}

impl fmt::Debug for JobRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<String> = self
            .mapping
            .iter()
            .flat_map(|(kind, methods)| methods.keys().map(move |m| format!("{kind}/{m}")))
            .collect();
        routes.sort();
        f.debug_struct("JobRouter").field("routes", &routes).finish()
    }
}

impl JobRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Build a table from route files (in order; later files may override
    /// earlier methods of the same kind).
    pub fn from_files<I, P>(paths: I, catalog: &HandlerCatalog) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut builder = RouterBuilder::new();
        for path in paths {
            builder.load_file(path, catalog)?;
        }
        Ok(builder.build())
    }

    pub fn can_handle(&self, kind: &str) -> bool {
        self.mapping.contains_key(kind)
    }

    pub fn resolve(&self, kind: &str, method: &str) -> Result<&Handler, RouteError> {
        let methods = self
            .mapping
            .get(kind)
            .ok_or_else(|| RouteError::KindUnknown(kind.to_string()))?;
        methods.get(method).ok_or_else(|| RouteError::TaskUnknown {
            kind: kind.to_string(),
            method: method.to_string(),
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().map(String::as_str)
    }

    /// Number of (kind, method) routes.
    pub fn len(&self) -> usize {
        self.mapping.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
