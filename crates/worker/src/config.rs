//! Worker configuration.
//!
//! Loaded from a TOML file (every field optional), then overridden from
//! `TUBEWORKER_*` environment variables, then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use tubeworker_observability::LogConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings fixed before the worker starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name used in logs.
    pub name: String,
    /// Queue server addresses (`host:port`).
    pub servers: Vec<String>,
    /// Tubes to watch; every other tube is ignored at startup.
    pub tubes: Vec<String>,
    /// Route definition files loaded into the routing table.
    pub route_files: Vec<PathBuf>,
    /// Sleep after a failed reservation attempt.
    pub reserve_backoff_secs: u64,
    /// A reservation faster than this keeps its connection preferred.
    pub brief_reserve_ms: u64,
    /// Default error policy buries once releases exceed this.
    pub bury_after_releases: u32,
    /// Release delay multiplier used by decay.
    pub decay_factor: f64,
    /// Run handlers under a deadline derived from the job's TTR.
    pub enforce_deadline: bool,
    /// Fraction of the TTR handed to the handler as its deadline.
    pub deadline_ratio: f64,
    /// Direct jobs failing with a missing record are deleted past this age.
    pub stale_record_age_secs: u64,
    /// Reserved `kind` of direct-execution jobs.
    pub direct_kind: String,
    /// Install SIGTERM/SIGINT handlers in `Worker::run`.
    pub trap_signals: bool,
    pub log: LogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "tubeworker".to_string(),
            servers: vec!["127.0.0.1:11300".to_string()],
            tubes: vec!["default".to_string()],
            route_files: Vec::new(),
            reserve_backoff_secs: 60,
            brief_reserve_ms: 100,
            bury_after_releases: 10,
            decay_factor: 1.3,
            enforce_deadline: true,
            deadline_ratio: 0.8,
            stale_record_age_secs: 60,
            direct_kind: "direct".to_string(),
            trap_signals: true,
            log: LogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file, apply env overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `TUBEWORKER_*` overrides read through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TUBEWORKER_SERVERS") {
            self.servers = split_list(&v);
        }
        if let Some(v) = lookup("TUBEWORKER_TUBES") {
            self.tubes = split_list(&v);
        }
        if let Some(v) = lookup("TUBEWORKER_RESERVE_BACKOFF_SECS") {
            match v.trim().parse() {
                Ok(secs) => self.reserve_backoff_secs = secs,
                Err(_) => warn!(value = %v, "ignoring invalid TUBEWORKER_RESERVE_BACKOFF_SECS"),
            }
        }
        if let Some(v) = lookup("TUBEWORKER_ENFORCE_DEADLINE") {
            match v.trim().parse() {
                Ok(flag) => self.enforce_deadline = flag,
                Err(_) => warn!(value = %v, "ignoring invalid TUBEWORKER_ENFORCE_DEADLINE"),
            }
        }
        if let Some(v) = lookup("TUBEWORKER_LOG") {
            self.log.filter = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("at least one server is required".into()));
        }
        if self.tubes.is_empty() {
            return Err(ConfigError::Invalid("at least one tube is required".into()));
        }
        if self.deadline_ratio.is_nan() || self.deadline_ratio <= 0.0 || self.deadline_ratio > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "deadline_ratio must be in (0, 1], got {}",
                self.deadline_ratio
            )));
        }
        if !self.decay_factor.is_finite() || self.decay_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "decay_factor must be a finite number >= 1.0, got {}",
                self.decay_factor
            )));
        }
        if self.direct_kind.trim().is_empty() {
            return Err(ConfigError::Invalid("direct_kind must not be empty".into()));
        }
        Ok(())
    }

    pub fn reserve_backoff(&self) -> Duration {
        Duration::from_secs(self.reserve_backoff_secs)
    }

    pub fn brief_reserve(&self) -> Duration {
        Duration::from_millis(self.brief_reserve_ms)
    }

    pub fn stale_record_age(&self) -> Duration {
        Duration::from_secs(self.stale_record_age_secs)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use tubeworker_observability::LogFormat;

    #[test]
    fn empty_file_yields_defaults() {
        let config = WorkerConfig::from_toml_str("").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.reserve_backoff(), Duration::from_secs(60));
        assert_eq!(config.bury_after_releases, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_file() {
        let config = WorkerConfig::from_toml_str(
            r#"
            name = "mailer"
            servers = ["q1:11300", "q2:11300"]
            tubes = ["emails"]
            enforce_deadline = false
            route_files = ["config/routes.toml"]

            [log]
            format = "pretty"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "mailer");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.tubes, vec!["emails".to_string()]);
        assert!(!config.enforce_deadline);
        assert_eq!(config.route_files, vec![PathBuf::from("config/routes.toml")]);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.deadline_ratio, 0.8);
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(matches!(
            WorkerConfig::from_toml_str("tubes = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TUBEWORKER_TUBES", "a, b,,c"),
            ("TUBEWORKER_RESERVE_BACKOFF_SECS", "5"),
            ("TUBEWORKER_ENFORCE_DEADLINE", "nope"),
            ("TUBEWORKER_LOG", "debug"),
        ]);
        let mut config = WorkerConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.tubes, vec!["a", "b", "c"]);
        assert_eq!(config.reserve_backoff_secs, 5);
        assert!(config.enforce_deadline);
        assert_eq!(config.log.filter, "debug");
    }

    #[test]
    fn validation_catches_bad_values() {
        let no_tubes = WorkerConfig {
            tubes: vec![],
            ..Default::default()
        };
        assert!(no_tubes.validate().is_err());

        let ratio = WorkerConfig {
            deadline_ratio: 1.5,
            ..Default::default()
        };
        assert!(ratio.validate().is_err());

        let decay = WorkerConfig {
            decay_factor: 0.5,
            ..Default::default()
        };
        assert!(decay.validate().is_err());
    }

    #[test]
    fn non_numeric_factors_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY] {
            let decay = WorkerConfig {
                decay_factor: bad,
                ..Default::default()
            };
            assert!(matches!(decay.validate(), Err(ConfigError::Invalid(_))), "decay_factor {bad}");
        }

        let ratio = WorkerConfig {
            deadline_ratio: f64::NAN,
            ..Default::default()
        };
        assert!(ratio.validate().is_err());

        let edge = WorkerConfig {
            decay_factor: 1.0,
            deadline_ratio: 1.0,
            ..Default::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tubes = [\"reports\"]").unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.tubes, vec!["reports".to_string()]);
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            WorkerConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
