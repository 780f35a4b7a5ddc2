//! Task manager configuration, loaded from environment variables at startup.

use std::time::Duration;

use thiserror::Error;

use crate::runtime::reaper::ReaperConfig;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Runtime configuration for the task manager and its reaper.
///
/// Every field has a default so the service works without any environment
/// variables set.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of workers running the document processor concurrently.
    pub workers: usize,

    /// Capacity of the queue between `submit` and the workers. A full queue
    /// rejects new submissions with `QueueFull`.
    pub queue_capacity: usize,

    /// Deadline for one task across all of its attempts. `None` disables it.
    pub processing_timeout: Option<Duration>,

    /// Processor invocations per task before it is declared failed.
    pub max_attempts: u32,

    /// How long a finished task stays queryable.
    pub retention: Duration,

    /// How often the reaper sweeps for expired tasks.
    pub sweep_interval: Duration,

    /// Log a warning for tasks processing longer than this. `None` disables it.
    pub stale_processing_after: Option<Duration>,

    /// Largest accepted document.
    pub max_input_bytes: u64,

    /// MIME types accepted at submission (compared case-insensitively).
    pub accepted_content_types: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            processing_timeout: Some(Duration::from_secs(600)),
            max_attempts: 1,
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            stale_processing_after: None,
            max_input_bytes: 50 * 1024 * 1024,
            accepted_content_types: vec![PDF_CONTENT_TYPE.to_owned(), DOCX_CONTENT_TYPE.to_owned()],
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("at least one accepted content type is required")]
    NoContentTypes,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    ///
    /// Durations are given in whole seconds; `0` disables the optional ones.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            workers: parse_or(&lookup, "DOCFLOW_WORKERS", defaults.workers),
            queue_capacity: parse_or(&lookup, "DOCFLOW_QUEUE_CAPACITY", defaults.queue_capacity),
            processing_timeout: optional_secs(
                &lookup,
                "DOCFLOW_PROCESSING_TIMEOUT_SECS",
                defaults.processing_timeout,
            ),
            max_attempts: parse_or(&lookup, "DOCFLOW_MAX_ATTEMPTS", defaults.max_attempts),
            retention: secs_or(&lookup, "DOCFLOW_RETENTION_SECS", defaults.retention),
            sweep_interval: secs_or(&lookup, "DOCFLOW_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            stale_processing_after: optional_secs(
                &lookup,
                "DOCFLOW_STALE_AFTER_SECS",
                defaults.stale_processing_after,
            ),
            max_input_bytes: parse_or(&lookup, "DOCFLOW_MAX_INPUT_BYTES", defaults.max_input_bytes),
            accepted_content_types: lookup("DOCFLOW_ACCEPTED_TYPES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.accepted_content_types),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { field: "workers" });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero { field: "queue_capacity" });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_attempts" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero { field: "sweep_interval" });
        }
        if self.max_input_bytes == 0 {
            return Err(ConfigError::Zero { field: "max_input_bytes" });
        }
        if self.accepted_content_types.is_empty() {
            return Err(ConfigError::NoContentTypes);
        }
        Ok(())
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: self.sweep_interval,
            retention: self.retention,
            stale_processing_after: self.stale_processing_after,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn optional_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Option<Duration>,
) -> Option<Duration> {
    match lookup(key).and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg, Config::default());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.retention, Duration::from_secs(300));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DOCFLOW_WORKERS", "8"),
            ("DOCFLOW_PROCESSING_TIMEOUT_SECS", "0"),
            ("DOCFLOW_RETENTION_SECS", "3600"),
            ("DOCFLOW_STALE_AFTER_SECS", "900"),
            ("DOCFLOW_ACCEPTED_TYPES", "text/plain, application/pdf ,"),
        ]));
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.processing_timeout, None);
        assert_eq!(cfg.retention, Duration::from_secs(3600));
        assert_eq!(cfg.stale_processing_after, Some(Duration::from_secs(900)));
        assert_eq!(cfg.accepted_content_types, vec!["text/plain", "application/pdf"]);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let cfg = Config::from_lookup(lookup_from(&[("DOCFLOW_QUEUE_CAPACITY", "lots")]));
        assert_eq!(cfg.queue_capacity, 64);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = Config {
            workers: 0,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero { field: "workers" }));
    }
}
