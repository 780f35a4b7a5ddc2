//! Process-level settings, loaded from environment variables at startup.
//!
//! Task manager tuning lives in [`docflow_core::Config`]; this only covers what
//! the binary itself owns.

/// Settings for the `docflow` process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `tracing` filter string, e.g. `"info"` or `"docflow_core=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Settings {
    /// Build [`Settings`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            log_level: env_or("DOCFLOW_LOG", "info"),
            log_json: env_flag("DOCFLOW_LOG_JSON"),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
