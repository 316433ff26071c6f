//! Configuration system for forkstate.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::serializer::SerializerKind;
use crate::session::{KeyLayout, ResetMode};

/// Shortest lock TTL the configuration accepts, in seconds.
pub const MIN_LOCK_TTL_SECS: f64 = 0.1;

/// Longest lock timing (TTL, poll interval, wait budget) accepted, in seconds.
pub const MAX_LOCK_SECS: f64 = 86_400.0;

/// Longest session TTL accepted, in seconds (one year).
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 86_400;

/// Main configuration struct for forkstate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key-value server connection
    pub server: ServerConfig,
    /// Session store behaviour
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database index
    pub db: u32,
    /// Name announced to the server on startup
    pub client_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            client_name: "forkstate-sessions".to_string(),
        }
    }
}

impl ServerConfig {
    /// Connection URL for the configured server.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Prefix of every key the store writes
    pub namespace: String,
    /// Session expiry in seconds (0 = never)
    pub ttl: u64,
    /// Lock expiry in seconds
    pub lock_ttl: f64,
    /// Wait between two lock acquisition tries, in seconds
    pub lock_poll_time: f64,
    /// Maximum time to wait for a lock, in seconds (0 = forever)
    pub lock_max_wait_time: f64,
    /// What a reload does to existing sessions
    pub reset_on_reload: ResetMode,
    /// Fixed seed for the session epoch; random when unset
    pub version: Option<String>,
    /// Serializer for application data
    pub serializer: SerializerKind,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            namespace: "forkstate".to_string(),
            ttl: 0,
            lock_ttl: 5.0,
            lock_poll_time: 0.1,
            lock_max_wait_time: 5.0,
            reset_on_reload: ResetMode::Invalidate,
            version: None,
            serializer: SerializerKind::Json,
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }

    pub fn lock_ttl(&self) -> Duration {
        secs_f64(self.lock_ttl.max(MIN_LOCK_TTL_SECS))
    }

    pub fn lock_poll_time(&self) -> Duration {
        secs_f64(self.lock_poll_time)
    }

    pub fn lock_max_wait_time(&self) -> Option<Duration> {
        (self.lock_max_wait_time > 0.0).then(|| secs_f64(self.lock_max_wait_time))
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout::new(self.namespace.clone())
    }
}

/// Seconds to a `Duration`, clamped to `[0, Duration::MAX]`; NaN is zero.
fn secs_f64(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Validation result with multiple issues.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "sessions.lock_ttl")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from defaults, the user config file and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(None).extract()
    }

    /// Load configuration, layering an explicit file over the user config.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(Some(path.as_ref())).extract()
    }

    fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")));

        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }

        // FORKSTATE_SESSIONS__LOCK_TTL=2.5
        figment.merge(Env::prefixed("FORKSTATE_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::load_from(path),
            None => Self::load(),
        }
        .map_err(|e| Error::Config(e.to_string()))?;

        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Validation(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.server.host.is_empty() {
            result.add_error("server.host", "host cannot be empty");
        }

        if self.server.port == 0 {
            result.add_error("server.port", "port must be greater than 0");
        }

        let sessions = &self.sessions;

        if sessions.namespace.is_empty() {
            result.add_error("sessions.namespace", "namespace cannot be empty");
        } else if sessions.namespace.chars().any(char::is_whitespace) {
            result.add_error("sessions.namespace", "namespace cannot contain whitespace");
        }

        if sessions.ttl > MAX_SESSION_TTL_SECS {
            result.add_error(
                "sessions.ttl",
                format!("ttl cannot exceed {}s", MAX_SESSION_TTL_SECS),
            );
        }

        for (field, value) in [
            ("sessions.lock_ttl", sessions.lock_ttl),
            ("sessions.lock_poll_time", sessions.lock_poll_time),
            ("sessions.lock_max_wait_time", sessions.lock_max_wait_time),
        ] {
            if value > MAX_LOCK_SECS {
                result.add_error(field, format!("cannot exceed {}s", MAX_LOCK_SECS));
            }
        }

        if !sessions.lock_ttl.is_finite() || sessions.lock_ttl < MIN_LOCK_TTL_SECS {
            result.add_error(
                "sessions.lock_ttl",
                format!(
                    "lock_ttl must be at least {}s; a lock without expiry stays held forever if its holder dies",
                    MIN_LOCK_TTL_SECS
                ),
            );
        }

        if !sessions.lock_poll_time.is_finite() || sessions.lock_poll_time <= 0.0 {
            result.add_error("sessions.lock_poll_time", "lock_poll_time must be greater than 0");
        } else if sessions.lock_poll_time > sessions.lock_ttl {
            result.add_warning(
                "sessions.lock_poll_time",
                "lock_poll_time is longer than lock_ttl; contended locks may expire between polls",
            );
        }

        if !sessions.lock_max_wait_time.is_finite() || sessions.lock_max_wait_time < 0.0 {
            result.add_error("sessions.lock_max_wait_time", "lock_max_wait_time cannot be negative");
        } else if sessions.lock_max_wait_time == 0.0 {
            result.add_warning(
                "sessions.lock_max_wait_time",
                "lock_max_wait_time is 0, lock acquisition will wait forever",
            );
        }

        if let Some(ref version) = sessions.version {
            if version.trim().is_empty() {
                result.add_warning(
                    "sessions.version",
                    "version seed is blank; every process will share the same epoch",
                );
            }
        } else if sessions.reset_on_reload == ResetMode::Keep {
            result.add_warning(
                "sessions.version",
                "no version seed: each process starts with its own random epoch",
            );
        }

        result
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("forkstate"))
            .unwrap_or_else(|| PathBuf::from("~/.config/forkstate"))
    }
}
