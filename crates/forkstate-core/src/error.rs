//! Error types for forkstate.
//!
//! This module provides the top-level error type shared by the workspace.
//! Storage-specific failures live in `forkstate-session` and convert into
//! [`Error::Session`] at the crate boundary.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for forkstate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration loaded but failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A value could not be turned into bytes or back
    #[error("Serialization error ({serializer}): {message}")]
    Serialization {
        serializer: &'static str,
        message: String,
    },

    /// Session storage error
    #[error("Session error: {0}")]
    Session(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a serialization error for the named serializer.
    pub fn serialization(serializer: &'static str, message: impl ToString) -> Self {
        Error::Serialization {
            serializer,
            message: message.to_string(),
        }
    }

    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => {
                Some("Check your config file at ~/.config/forkstate/config.toml")
            }
            Error::Validation(_) => Some("Fix the reported fields and reload the configuration"),
            Error::Serialization { .. } => {
                Some("Make sure every process uses the same `serializer` setting")
            }
            Error::Session(_) => Some("Treat the session as gone and start a new one"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = Error::serialization("toml", "unsupported null");
        assert_eq!(
            err.to_string(),
            "Serialization error (toml): unsupported null"
        );
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_format_with_suggestion() {
        let err = Error::Config("missing file".to_string());
        let formatted = format_error_with_suggestion(&err);
        assert!(formatted.contains("missing file"));
        assert!(formatted.contains("Suggestion:"));
    }

    #[test]
    fn test_io_error_has_no_suggestion() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(err.recovery_suggestion().is_none());
    }
}
