//! Session store error types.

use std::time::Duration;

use forkstate_core::SessionId;
use thiserror::Error;

/// Errors reported by a key-value backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// The server could not be reached or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected a command.
    #[error("command error: {0}")]
    Command(String),

    /// A command hit a key holding another kind of value.
    #[error("wrong value type for key {key}")]
    WrongType { key: String },
}

impl KvError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a command error.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// Why a fetch treated a session as expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirationReason {
    /// A required hash field was absent.
    MissingField(String),
    /// The record was written under another epoch.
    EpochMismatch { stored: String, current: String },
}

impl std::fmt::Display for ExpirationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpirationReason::MissingField(field) => write!(f, "field '{}' is missing", field),
            ExpirationReason::EpochMismatch { stored, current } => {
                write!(f, "epoch {} does not match current epoch {}", stored, current)
            }
        }
    }
}

/// Errors that can occur during session store operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session or the requested state is gone or belongs to an older epoch.
    #[error("session {session_id} expired: {reason}")]
    Expired {
        session_id: SessionId,
        reason: ExpirationReason,
    },

    /// The session lock could not be acquired in time.
    #[error("could not acquire lock {name} within {waited:?}")]
    LockTimeout { name: String, waited: Duration },

    /// A fork was written but the counter left the range of state ids.
    ///
    /// The state data is stored; the session cannot fork any further.
    #[error("session {session_id}: state written, but counter {counter} exceeds the state id range")]
    StateCounterOverflow { session_id: SessionId, counter: i64 },

    /// A stored record does not have the expected shape.
    #[error("malformed record {key}: {detail}")]
    MalformedRecord { key: String, detail: String },

    /// Key-value backend error.
    #[error("key-value error: {0}")]
    Kv(#[from] KvError),

    /// Application data could not be (de)serialized.
    #[error("{0}")]
    Serialization(#[from] forkstate_core::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Create an expiration error for a missing field.
    pub fn missing_field(session_id: SessionId, field: impl Into<String>) -> Self {
        Self::Expired {
            session_id,
            reason: ExpirationReason::MissingField(field.into()),
        }
    }

    /// Create a malformed record error.
    pub fn malformed(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedRecord {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, SessionError::Expired { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SessionError::LockTimeout { .. })
    }

    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SessionError::Expired { .. } => Some("Start a new session"),
            SessionError::LockTimeout { .. } => {
                Some("Another request holds this session; retry or fail the request")
            }
            SessionError::MalformedRecord { .. } => {
                Some("The record is corrupted; delete the session")
            }
            SessionError::StateCounterOverflow { .. } => {
                Some("The session has used up its state ids; start a new session")
            }
            SessionError::Kv(KvError::Connection(_)) => {
                Some("Check that the key-value server is reachable")
            }
            _ => None,
        }
    }
}

impl From<SessionError> for forkstate_core::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Serialization(inner) => inner,
            other => forkstate_core::Error::Session(other.to_string()),
        }
    }
}
