//! Session identifiers, record key layout and reset modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Hash field holding the latest state id of a session.
pub const STATE_FIELD: &str = "state";

/// Hash field holding the framed epoch, secure token and session data.
pub const SESS_FIELD: &str = "sess";

/// Numeric identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        SessionId(id)
    }
}

/// Identifier of one state snapshot inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub u32);

impl StateId {
    /// The snapshot every session starts with.
    pub const INITIAL: StateId = StateId(0);

    /// Hash field name of this snapshot (`"00042"`).
    pub fn field(self) -> String {
        format!("{:05}", self.0)
    }

    /// The id a fork of this snapshot receives, `None` past `u32::MAX`.
    pub fn next(self) -> Option<StateId> {
        self.0.checked_add(1).map(StateId)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StateId {
    fn from(id: u32) -> Self {
        StateId(id)
    }
}

/// Random value bound to a session at creation.
///
/// The store only transports it; comparing it against the caller's copy is
/// the caller's job.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecureToken(String);

impl SecureToken {
    pub fn new(token: impl Into<String>) -> Self {
        SecureToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

// Tokens are credentials; keep them out of debug logs.
impl fmt::Debug for SecureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureToken(<{} chars>)", self.0.len())
    }
}

impl From<&str> for SecureToken {
    fn from(token: &str) -> Self {
        SecureToken(token.to_string())
    }
}

impl From<String> for SecureToken {
    fn from(token: String) -> Self {
        SecureToken(token)
    }
}

/// Naming of the keys a session occupies on the key-value server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key of the session hash record: `"<namespace>_<id>_"`.
    pub fn record_key(&self, session_id: SessionId) -> String {
        format!("{}_{}_", self.namespace, session_id)
    }

    /// Key of the session's advisory lock: `"<namespace>_<id>_lock"`.
    pub fn lock_key(&self, session_id: SessionId) -> String {
        format!("{}lock", self.record_key(session_id))
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("forkstate")
    }
}

/// What a reload does to the existing session population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Keep the current epoch; existing sessions stay valid
    #[serde(alias = "off")]
    Keep,
    /// Generate a new epoch; every existing session becomes expired
    #[serde(alias = "on")]
    Invalidate,
    /// Generate a new epoch and erase every stored session
    Flush,
}

impl ResetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetMode::Keep => "keep",
            ResetMode::Invalidate => "invalidate",
            ResetMode::Flush => "flush",
        }
    }
}

impl Default for ResetMode {
    fn default() -> Self {
        ResetMode::Invalidate
    }
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" | "off" => Ok(ResetMode::Keep),
            "invalidate" | "on" => Ok(ResetMode::Invalidate),
            "flush" => Ok(ResetMode::Flush),
            other => Err(Error::Config(format!(
                "Invalid reset mode '{}'. Valid values: keep/off, invalidate/on, flush",
                other
            ))),
        }
    }
}
