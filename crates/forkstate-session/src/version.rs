//! Session epochs.
//!
//! Every `sess` write embeds the current [`Epoch`]. A fetch that finds another
//! epoch treats the session as expired, so replacing the epoch invalidates
//! the whole session population without touching a single key.

use std::fmt;

use forkstate_core::ResetMode;
use parking_lot::RwLock;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::KvError;
use crate::kv::KvConnection;

/// Number of hex characters kept from a generated epoch.
pub const EPOCH_WIDTH: usize = 12;

/// Token identifying one generation of sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Epoch(String);

impl Epoch {
    pub fn new(epoch: impl Into<String>) -> Self {
        Epoch(epoch.into())
    }

    /// Epoch derived from a seed; equal seeds give equal epochs.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut hex = format!("{:x}", digest);
        hex.truncate(EPOCH_WIDTH);
        Epoch(hex)
    }

    /// Fresh random epoch.
    pub fn random() -> Self {
        let value: u64 = rand::thread_rng().gen();
        let mut hex = format!("{:016x}", value);
        hex.truncate(EPOCH_WIDTH);
        Epoch(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a reload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The epoch was left alone.
    Kept { epoch: Epoch },
    /// A new epoch replaced the previous one.
    Invalidated { previous: Epoch, current: Epoch },
    /// A new epoch was generated and every key was erased.
    Flushed { previous: Epoch, current: Epoch },
}

impl ReloadOutcome {
    /// The epoch in force after the reload.
    pub fn epoch(&self) -> &Epoch {
        match self {
            ReloadOutcome::Kept { epoch } => epoch,
            ReloadOutcome::Invalidated { current, .. } => current,
            ReloadOutcome::Flushed { current, .. } => current,
        }
    }
}

/// Owner of the current epoch.
///
/// With a seed, epochs are deterministic so several processes agree on the
/// same value without talking to each other. Without one, each generation is
/// random.
#[derive(Debug)]
pub struct VersionManager {
    seed: RwLock<Option<String>>,
    current: RwLock<Epoch>,
}

impl VersionManager {
    pub fn new(seed: Option<String>) -> Self {
        let epoch = Self::generate_from(seed.as_deref());
        Self {
            seed: RwLock::new(seed),
            current: RwLock::new(epoch),
        }
    }

    fn generate_from(seed: Option<&str>) -> Epoch {
        match seed {
            Some(seed) => Epoch::from_seed(seed),
            None => Epoch::random(),
        }
    }

    /// Epoch new writes are stamped with.
    pub fn current_epoch(&self) -> Epoch {
        self.current.read().clone()
    }

    /// Replace the seed used by subsequent reloads.
    pub fn set_seed(&self, seed: Option<String>) {
        *self.seed.write() = seed;
    }

    pub fn seed(&self) -> Option<String> {
        self.seed.read().clone()
    }

    /// Generate the next epoch without installing it.
    pub fn generate(&self) -> Epoch {
        Self::generate_from(self.seed.read().as_deref())
    }

    /// Apply a reset mode.
    ///
    /// `Invalidate` reports [`ReloadOutcome::Kept`] when the seed yields the
    /// epoch already in force. `Flush` erases the database before installing
    /// the new epoch; if the flush fails the epoch is left untouched.
    pub async fn reload(
        &self,
        mode: ResetMode,
        conn: &mut dyn KvConnection,
    ) -> Result<ReloadOutcome, KvError> {
        match mode {
            ResetMode::Keep => Ok(ReloadOutcome::Kept {
                epoch: self.current_epoch(),
            }),
            ResetMode::Invalidate => {
                let (previous, current) = self.rotate();
                if previous == current {
                    warn!(
                        epoch = %current,
                        "Version seed unchanged; existing sessions stay valid until the seed changes"
                    );
                    return Ok(ReloadOutcome::Kept { epoch: current });
                }
                info!(previous = %previous, current = %current, "Session epoch rotated");
                Ok(ReloadOutcome::Invalidated { previous, current })
            }
            ResetMode::Flush => {
                conn.flush_db().await?;
                let (previous, current) = self.rotate();
                info!(previous = %previous, current = %current, "Session store flushed");
                Ok(ReloadOutcome::Flushed { previous, current })
            }
        }
    }

    fn rotate(&self) -> (Epoch, Epoch) {
        let next = self.generate();
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        (previous, next)
    }
}
