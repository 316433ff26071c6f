//! # forkstate-session
//!
//! Versioned, lock-guarded session storage on top of a key-value server.
//!
//! This crate provides:
//! - A small key-value adapter with an in-memory backend and, behind the
//!   `redis` feature, a Redis backend
//! - Per-session distributed advisory locks with TTL and bounded waiting
//! - Session epochs that invalidate every session at once
//! - The session store: create, fetch, store and delete sessions and their
//!   state snapshots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use forkstate_core::Config;
//! use forkstate_session::{MemoryKv, SessionStore};
//!
//! let config = Config::load_validated(None)?;
//! let store = SessionStore::from_config(&config, Arc::new(MemoryKv::new()));
//! store.handle_start().await?;
//!
//! // New session: the lock comes back held
//! let mut created = store.create_new().await?;
//! let next = created.state_id.next().ok_or("state ids exhausted")?;
//! store
//!     .store(created.session_id, next, &created.secure_token, false, Some(b"cart".as_slice()), b"page 1")
//!     .await?;
//! created.lock.release().await?;
//!
//! // Later request: lock, fetch, mutate, store, release
//! let mut lock = store.get_lock(created.session_id);
//! lock.acquire().await?;
//! let state = store.fetch(created.session_id, next).await?;
//! // ...
//! lock.release().await?;
//! ```
//!
//! ## State Snapshots
//!
//! Every store either overwrites the current snapshot (`use_same_state`) or
//! forks a new one. Forked snapshots never overwrite older ones, so a user
//! going back in the browser can resume any earlier state.

pub mod error;
pub mod kv;
pub mod lock;
pub mod record;
pub mod store;
pub mod version;

// Re-export commonly used types
pub use error::{ExpirationReason, KvError, Result, SessionError};
pub use kv::{Batch, BatchOp, BatchReply, KvBackend, KvConnection, MemoryKv, ServerInfo};
#[cfg(feature = "redis")]
pub use kv::RedisKv;
pub use lock::{LockOptions, SessionLock};
pub use record::SessEnvelope;
pub use store::{
    CreatedSession, DecodedState, FetchedState, SessionStore, StartupReport, StoreOptions,
};
pub use version::{Epoch, ReloadOutcome, VersionManager};
