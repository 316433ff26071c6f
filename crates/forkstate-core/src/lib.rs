//! # forkstate-core
//!
//! Core types and collaborators for forkstate, a versioned session store
//! running on top of a key-value server.
//!
//! This crate provides:
//! - Session and state identifiers, record key layout and reset modes
//! - Configuration system
//! - Pluggable serialization of application data
//! - Session id and secure token generation
//! - Common error types

pub mod config;
pub mod error;
pub mod ids;
pub mod serializer;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use ids::{IdGenerator, RandomIdGenerator};
pub use serializer::{Serializer, SerializerKind};
pub use session::{KeyLayout, ResetMode, SecureToken, SessionId, StateId};
