//! Key-value server adapter.
//!
//! The store talks to the key-value server through two small traits:
//! [`KvBackend`] hands out connections and [`KvConnection`] issues commands.
//! A connection is checked out for the duration of one store operation and
//! never shared between concurrent operations.
//!
//! Multi-field writes go through a [`Batch`], which backends must apply
//! atomically and in order.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::KvError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_kv;

pub use memory::MemoryKv;
#[cfg(feature = "redis")]
pub use redis_kv::RedisKv;

/// One command inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Set several hash fields at once.
    HashSet {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    /// Atomically add `delta` to an integer hash field.
    HashIncr {
        key: String,
        field: String,
        delta: i64,
    },
    /// Set a key's time to live.
    Expire { key: String, ttl: Duration },
    /// Remove a key.
    Delete { key: String },
}

/// Reply to one [`BatchOp`], in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReply {
    Ok,
    Integer(i64),
}

impl BatchReply {
    pub fn as_integer(self) -> Option<i64> {
        match self {
            BatchReply::Integer(value) => Some(value),
            BatchReply::Ok => None,
        }
    }
}

/// Ordered list of commands applied as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, fields: Vec<(String, Vec<u8>)>) -> Self {
        self.ops.push(BatchOp::HashSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hincr(mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        self.ops.push(BatchOp::HashIncr {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    /// Append an expiry, or nothing when `ttl` is `None`.
    pub fn expire(mut self, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        if let Some(ttl) = ttl {
            self.ops.push(BatchOp::Expire {
                key: key.into(),
                ttl,
            });
        }
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Memory settings reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Memory limit in bytes, 0 when unlimited
    pub maxmemory: u64,
    /// Eviction policy, e.g. `allkeys-lru` or `noeviction`
    pub maxmemory_policy: String,
}

impl ServerInfo {
    /// Parse the `key:value` lines of an `INFO` reply.
    ///
    /// Missing entries default to an unbounded, non-evicting server.
    pub fn parse(info: &str) -> Self {
        let fields: HashMap<&str, &str> = info
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.trim().split_once(':'))
            .collect();

        Self {
            maxmemory: fields
                .get("maxmemory")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            maxmemory_policy: fields
                .get("maxmemory_policy")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| "noeviction".to_string()),
        }
    }

    /// True when the server has a memory limit and evicts keys to honour it.
    pub fn is_bounded_cache(&self) -> bool {
        self.maxmemory > 0 && self.maxmemory_policy != "noeviction"
    }
}

/// A checked-out connection to the key-value server.
#[async_trait]
pub trait KvConnection: Send {
    /// Read several fields of one hash; absent key or field yields `None`.
    async fn hget_multi(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, KvError>;

    /// Apply a batch atomically, returning one reply per command.
    async fn execute(&mut self, batch: Batch) -> Result<Vec<BatchReply>, KvError>;

    /// Remove a key. Removing a missing key succeeds.
    async fn delete(&mut self, key: &str) -> Result<(), KvError>;

    /// Remove every key of the selected database.
    async fn flush_db(&mut self) -> Result<(), KvError>;

    /// Report memory limit and eviction policy.
    async fn server_info(&mut self) -> Result<ServerInfo, KvError>;

    /// Announce a client name to the server.
    async fn set_client_name(&mut self, name: &str) -> Result<(), KvError>;

    /// Take the lock `name` for `token` if nobody holds it.
    async fn try_lock(&mut self, name: &str, token: &str, ttl: Option<Duration>) -> Result<bool, KvError>;

    /// Drop the lock `name` if `token` still holds it.
    async fn unlock(&mut self, name: &str, token: &str) -> Result<bool, KvError>;
}

/// Source of key-value connections.
///
/// Single-node and clustered deployments are both expressed as backends; the
/// store is agnostic of which one it runs on.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Check out a connection for one operation.
    async fn connection(&self) -> Result<Box<dyn KvConnection>, KvError>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let info = "# Memory\r\nused_memory:1024\r\nmaxmemory:104857600\r\nmaxmemory_policy:allkeys-lru\r\n";
        let parsed = ServerInfo::parse(info);
        assert_eq!(parsed.maxmemory, 104_857_600);
        assert_eq!(parsed.maxmemory_policy, "allkeys-lru");
        assert!(parsed.is_bounded_cache());
    }

    #[test]
    fn test_parse_info_defaults() {
        let parsed = ServerInfo::parse("# Memory\r\nused_memory:1024\r\n");
        assert_eq!(parsed.maxmemory, 0);
        assert_eq!(parsed.maxmemory_policy, "noeviction");
        assert!(!parsed.is_bounded_cache());
    }

    #[test]
    fn test_noeviction_is_not_bounded() {
        let info = ServerInfo {
            maxmemory: 1 << 20,
            maxmemory_policy: "noeviction".to_string(),
        };
        assert!(!info.is_bounded_cache());
    }

    #[test]
    fn test_batch_skips_missing_ttl() {
        let batch = Batch::new()
            .hincr("k", "state", 1)
            .hset("k", vec![("sess".to_string(), b"x".to_vec())])
            .expire("k", None);
        assert_eq!(batch.len(), 2);

        let batch = batch.expire("k", Some(Duration::from_secs(5)));
        assert!(matches!(batch.ops()[2], BatchOp::Expire { .. }));
    }
}
