//! In-process key-value backend.
//!
//! Emulates the subset of the server the store relies on: hashes, strings
//! used as locks, atomic batches, and lazy key expiry. All connections of one
//! [`MemoryKv`] share the same keyspace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Batch, BatchOp, BatchReply, KvBackend, KvConnection, ServerInfo};
use crate::error::KvError;

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, Vec<u8>>),
    Str(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    client_names: Vec<String>,
}

impl Keyspace {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash_mut(&mut self, key: &str, now: Instant) -> Result<&mut HashMap<String, Vec<u8>>, KvError> {
        if self.live(key, now).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields),
            _ => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    /// Check a batch against the current keyspace without changing it.
    fn validate(&mut self, ops: &[BatchOp], now: Instant) -> Result<(), KvError> {
        let mut deleted: HashSet<&str> = HashSet::new();
        for op in ops {
            let (key, incr_field) = match op {
                BatchOp::HashSet { key, .. } => (key, None),
                BatchOp::HashIncr { key, field, .. } => (key, Some(field)),
                BatchOp::Delete { key } => {
                    deleted.insert(key.as_str());
                    continue;
                }
                BatchOp::Expire { ttl, .. } => {
                    deadline(now, *ttl)?;
                    continue;
                }
            };
            if deleted.contains(key.as_str()) {
                continue;
            }
            match self.live(key, now).map(|entry| &entry.value) {
                Some(Value::Str(_)) => {
                    return Err(KvError::WrongType { key: key.clone() });
                }
                Some(Value::Hash(fields)) => {
                    let current = incr_field.and_then(|field| fields.get(field));
                    if let Some(raw) = current {
                        parse_integer(raw)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: BatchOp, now: Instant) -> Result<BatchReply, KvError> {
        match op {
            BatchOp::HashSet { key, fields } => {
                let hash = self.hash_mut(&key, now)?;
                hash.extend(fields);
                Ok(BatchReply::Ok)
            }
            BatchOp::HashIncr { key, field, delta } => {
                let hash = self.hash_mut(&key, now)?;
                let current = match hash.get(&field) {
                    Some(raw) => parse_integer(raw)?,
                    None => 0,
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| KvError::command("increment or decrement would overflow"))?;
                hash.insert(field, next.to_string().into_bytes());
                Ok(BatchReply::Integer(next))
            }
            BatchOp::Expire { key, ttl } => {
                let applied = match self.live(&key, now) {
                    Some(entry) => {
                        entry.expires_at = Some(deadline(now, ttl)?);
                        1
                    }
                    None => 0,
                };
                Ok(BatchReply::Integer(applied))
            }
            BatchOp::Delete { key } => {
                let removed = self.live(&key, now).is_some();
                self.entries.remove(&key);
                Ok(BatchReply::Integer(removed as i64))
            }
        }
    }
}

/// `now + ttl`, or an error when the instant is out of range.
fn deadline(now: Instant, ttl: Duration) -> Result<Instant, KvError> {
    now.checked_add(ttl)
        .ok_or_else(|| KvError::command(format!("expire time {:?} out of range", ttl)))
}

fn parse_integer(raw: &[u8]) -> Result<i64, KvError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KvError::command("hash value is not an integer"))
}

/// Key-value backend living in the current process.
#[derive(Debug, Clone)]
pub struct MemoryKv {
    keyspace: Arc<Mutex<Keyspace>>,
    info: ServerInfo,
}

impl MemoryKv {
    /// Create an empty keyspace.
    ///
    /// It reports itself as an unbounded, non-evicting server, which is what
    /// it is.
    pub fn new() -> Self {
        Self::with_server_info(ServerInfo {
            maxmemory: 0,
            maxmemory_policy: "noeviction".to_string(),
        })
    }

    /// Create an empty keyspace reporting the given memory settings.
    pub fn with_server_info(info: ServerInfo) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            info,
        }
    }

    /// Snapshot of a live hash record.
    pub fn hash(&self, key: &str) -> Option<HashMap<String, Vec<u8>>> {
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key, Instant::now()).map(|entry| &entry.value) {
            Some(Value::Hash(fields)) => Some(fields.clone()),
            _ => None,
        }
    }

    /// Whether `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        self.keyspace.lock().live(key, Instant::now()).is_some()
    }

    /// Remaining time to live of `key`, `None` when missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace
            .live(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace.entries.retain(|_, entry| entry.is_live(now));
        keyspace.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Client names announced so far, oldest first.
    pub fn client_names(&self) -> Vec<String> {
        self.keyspace.lock().client_names.clone()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn connection(&self) -> Result<Box<dyn KvConnection>, KvError> {
        Ok(Box::new(MemoryConnection {
            keyspace: Arc::clone(&self.keyspace),
            info: self.info.clone(),
        }))
    }

    fn describe(&self) -> String {
        "in-memory keyspace".to_string()
    }
}

/// Connection handle onto a [`MemoryKv`] keyspace.
pub struct MemoryConnection {
    keyspace: Arc<Mutex<Keyspace>>,
    info: ServerInfo,
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn hget_multi(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, KvError> {
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key, Instant::now()).map(|entry| &entry.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(Value::Str(_)) => Err(KvError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn execute(&mut self, batch: Batch) -> Result<Vec<BatchReply>, KvError> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace.validate(batch.ops(), now)?;
        batch
            .into_ops()
            .into_iter()
            .map(|op| keyspace.apply(op, now))
            .collect()
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.keyspace.lock().entries.remove(key);
        Ok(())
    }

    async fn flush_db(&mut self) -> Result<(), KvError> {
        self.keyspace.lock().entries.clear();
        Ok(())
    }

    async fn server_info(&mut self) -> Result<ServerInfo, KvError> {
        Ok(self.info.clone())
    }

    async fn set_client_name(&mut self, name: &str) -> Result<(), KvError> {
        self.keyspace.lock().client_names.push(name.to_string());
        Ok(())
    }

    async fn try_lock(&mut self, name: &str, token: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| deadline(now, ttl)).transpose()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(name, now).is_some() {
            return Ok(false);
        }
        keyspace.entries.insert(
            name.to_string(),
            Entry {
                value: Value::Str(token.as_bytes().to_vec()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn unlock(&mut self, name: &str, token: &str) -> Result<bool, KvError> {
        let mut keyspace = self.keyspace.lock();
        let owned = matches!(
            keyspace.live(name, Instant::now()).map(|entry| &entry.value),
            Some(Value::Str(holder)) if holder.as_slice() == token.as_bytes()
        );
        if owned {
            keyspace.entries.remove(name);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &[u8])]) -> Vec<(String, Vec<u8>)> {
        pairs.iter().map(|(f, v)| (f.to_string(), v.to_vec())).collect()
    }

    #[tokio::test]
    async fn test_hash_set_and_get() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();

        conn.execute(Batch::new().hset("h", fields(&[("a", b"1"), ("b", b"two")])))
            .await
            .unwrap();

        let values = conn.hget_multi("h", &["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), Some(b"two".to_vec()), None]);

        let missing = conn.hget_multi("nope", &["a", "b"]).await.unwrap();
        assert_eq!(missing, vec![None, None]);
    }

    #[tokio::test]
    async fn test_increment_replies_in_order() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();

        let replies = conn
            .execute(
                Batch::new()
                    .hincr("h", "n", 1)
                    .hincr("h", "n", 5)
                    .hset("h", fields(&[("x", b"y")]))
                    .expire("h", Some(Duration::from_secs(60))),
            )
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![
                BatchReply::Integer(1),
                BatchReply::Integer(6),
                BatchReply::Ok,
                BatchReply::Integer(1)
            ]
        );
        assert!(kv.ttl("h").unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_failed_batch_changes_nothing() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();
        conn.execute(Batch::new().hset("h", fields(&[("n", b"not a number")])))
            .await
            .unwrap();

        let err = conn
            .execute(
                Batch::new()
                    .hset("h", fields(&[("other", b"1")]))
                    .hincr("h", "n", 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Command(_)));
        assert!(!kv.hash("h").unwrap().contains_key("other"));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();
        assert!(conn.try_lock("l", "me", None).await.unwrap());

        let err = conn.hget_multi("l", &["a"]).await.unwrap_err();
        assert!(matches!(err, KvError::WrongType { .. }));
    }

    #[tokio::test]
    async fn test_expiry() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();
        conn.execute(
            Batch::new()
                .hset("h", fields(&[("a", b"1")]))
                .expire("h", Some(Duration::from_millis(30))),
        )
        .await
        .unwrap();
        assert!(kv.contains_key("h"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!kv.contains_key("h"));
        assert_eq!(conn.hget_multi("h", &["a"]).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_is_rejected() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();

        let err = conn
            .execute(
                Batch::new()
                    .hset("h", fields(&[("a", b"1")]))
                    .expire("h", Some(Duration::MAX)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Command(_)));
        assert!(!kv.contains_key("h"));

        let err = conn.try_lock("l", "me", Some(Duration::MAX)).await.unwrap_err();
        assert!(matches!(err, KvError::Command(_)));
        assert!(!kv.contains_key("l"));
    }

    #[tokio::test]
    async fn test_lock_ownership() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();

        assert!(conn.try_lock("l", "owner", None).await.unwrap());
        assert!(!conn.try_lock("l", "intruder", None).await.unwrap());
        assert!(!conn.unlock("l", "intruder").await.unwrap());
        assert!(conn.unlock("l", "owner").await.unwrap());
        assert!(!conn.unlock("l", "owner").await.unwrap());
        assert!(conn.try_lock("l", "intruder", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_and_delete() {
        let kv = MemoryKv::new();
        let mut conn = kv.connection().await.unwrap();
        conn.execute(
            Batch::new()
                .hset("a", fields(&[("f", b"1")]))
                .hset("b", fields(&[("f", b"1")])),
        )
        .await
        .unwrap();
        assert_eq!(kv.len(), 2);

        conn.delete("a").await.unwrap();
        conn.delete("a").await.unwrap();
        assert_eq!(kv.len(), 1);

        conn.flush_db().await.unwrap();
        assert!(kv.is_empty());
    }
}
