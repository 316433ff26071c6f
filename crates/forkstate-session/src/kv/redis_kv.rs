//! Redis backend (feature `redis`).
//!
//! Batches run as `MULTI`/`EXEC` pipelines. Locks are plain keys set with
//! `SET NX PX` and removed by a compare-and-delete script.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Value};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Batch, BatchOp, BatchReply, KvBackend, KvConnection, ServerInfo};
use crate::error::KvError;
use forkstate_core::config::ServerConfig;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl From<RedisError> for KvError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            KvError::Connection(err.to_string())
        } else {
            KvError::Command(err.to_string())
        }
    }
}

/// Single-node Redis server.
///
/// Connections are multiplexed: every checkout clones a handle onto one
/// pipelined socket, opened on first use.
pub struct RedisKv {
    client: Client,
    url: String,
    shared: OnceCell<MultiplexedConnection>,
}

impl RedisKv {
    /// Prepare a backend for `url`; nothing is connected yet.
    pub fn open(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
            shared: OnceCell::new(),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, KvError> {
        Self::open(&config.redis_url())
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn connection(&self) -> Result<Box<dyn KvConnection>, KvError> {
        let conn = self
            .shared
            .get_or_try_init(|| async {
                debug!(url = %self.url, "Opening Redis connection");
                self.client.get_multiplexed_async_connection().await
            })
            .await?;
        Ok(Box::new(RedisConnection { conn: conn.clone() }))
    }

    fn describe(&self) -> String {
        format!("redis at {}", self.url)
    }
}

/// Checked-out handle onto the shared multiplexed connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn hget_multi(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, KvError> {
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn)
            .await?;
        Ok(values)
    }

    async fn execute(&mut self, batch: Batch) -> Result<Vec<BatchReply>, KvError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut increments = Vec::with_capacity(batch.len());

        for op in batch.ops() {
            match op {
                BatchOp::HashSet { key, fields } => {
                    pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        pipe.arg(field).arg(value.as_slice());
                    }
                    increments.push(false);
                }
                BatchOp::HashIncr { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
                    increments.push(true);
                }
                BatchOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
                    increments.push(false);
                }
                BatchOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                    increments.push(false);
                }
            }
        }

        let replies: Vec<Value> = pipe.query_async(&mut self.conn).await?;
        if replies.len() != increments.len() {
            return Err(KvError::command(format!(
                "expected {} replies, got {}",
                increments.len(),
                replies.len()
            )));
        }

        replies
            .into_iter()
            .zip(increments)
            .map(|(reply, is_incr)| match (reply, is_incr) {
                (Value::Int(value), _) => Ok(BatchReply::Integer(value)),
                (_, true) => Err(KvError::command("HINCRBY did not return an integer")),
                (_, false) => Ok(BatchReply::Ok),
            })
            .collect()
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn flush_db(&mut self) -> Result<(), KvError> {
        let _: () = redis::cmd("FLUSHDB").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn server_info(&mut self) -> Result<ServerInfo, KvError> {
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut self.conn)
            .await?;
        Ok(ServerInfo::parse(&info))
    }

    async fn set_client_name(&mut self, name: &str) -> Result<(), KvError> {
        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(name)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn try_lock(&mut self, name: &str, token: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(name).arg(token).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut self.conn).await?;
        Ok(reply.is_some())
    }

    async fn unlock(&mut self, name: &str, token: &str) -> Result<bool, KvError> {
        let removed: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(name)
            .arg(token)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Whole milliseconds, at least 1 so a short TTL never means "no expiry".
/// Saturates at `u64::MAX`; the server rejects values it cannot represent.
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_does_not_connect() {
        let kv = RedisKv::open("redis://127.0.0.1:1/0").unwrap();
        assert_eq!(kv.describe(), "redis at redis://127.0.0.1:1/0");
    }

    #[test]
    fn test_invalid_url() {
        assert!(RedisKv::open("not a url").is_err());
    }

    #[test]
    fn test_millis_rounds_up_to_one() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
