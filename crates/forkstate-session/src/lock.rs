//! Distributed advisory lock guarding one session.
//!
//! A lock is a key on the key-value server holding the owner's random token.
//! Acquisition polls until the key can be created or the wait budget runs
//! out; release deletes the key only if the token still matches, so a holder
//! whose lock expired cannot release somebody else's.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::kv::KvBackend;

/// Timing parameters of a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Auto-expiry of a held lock; `None` never expires
    pub ttl: Option<Duration>,
    /// Delay between two acquisition attempts
    pub poll_interval: Duration,
    /// Total time budget for `acquire`; `None` waits forever
    pub max_wait: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(5)),
            poll_interval: Duration::from_millis(100),
            max_wait: Some(Duration::from_secs(5)),
        }
    }
}

impl LockOptions {
    pub fn from_config(config: &forkstate_core::config::SessionsConfig) -> Self {
        Self {
            ttl: Some(config.lock_ttl()),
            poll_interval: config.lock_poll_time(),
            max_wait: config.lock_max_wait_time(),
        }
    }
}

/// Handle on the advisory lock of one session.
pub struct SessionLock {
    backend: Arc<dyn KvBackend>,
    name: String,
    token: String,
    options: LockOptions,
    held: bool,
}

impl SessionLock {
    pub fn new(backend: Arc<dyn KvBackend>, name: impl Into<String>, options: LockOptions) -> Self {
        Self {
            backend,
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            options,
            held: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Whether this handle believes it holds the lock.
    ///
    /// The lock may have expired server-side since it was taken.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Make a single acquisition attempt.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        let mut conn = self.backend.connection().await?;
        self.held = conn.try_lock(&self.name, &self.token, self.options.ttl).await?;
        Ok(self.held)
    }

    /// Acquire the lock, polling until `max_wait` is spent.
    pub async fn acquire(&mut self) -> Result<()> {
        if self.held {
            return Ok(());
        }

        let started = Instant::now();
        let mut conn = self.backend.connection().await?;

        loop {
            if conn.try_lock(&self.name, &self.token, self.options.ttl).await? {
                self.held = true;
                debug!(lock = %self.name, waited = ?started.elapsed(), "Lock acquired");
                return Ok(());
            }

            let mut pause = self.options.poll_interval;
            if let Some(max_wait) = self.options.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    debug!(lock = %self.name, waited = ?waited, "Lock acquisition timed out");
                    return Err(SessionError::LockTimeout {
                        name: self.name.clone(),
                        waited,
                    });
                }
                pause = pause.min(max_wait - waited);
            }

            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
        }
    }

    /// Release the lock. Releasing a lock that is not held is a no-op.
    pub async fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        let mut conn = self.backend.connection().await?;
        if !conn.unlock(&self.name, &self.token).await? {
            warn!(lock = %self.name, "Lock expired before it was released");
        } else {
            debug!(lock = %self.name, "Lock released");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("held", &self.held)
            .finish()
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.held {
            warn!(
                lock = %self.name,
                ttl = ?self.options.ttl,
                "Session lock dropped while held; it stays taken until its TTL lapses"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn fast_options(max_wait: Option<Duration>) -> LockOptions {
        LockOptions {
            ttl: Some(Duration::from_secs(10)),
            poll_interval: Duration::from_millis(5),
            max_wait,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let mut lock = SessionLock::new(backend.clone(), "ns_1_lock", fast_options(None));

        lock.acquire().await.unwrap();
        assert!(lock.is_held());

        lock.release().await.unwrap();
        assert!(!lock.is_held());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let mut first = SessionLock::new(backend.clone(), "ns_1_lock", fast_options(None));
        let mut second = SessionLock::new(
            backend.clone(),
            "ns_1_lock",
            fast_options(Some(Duration::from_millis(50))),
        );

        first.acquire().await.unwrap();
        assert!(!second.try_acquire().await.unwrap());

        let started = Instant::now();
        let err = second.acquire().await.unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));

        first.release().await.unwrap();
        second.acquire().await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let mut holder = SessionLock::new(backend.clone(), "ns_2_lock", fast_options(None));
        holder.acquire().await.unwrap();

        let waiter_backend = backend.clone();
        let waiter = tokio::spawn(async move {
            let mut lock = SessionLock::new(
                waiter_backend,
                "ns_2_lock",
                fast_options(Some(Duration::from_secs(2))),
            );
            lock.acquire().await?;
            Ok::<_, SessionError>(lock)
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        holder.release().await.unwrap();

        let mut lock = waiter.await.unwrap().unwrap();
        assert!(lock.is_held());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_frees_crashed_holder() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let options = LockOptions {
            ttl: Some(Duration::from_millis(30)),
            poll_interval: Duration::from_millis(5),
            max_wait: Some(Duration::from_secs(1)),
        };

        let mut crashed = SessionLock::new(backend.clone(), "ns_3_lock", options.clone());
        crashed.acquire().await.unwrap();

        let mut next = SessionLock::new(backend.clone(), "ns_3_lock", options);
        next.acquire().await.unwrap();

        // The expired holder must not free the new holder's lock.
        crashed.release().await.unwrap();
        let mut probe = SessionLock::new(backend, "ns_3_lock", fast_options(None));
        assert!(!probe.try_acquire().await.unwrap());

        next.release().await.unwrap();
    }
}
