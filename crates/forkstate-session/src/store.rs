//! Versioned session storage.
//!
//! A session is one hash record on the key-value server:
//!
//! | field     | content                                         |
//! |-----------|-------------------------------------------------|
//! | `state`   | id of the latest state snapshot                 |
//! | `sess`    | framed epoch, secure token and session data     |
//! | `"00000"` | data of state 0, and so on for every snapshot   |
//!
//! Callers hold the session lock across fetch, mutate and store. The store
//! makes each individual read or write atomic but does not serialize the
//! read-modify-write window itself.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use forkstate_core::config::Config;
use forkstate_core::ids::{IdGenerator, RandomIdGenerator};
use forkstate_core::serializer::{self, Serializer, SerializerKind};
use forkstate_core::session::{SESS_FIELD, STATE_FIELD};
use forkstate_core::{KeyLayout, ResetMode, SecureToken, SessionId, StateId};

use crate::error::{ExpirationReason, Result, SessionError};
use crate::kv::{Batch, KvBackend, KvConnection, ServerInfo};
use crate::lock::{LockOptions, SessionLock};
use crate::record::{self, SessEnvelope};
use crate::version::{Epoch, ReloadOutcome, VersionManager};

/// Behaviour of a [`SessionStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Key naming
    pub layout: KeyLayout,
    /// Expiry of session records, refreshed on every write
    pub ttl: Option<Duration>,
    /// Options of the per-session locks
    pub lock: LockOptions,
    /// Mode applied by `handle_start` and by `handle_reload(None)`
    pub reset_on_reload: ResetMode,
    /// Name announced to the server on startup
    pub client_name: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            layout: KeyLayout::default(),
            ttl: None,
            lock: LockOptions::default(),
            reset_on_reload: ResetMode::Invalidate,
            client_name: "forkstate-sessions".to_string(),
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            layout: config.sessions.key_layout(),
            ttl: config.sessions.ttl(),
            lock: LockOptions::from_config(&config.sessions),
            reset_on_reload: config.sessions.reset_on_reload,
            client_name: config.server.client_name.clone(),
        }
    }
}

/// A freshly created session, with its lock held.
#[derive(Debug)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub state_id: StateId,
    pub secure_token: SecureToken,
    /// Held lock; release it after the first store
    pub lock: SessionLock,
}

/// Raw content of one state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedState {
    /// Highest state id of the session
    pub latest_state_id: StateId,
    pub secure_token: SecureToken,
    pub session_data: Vec<u8>,
    pub state_data: Vec<u8>,
}

/// [`FetchedState`] run through the store's serializer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedState<S, T> {
    pub latest_state_id: StateId,
    pub secure_token: SecureToken,
    /// `None` until session data was stored
    pub session: Option<S>,
    /// `None` for a state without data, such as state 0
    pub state: Option<T>,
}

/// What `handle_start` found and did.
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub server: ServerInfo,
    pub reload: ReloadOutcome,
}

/// Session store on top of a key-value backend.
pub struct SessionStore {
    backend: Arc<dyn KvBackend>,
    options: StoreOptions,
    versions: VersionManager,
    serializer: Arc<dyn Serializer>,
    ids: Arc<dyn IdGenerator>,
}

impl SessionStore {
    /// Create a store using JSON serialization and random identifiers.
    pub fn new(backend: Arc<dyn KvBackend>, options: StoreOptions, versions: VersionManager) -> Self {
        Self {
            backend,
            options,
            versions,
            serializer: SerializerKind::Json.build(),
            ids: Arc::new(RandomIdGenerator::default()),
        }
    }

    /// Create a store from loaded configuration.
    pub fn from_config(config: &Config, backend: Arc<dyn KvBackend>) -> Self {
        let versions = VersionManager::new(config.sessions.version.clone());
        Self::new(backend, StoreOptions::from_config(config), versions)
            .with_serializer(config.sessions.serializer.build())
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn current_epoch(&self) -> Epoch {
        self.versions.current_epoch()
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    /// Lock handle for a session, not yet acquired.
    pub fn get_lock(&self, session_id: SessionId) -> SessionLock {
        SessionLock::new(
            Arc::clone(&self.backend),
            self.options.layout.lock_key(session_id),
            self.options.lock.clone(),
        )
    }

    /// Create a session and return it with its lock held.
    ///
    /// An existing record under the same id is replaced.
    pub async fn create(&self, session_id: SessionId, secure_token: SecureToken) -> Result<CreatedSession> {
        let key = self.options.layout.record_key(session_id);
        let sess = record::encode_parts(&self.current_epoch(), &secure_token, &[])
            .map_err(|detail| SessionError::malformed(&key, detail))?;

        let mut lock = self.get_lock(session_id);
        lock.acquire().await?;

        let batch = Batch::new()
            .delete(&key)
            .hset(
                &key,
                vec![
                    (STATE_FIELD.to_string(), b"0".to_vec()),
                    (SESS_FIELD.to_string(), sess),
                    (StateId::INITIAL.field(), Vec::new()),
                ],
            )
            .expire(&key, self.options.ttl);

        if let Err(err) = self.execute(batch).await {
            if let Err(release_err) = lock.release().await {
                warn!(session_id = %session_id, error = %release_err, "Failed to release lock after create failed");
            }
            return Err(err);
        }

        debug!(session_id = %session_id, "Session created");
        Ok(CreatedSession {
            session_id,
            state_id: StateId::INITIAL,
            secure_token,
            lock,
        })
    }

    /// Create a session under a fresh random id and secure token.
    pub async fn create_new(&self) -> Result<CreatedSession> {
        self.create(self.ids.session_id(), self.ids.secure_token()).await
    }

    /// Read one state of a session.
    ///
    /// Fails with [`SessionError::Expired`] when the record, the counter, the
    /// `sess` field or the requested state is missing, or when the record was
    /// written under another epoch.
    pub async fn fetch(&self, session_id: SessionId, state_id: StateId) -> Result<FetchedState> {
        let key = self.options.layout.record_key(session_id);
        let state_field = state_id.field();

        let mut conn = self.backend.connection().await?;
        let mut values = conn
            .hget_multi(&key, &[STATE_FIELD, SESS_FIELD, state_field.as_str()])
            .await?
            .into_iter();

        let latest = values
            .next()
            .flatten()
            .ok_or_else(|| SessionError::missing_field(session_id, STATE_FIELD))?;
        let sess = values
            .next()
            .flatten()
            .ok_or_else(|| SessionError::missing_field(session_id, SESS_FIELD))?;
        let state_data = values
            .next()
            .flatten()
            .ok_or_else(|| SessionError::missing_field(session_id, state_field.as_str()))?;

        let latest_state_id = parse_counter(&key, &latest)?;
        let envelope = SessEnvelope::decode(&sess).map_err(|detail| SessionError::malformed(&key, detail))?;

        let current = self.current_epoch();
        if envelope.epoch != current {
            debug!(session_id = %session_id, stored = %envelope.epoch, current = %current, "Session from another epoch");
            return Err(SessionError::Expired {
                session_id,
                reason: ExpirationReason::EpochMismatch {
                    stored: envelope.epoch.to_string(),
                    current: current.to_string(),
                },
            });
        }

        debug!(session_id = %session_id, state_id = %state_id, latest = %latest_state_id, "State fetched");
        Ok(FetchedState {
            latest_state_id,
            secure_token: envelope.secure_token,
            session_data: envelope.session_data,
            state_data,
        })
    }

    /// Write session data and one state; the caller must hold the session lock.
    ///
    /// With `use_same_state` the state field is overwritten in place. Otherwise
    /// the `state` counter is incremented in the same atomic batch, and the new
    /// counter is returned. A counter beyond `u32::MAX` is reported as
    /// [`SessionError::StateCounterOverflow`] after the write has been applied.
    pub async fn store(
        &self,
        session_id: SessionId,
        state_id: StateId,
        secure_token: &SecureToken,
        use_same_state: bool,
        session_data: Option<&[u8]>,
        state_data: &[u8],
    ) -> Result<Option<StateId>> {
        let key = self.options.layout.record_key(session_id);
        let sess = record::encode_parts(
            &self.current_epoch(),
            secure_token,
            session_data.unwrap_or_default(),
        )
        .map_err(|detail| SessionError::malformed(&key, detail))?;

        let mut batch = Batch::new();
        if !use_same_state {
            batch = batch.hincr(&key, STATE_FIELD, 1);
        }
        let batch = batch
            .hset(
                &key,
                vec![
                    (SESS_FIELD.to_string(), sess),
                    (state_id.field(), state_data.to_vec()),
                ],
            )
            .expire(&key, self.options.ttl);

        let replies = self.execute(batch).await?;

        if use_same_state {
            debug!(session_id = %session_id, state_id = %state_id, "State overwritten");
            return Ok(None);
        }

        let raw_counter = replies
            .first()
            .and_then(|reply| reply.as_integer())
            .ok_or_else(|| SessionError::malformed(&key, "state counter increment returned no integer"))?;
        let counter = u32::try_from(raw_counter)
            .map(StateId)
            .map_err(|_| SessionError::StateCounterOverflow {
                session_id,
                counter: raw_counter,
            })?;

        if counter != state_id {
            warn!(
                session_id = %session_id,
                written = %state_id,
                counter = %counter,
                "State counter disagrees with the stored state; was the session lock held?"
            );
        }

        debug!(session_id = %session_id, state_id = %state_id, "State forked");
        Ok(Some(counter))
    }

    /// Remove a session and all its states. Removing a missing session succeeds.
    pub async fn delete(&self, session_id: SessionId) -> Result<()> {
        let key = self.options.layout.record_key(session_id);
        let mut conn = self.backend.connection().await?;
        conn.delete(&key).await?;
        debug!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Fetch a state and deserialize its session and state data.
    pub async fn fetch_decoded<S, T>(&self, session_id: SessionId, state_id: StateId) -> Result<DecodedState<S, T>>
    where
        S: DeserializeOwned,
        T: DeserializeOwned,
    {
        let fetched = self.fetch(session_id, state_id).await?;
        Ok(DecodedState {
            latest_state_id: fetched.latest_state_id,
            secure_token: fetched.secure_token,
            session: serializer::decode(self.serializer(), &fetched.session_data)?,
            state: serializer::decode(self.serializer(), &fetched.state_data)?,
        })
    }

    /// Serialize session and state values and [`store`](Self::store) them.
    pub async fn store_encoded<S, T>(
        &self,
        session_id: SessionId,
        state_id: StateId,
        secure_token: &SecureToken,
        use_same_state: bool,
        session: &S,
        state: &T,
    ) -> Result<Option<StateId>>
    where
        S: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let session_data = serializer::encode(self.serializer(), session)?;
        let state_data = serializer::encode(self.serializer(), state)?;
        self.store(
            session_id,
            state_id,
            secure_token,
            use_same_state,
            Some(session_data.as_slice()),
            &state_data,
        )
        .await
    }

    /// Startup checks, then the configured reload.
    ///
    /// Sessions must be evictable under memory pressure, so a server without a
    /// memory limit or with `noeviction` is reported with a warning.
    pub async fn handle_start(&self) -> Result<StartupReport> {
        let mut conn = self.backend.connection().await?;
        conn.set_client_name(&self.options.client_name).await?;

        let server = conn.server_info().await?;
        if !server.is_bounded_cache() {
            warn!(
                backend = %self.backend.describe(),
                maxmemory = server.maxmemory,
                maxmemory_policy = %server.maxmemory_policy,
                "Key-value server not configured as a bounded cache (see `maxmemory` and `maxmemory_policy`)"
            );
        }

        let reload = self
            .reload_on(conn.as_mut(), self.options.reset_on_reload)
            .await?;
        info!(backend = %self.backend.describe(), epoch = %reload.epoch(), "Session store started");

        Ok(StartupReport { server, reload })
    }

    /// Apply a reset mode, or the configured one when `mode` is `None`.
    pub async fn handle_reload(&self, mode: Option<ResetMode>) -> Result<ReloadOutcome> {
        let mut conn = self.backend.connection().await?;
        self.reload_on(conn.as_mut(), mode.unwrap_or(self.options.reset_on_reload))
            .await
    }

    async fn reload_on(&self, conn: &mut dyn KvConnection, mode: ResetMode) -> Result<ReloadOutcome> {
        let outcome = self.versions.reload(mode, conn).await?;
        match &outcome {
            ReloadOutcome::Kept { epoch } => {
                info!(epoch = %epoch, "Session epoch kept");
            }
            ReloadOutcome::Invalidated { current, .. } => {
                info!(epoch = %current, "All existing sessions invalidated");
            }
            ReloadOutcome::Flushed { current, .. } => {
                info!(epoch = %current, "All sessions erased");
            }
        }
        Ok(outcome)
    }

    async fn execute(&self, batch: Batch) -> Result<Vec<crate::kv::BatchReply>> {
        let mut conn = self.backend.connection().await?;
        Ok(conn.execute(batch).await?)
    }
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<StateId> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(StateId)
        .ok_or_else(|| SessionError::malformed(key, "state counter is not a non-negative integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store_with(kv: &MemoryKv) -> SessionStore {
        let options = StoreOptions {
            layout: KeyLayout::new("test"),
            ..StoreOptions::default()
        };
        SessionStore::new(Arc::new(kv.clone()), options, VersionManager::new(None))
    }

    #[tokio::test]
    async fn test_create_writes_initial_record() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);

        let mut created = store.create(SessionId(42), "tok-A".into()).await.unwrap();
        assert!(created.lock.is_held());
        assert_eq!(created.state_id, StateId(0));

        let record = kv.hash("test_42_").unwrap();
        assert_eq!(record.get("state").unwrap(), b"0");
        assert_eq!(record.get("00000").unwrap(), b"");
        let sess = SessEnvelope::decode(record.get("sess").unwrap()).unwrap();
        assert_eq!(sess.epoch, store.current_epoch());
        assert_eq!(sess.secure_token.as_str(), "tok-A");
        assert!(sess.session_data.is_empty());
        assert!(kv.contains_key("test_42_lock"));

        created.lock.release().await.unwrap();
        assert!(!kv.contains_key("test_42_lock"));
    }

    #[tokio::test]
    async fn test_create_replaces_previous_states() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);
        let token = SecureToken::from("t");

        let mut created = store.create(SessionId(1), token.clone()).await.unwrap();
        store
            .store(SessionId(1), StateId(1), &token, false, None, b"s1")
            .await
            .unwrap();
        created.lock.release().await.unwrap();

        let mut again = store.create(SessionId(1), token).await.unwrap();
        again.lock.release().await.unwrap();
        assert!(!kv.hash("test_1_").unwrap().contains_key("00001"));
    }

    #[tokio::test]
    async fn test_create_fails_while_locked() {
        let kv = MemoryKv::new();
        let mut options = StoreOptions {
            layout: KeyLayout::new("test"),
            ..StoreOptions::default()
        };
        options.lock.max_wait = Some(Duration::from_millis(20));
        options.lock.poll_interval = Duration::from_millis(5);
        let store = SessionStore::new(Arc::new(kv.clone()), options, VersionManager::new(None));

        let mut holder = store.get_lock(SessionId(9));
        holder.acquire().await.unwrap();

        let err = store.create(SessionId(9), "t".into()).await.unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(!kv.contains_key("test_9_"));
        holder.release().await.unwrap();
    }

    #[test]
    fn test_options_from_out_of_range_config() {
        let mut config = Config::default();
        config.sessions.lock_max_wait_time = 1e20;
        config.sessions.ttl = u64::MAX;
        assert!(!config.validate().is_ok());

        let options = StoreOptions::from_config(&config);
        assert_eq!(options.lock.max_wait, Some(Duration::MAX));
        assert_eq!(options.ttl, Some(Duration::from_secs(u64::MAX)));
    }

    #[tokio::test]
    async fn test_create_with_unrepresentable_ttl_releases_lock() {
        let kv = MemoryKv::new();
        let options = StoreOptions {
            layout: KeyLayout::new("test"),
            ttl: Some(Duration::from_secs(u64::MAX)),
            ..StoreOptions::default()
        };
        let store = SessionStore::new(Arc::new(kv.clone()), options, VersionManager::new(None));

        let err = store.create(SessionId(1), "t".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::Kv(_)));
        assert!(!kv.contains_key("test_1_"));
        assert!(!kv.contains_key("test_1_lock"));
    }

    #[tokio::test]
    async fn test_fetch_missing_session_is_expired() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);

        let err = store.fetch(SessionId(5), StateId(0)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Expired { reason: ExpirationReason::MissingField(ref f), .. } if f == "state"
        ));
    }

    #[tokio::test]
    async fn test_fetch_unknown_state_is_expired() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);
        let mut created = store.create(SessionId(5), "t".into()).await.unwrap();
        created.lock.release().await.unwrap();

        let err = store.fetch(SessionId(5), StateId(3)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Expired { reason: ExpirationReason::MissingField(ref f), .. } if f == "00003"
        ));
    }

    #[tokio::test]
    async fn test_malformed_records() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);
        let mut conn = kv.connection().await.unwrap();

        conn.execute(Batch::new().hset(
            "test_7_",
            vec![
                ("state".to_string(), b"0".to_vec()),
                ("sess".to_string(), b"epoch:tok:data".to_vec()),
                ("00000".to_string(), Vec::new()),
            ],
        ))
        .await
        .unwrap();
        let err = store.fetch(SessionId(7), StateId(0)).await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedRecord { .. }));

        conn.execute(Batch::new().hset(
            "test_7_",
            vec![
                ("state".to_string(), b"minus one".to_vec()),
                (
                    "sess".to_string(),
                    record::encode_parts(&store.current_epoch(), &"tok".into(), b"").unwrap(),
                ),
            ],
        ))
        .await
        .unwrap();
        let err = store.fetch(SessionId(7), StateId(0)).await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedRecord { .. }));
        assert!(!err.is_expired());
    }

    #[tokio::test]
    async fn test_counter_overflow_reports_applied_write() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);
        let token = SecureToken::from("t");
        let mut created = store.create(SessionId(2), token.clone()).await.unwrap();

        let mut conn = kv.connection().await.unwrap();
        conn.execute(Batch::new().hset(
            "test_2_",
            vec![("state".to_string(), u32::MAX.to_string().into_bytes())],
        ))
        .await
        .unwrap();

        let last = StateId(u32::MAX);
        let err = store
            .store(SessionId(2), last, &token, false, None, b"final")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::StateCounterOverflow { counter, .. } if counter == i64::from(u32::MAX) + 1
        ));
        assert!(err.recovery_suggestion().is_some());
        assert_eq!(kv.hash("test_2_").unwrap().get(&last.field()).unwrap(), b"final");
        created.lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_start_warns_on_unbounded_server() {
        let kv = MemoryKv::new();
        let store = store_with(&kv);

        let report = store.handle_start().await.unwrap();
        assert!(!report.server.is_bounded_cache());
        assert!(matches!(report.reload, ReloadOutcome::Invalidated { .. }));
        assert_eq!(kv.client_names(), vec!["forkstate-sessions".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_start_flush_mode() {
        let kv = MemoryKv::with_server_info(ServerInfo {
            maxmemory: 1 << 30,
            maxmemory_policy: "volatile-lru".to_string(),
        });
        let options = StoreOptions {
            reset_on_reload: ResetMode::Flush,
            ..StoreOptions::default()
        };
        let store = SessionStore::new(Arc::new(kv.clone()), options, VersionManager::new(None));

        let mut created = store.create(SessionId(3), "t".into()).await.unwrap();
        created.lock.release().await.unwrap();
        assert!(!kv.is_empty());

        let report = store.handle_start().await.unwrap();
        assert!(report.server.is_bounded_cache());
        assert!(matches!(report.reload, ReloadOutcome::Flushed { .. }));
        assert!(kv.is_empty());
    }
}
