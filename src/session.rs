//! Session Storage for tinyserve
//!
//! Provides in-memory session storage with support for:
//! - Session creation with unique opaque ids
//! - Attribute storage with optional unbind notification
//! - Last-access tracking and a background expiry sweep
//! - Persistence of the whole table across restarts

use crate::cookie::Cookie;
use crate::error::{RuntimeError, RuntimeResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the session cookie
pub const SESSION_COOKIE_NAME: &str = "JSESSIONID";

/// Bumped whenever the persisted layout changes
const SNAPSHOT_VERSION: u32 = 1;

/// Notified when an attribute is bound to or unbound from a session
pub trait SessionBindingListener: Send + Sync {
    fn value_bound(&self, _session_id: &str, _name: &str) {}

    fn value_unbound(&self, session_id: &str, name: &str);
}

/// Persisted part of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    /// Negative means the session never expires
    max_inactive_seconds: i64,
    attributes: HashMap<String, serde_json::Value>,
    valid: bool,
    is_new: bool,
}

/// A server-side session
pub struct Session {
    id: String,
    state: RwLock<SessionState>,
    listeners: Mutex<HashMap<String, Arc<dyn SessionBindingListener>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Session {
    fn new(id: String, max_inactive_seconds: i64, now: DateTime<Utc>) -> Self {
        Self::from_state(
            id,
            SessionState {
                created_at: now,
                last_accessed_at: now,
                max_inactive_seconds,
                attributes: HashMap::new(),
                valid: true,
                is_new: true,
            },
        )
    }

    fn from_state(id: String, state: SessionState) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.read().created_at
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.state.read().last_accessed_at
    }

    /// True until a request has come back carrying this session's cookie
    pub fn is_new(&self) -> bool {
        self.state.read().is_new
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().valid
    }

    pub fn max_inactive_seconds(&self) -> i64 {
        self.state.read().max_inactive_seconds
    }

    /// Negative values disable expiry for this session
    pub fn set_max_inactive_seconds(&self, seconds: i64) {
        self.state.write().max_inactive_seconds = seconds;
    }

    /// Record an access by a request carrying the session cookie
    pub fn touch(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.last_accessed_at = now;
        state.is_new = false;
    }

    /// Check if session is expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read();
        if state.max_inactive_seconds < 0 {
            return false;
        }
        let idle = now - state.last_accessed_at;
        idle.num_milliseconds() > state.max_inactive_seconds.saturating_mul(1000)
    }

    fn ensure_valid(&self) -> RuntimeResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RuntimeError::illegal_state(format!(
                "session {} has been invalidated",
                self.id
            )))
        }
    }

    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        self.state.read().attributes.get(name).cloned()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().attributes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bind a value, replacing (and unbinding) any previous value
    pub fn set_attribute(&self, name: &str, value: serde_json::Value) -> RuntimeResult<()> {
        self.ensure_valid()?;
        self.state.write().attributes.insert(name.to_string(), value);
        if let Some(old) = self.listeners.lock().remove(name) {
            old.value_unbound(&self.id, name);
        }
        Ok(())
    }

    /// Bind a value whose listener is told when it leaves the session
    pub fn set_bound_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
        listener: Arc<dyn SessionBindingListener>,
    ) -> RuntimeResult<()> {
        self.set_attribute(name, value)?;
        listener.value_bound(&self.id, name);
        self.listeners.lock().insert(name.to_string(), listener);
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Option<serde_json::Value> {
        let removed = self.state.write().attributes.remove(name);
        if let Some(listener) = self.listeners.lock().remove(name) {
            listener.value_unbound(&self.id, name);
        }
        removed
    }

    /// Mark the session invalid, clear its attributes and notify listeners
    ///
    /// The store stops returning an invalidated session immediately.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.write();
            if !state.valid {
                return;
            }
            state.valid = false;
            state.attributes.clear();
        }
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        for (name, listener) in listeners {
            listener.value_unbound(&self.id, &name);
        }
        debug!(session_id = %self.id, "Session invalidated");
    }

    fn snapshot(&self) -> PersistedSession {
        PersistedSession {
            id: self.id.clone(),
            state: self.state.read().clone(),
        }
    }
}

/// Shortest interval between expiry sweeps a server configuration accepts
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Session store configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity timeout for new sessions in seconds; negative never expires
    pub timeout_seconds: i64,
    /// Send an `Expires` attribute so the cookie outlives the browser
    pub persistent_cookie: bool,
    /// Cookie name for session ID
    pub cookie_name: String,
    /// Cookie path
    pub cookie_path: String,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// Remove sessions once idle past their timeout. Off for negative
    /// timeouts: such sessions expire on the client only.
    pub reap: bool,
}

impl SessionConfig {
    /// Settings for a timeout given in minutes. Negative means a persistent
    /// cookie expiring after the absolute value, with no reaping.
    pub fn from_minutes(minutes: i64) -> Self {
        let timeout_seconds = minutes.saturating_abs().saturating_mul(60);
        Self {
            timeout_seconds,
            persistent_cookie: minutes < 0,
            sweep_interval: Duration::from_secs(timeout_seconds.max(1) as u64),
            reap: minutes >= 0,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30 * 60,
            persistent_cookie: false,
            cookie_name: SESSION_COOKIE_NAME.to_string(),
            cookie_path: "/".to_string(),
            sweep_interval: Duration::from_secs(30 * 60),
            reap: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    id: String,
    state: SessionState,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    sessions: Vec<PersistedSession>,
}

/// Concurrent session table
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    counter: AtomicU64,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            counter: AtomicU64::new(0),
            config,
        }
    }

    /// Get session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Time, a per-store counter and a random component, as one token
    fn generate_id(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{:x}{:x}{}",
            Utc::now().timestamp_millis(),
            count,
            Uuid::new_v4().simple()
        )
        .to_uppercase()
    }

    /// Invalidated, or idle past its timeout while reaping is on
    fn is_dead(&self, session: &Session, now: DateTime<Utc>) -> bool {
        !session.is_valid() || (self.config.reap && session.is_expired(now))
    }

    /// Create a new session
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(
            self.generate_id(),
            self.config.timeout_seconds,
            Utc::now(),
        ));
        info!(session_id = %session.id(), "Creating session");
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    /// Get a live session by ID without touching it
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.get_at(session_id, Utc::now())
    }

    fn get_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id).map(|entry| Arc::clone(&*entry))?;
        if !self.is_dead(&session, now) {
            return Some(session);
        }
        debug!(session_id = %session_id, "Session is no longer live, removing");
        self.remove(session_id);
        None
    }

    /// Get a live session and record the access
    pub fn access(&self, session_id: &str) -> Option<Arc<Session>> {
        let now = Utc::now();
        let session = self.get_at(session_id, now)?;
        session.touch(now);
        Some(session)
    }

    /// Delete a session, invalidating it
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.invalidate();
        Some(session)
    }

    /// Remove expired or invalidated sessions; returns how many went
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.is_dead(entry, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in candidates {
            if let Some((_, session)) = self
                .sessions
                .remove_if(&id, |_, s| self.is_dead(s, now))
            {
                session.invalidate();
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, remaining = self.sessions.len(), "Cleaned up expired sessions");
        }
        removed
    }

    /// Cookie carrying `session_id`
    pub fn session_cookie(&self, session_id: &str) -> Cookie {
        let mut cookie = Cookie::new(&self.config.cookie_name, session_id)
            .with_path(&self.config.cookie_path)
            .http_only(true);
        if self.config.persistent_cookie {
            cookie = cookie.with_expires(Utc::now() + ChronoDuration::seconds(self.config.timeout_seconds));
        }
        cookie
    }

    /// Get count of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session without notification
    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Write the whole table to `path`
    pub async fn save(&self, path: &Path) -> RuntimeResult<usize> {
        let sessions: Vec<PersistedSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.snapshot())
            .collect();
        let count = sessions.len();
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            sessions,
        };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| RuntimeError::session(format!("cannot serialize sessions: {e}")))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(count, path = %path.display(), "Persisted sessions");
        Ok(count)
    }

    /// Restore sessions saved by [`SessionStore::save`], skipping expired ones
    pub async fn load(&self, path: &Path) -> RuntimeResult<usize> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| RuntimeError::session(format!("corrupt session file: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RuntimeError::session(format!(
                "session file version {} is not supported (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let now = Utc::now();
        let mut restored = 0;
        for persisted in snapshot.sessions {
            let session = Session::from_state(persisted.id, persisted.state);
            if self.is_dead(&session, now) {
                continue;
            }
            self.sessions
                .insert(session.id().to_string(), Arc::new(session));
            restored += 1;
        }
        info!(restored, path = %path.display(), "Restored sessions");
        Ok(restored)
    }
}

/// Shared session store type
pub type SharedSessionStore = Arc<SessionStore>;

/// Create a shared session store
pub fn create_session_store(config: SessionConfig) -> SharedSessionStore {
    Arc::new(SessionStore::new(config))
}

/// Run [`SessionStore::sweep`] every `interval` until `shutdown` flips
pub fn spawn_sweeper(
    store: SharedSessionStore,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // A zero period would panic inside the task
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Session sweeper stopping");
                        return;
                    }
                }
            }
        }
    })
}

/// Log-and-continue wrapper around [`SessionStore::load`]
pub async fn restore_or_start_empty(store: &SessionStore, path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = store.load(path).await {
        warn!(path = %path.display(), error = %e, "Could not restore sessions, starting empty");
        store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn store() -> SessionStore {
        SessionStore::new(SessionConfig::default())
    }

    #[derive(Default)]
    struct CountingListener {
        bound: AtomicUsize,
        unbound: AtomicUsize,
    }

    impl SessionBindingListener for CountingListener {
        fn value_bound(&self, _session_id: &str, _name: &str) {
            self.bound.fetch_add(1, Ordering::SeqCst);
        }

        fn value_unbound(&self, _session_id: &str, _name: &str) {
            self.unbound.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_session_creation() {
        let store = store();
        let session = store.create();
        assert!(!session.id().is_empty());
        assert!(session.is_new());
        assert!(session.is_valid());
        assert_eq!(session.max_inactive_seconds(), 1800);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let store = store();
        let ids: std::collections::HashSet<String> =
            (0..500).map(|_| store.create().id().to_string()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_session_get_and_access() {
        let store = store();
        let id = store.create().id().to_string();

        let session = store.get(&id).unwrap();
        assert!(session.is_new());

        let session = store.access(&id).unwrap();
        assert!(!session.is_new());
    }

    #[test]
    fn test_session_remove() {
        let store = store();
        let session = store.create();
        session.set_attribute("user", serde_json::json!("alice")).unwrap();

        assert!(store.remove(session.id()).is_some());
        assert!(store.get(session.id()).is_none());
        assert!(!session.is_valid());
        assert!(session.attribute("user").is_none());
    }

    #[test]
    fn test_invalidated_session_is_unreachable() {
        let store = store();
        let session = store.create();
        session.invalidate();
        assert!(store.get(session.id()).is_none());
        assert!(store.is_empty());
        assert!(session.set_attribute("x", serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_attributes() {
        let session = store().create();
        session.set_attribute("count", serde_json::json!(1)).unwrap();
        session.set_attribute("name", serde_json::json!("x")).unwrap();
        assert_eq!(session.attribute("count"), Some(serde_json::json!(1)));
        assert_eq!(session.attribute_names(), ["count", "name"]);
        assert_eq!(session.remove_attribute("count"), Some(serde_json::json!(1)));
        assert!(session.attribute("count").is_none());
    }

    #[test]
    fn test_unbind_notification() {
        let store = store();
        let session = store.create();
        let listener = Arc::new(CountingListener::default());

        session
            .set_bound_attribute("cart", serde_json::json!([]), listener.clone())
            .unwrap();
        assert_eq!(listener.bound.load(Ordering::SeqCst), 1);

        // Replacing the value releases the listener
        session.set_attribute("cart", serde_json::json!([1])).unwrap();
        assert_eq!(listener.unbound.load(Ordering::SeqCst), 1);

        session
            .set_bound_attribute("cart", serde_json::json!([2]), listener.clone())
            .unwrap();
        store.remove(session.id());
        assert_eq!(listener.unbound.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sweep_removes_idle_sessions() {
        let store = store();
        let idle = store.create();
        idle.set_max_inactive_seconds(1);
        let listener = Arc::new(CountingListener::default());
        idle.set_bound_attribute("k", serde_json::json!(true), listener.clone())
            .unwrap();

        let active = store.create();
        active.set_max_inactive_seconds(1);

        let later = Utc::now() + ChronoDuration::seconds(2);
        active.touch(later - ChronoDuration::milliseconds(500));

        assert_eq!(store.sweep_at(later), 1);
        assert!(store.get_at(idle.id(), later).is_none());
        assert!(store.get_at(active.id(), later).is_some());
        assert_eq!(listener.unbound.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negative_max_inactive_never_expires() {
        let store = store();
        let session = store.create();
        session.set_max_inactive_seconds(-1);
        let far = Utc::now() + ChronoDuration::days(365);
        assert_eq!(store.sweep_at(far), 0);
        assert!(store.get_at(session.id(), far).is_some());
    }

    #[test]
    fn test_config_from_minutes() {
        let config = SessionConfig::from_minutes(-5);
        assert_eq!(config.timeout_seconds, 300);
        assert!(config.persistent_cookie);
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert!(!config.reap);

        let config = SessionConfig::from_minutes(10);
        assert!(!config.persistent_cookie);
        assert!(config.reap);
    }

    #[test]
    fn test_negative_timeout_keeps_idle_sessions() {
        let store = SessionStore::new(SessionConfig::from_minutes(-1));
        let idle = store.create();
        let gone = store.create();
        gone.invalidate();

        let later = Utc::now() + ChronoDuration::minutes(5);
        assert_eq!(store.sweep_at(later), 1);
        assert!(store.get_at(idle.id(), later).is_some());
        assert!(idle.is_valid());
    }

    #[tokio::test]
    async fn test_zero_interval_sweeper_keeps_running() {
        let store = create_session_store(SessionConfig::default());
        let session = store.create();
        session.invalidate();

        let (tx, rx) = watch::channel(false);
        let sweeper = spawn_sweeper(store.clone(), Duration::ZERO, rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_session_cookie() {
        let store = store();
        let cookie = store.session_cookie("ABC");
        assert_eq!(cookie.name, "JSESSIONID");
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert!(cookie.expires.is_none());

        let persistent = SessionStore::new(SessionConfig::from_minutes(-1));
        assert!(persistent.session_cookie("ABC").expires.is_some());
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let store = create_session_store(SessionConfig::default());
        let session = store.create();
        session.set_max_inactive_seconds(1);

        let (tx, rx) = watch::channel(false);
        let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(500), rx);

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(store.is_empty());

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = store();
        let session = store.create();
        session.set_attribute("user", serde_json::json!("alice")).unwrap();
        let gone = store.create();
        gone.invalidate();
        assert_eq!(store.save(&path).await.unwrap(), 1);

        let restored = self::store();
        assert_eq!(restored.load(&path).await.unwrap(), 1);
        let session = restored.get(session.id()).unwrap();
        assert_eq!(session.attribute("user"), Some(serde_json::json!("alice")));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = store();
        assert!(store.load(&path).await.is_err());
        restore_or_start_empty(&store, &path).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let body = serde_json::json!({
            "version": 99,
            "saved_at": Utc::now(),
            "sessions": []
        });
        tokio::fs::write(&path, body.to_string()).await.unwrap();

        let err = store().load(&path).await.unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }
}
