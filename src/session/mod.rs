//! Session state
//!
//! A session is the server-side state for one client id, surviving
//! reconnects unless started clean. The owning connection task mutates it
//! exclusively; the store hands out `Arc<RwLock<Session>>` handles keyed by
//! client id and enforces the one-connected-session-per-id invariant
//! through the broker's takeover path.

mod inflight;
mod queue;

pub use inflight::{InflightMessage, InflightWindow, Qos2State, Retransmit};
pub use queue::{EnqueueResult, QueuedMessage, SendQueue};

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::acl::AclCache;
use crate::config::{Config, OverflowPolicy};
use crate::protocol::{ProtocolVersion, SubscriptionOptions, Will};

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// CONNECT received, authentication in flight
    Connecting,
    Connected,
    /// Waiting out the expiry interval (non-clean) or about to be reaped
    Disconnected,
}

/// One subscription as the session remembers it
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

/// Tunables a new session is born with, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub queue_max: usize,
    pub queue_high_watermark: usize,
    pub queue_overflow: OverflowPolicy,
    pub max_inflight: u16,
    pub receive_maximum: u16,
    pub acl_cache_size: usize,
    pub acl_cache_ttl: Option<Duration>,
    pub expiry_default_secs: u32,
    pub default_keep_alive: u16,
    pub max_keep_alive: u16,
}

impl From<&Config> for SessionParams {
    fn from(config: &Config) -> Self {
        Self {
            queue_max: config.session.queue_max,
            queue_high_watermark: config.session.queue_high_watermark,
            queue_overflow: config.session.queue_overflow,
            max_inflight: config.session.max_inflight,
            receive_maximum: config.limits.receive_maximum,
            acl_cache_size: config.acl.cache_max_size,
            acl_cache_ttl: config.acl.cache_ttl_duration(),
            expiry_default_secs: config.session.expiry_default as u32,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
        }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Per-client session state
pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub state: SessionState,
    pub clean_start: bool,
    /// Seconds the session outlives a disconnect; 0 reaps immediately
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    pub last_activity: Instant,
    /// Filter -> options, keyed by the bare filter (share prefix stripped)
    pub subscriptions: AHashMap<Arc<str>, SessionSubscription>,
    pub inflight: InflightWindow,
    pub queue: SendQueue,
    pub acl_cache: AclCache,
    pub will: Option<Will>,
    pub will_delay_interval: u32,
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion, params: &SessionParams) -> Self {
        Self {
            client_id,
            protocol_version,
            state: SessionState::Connecting,
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: params.default_keep_alive,
            last_activity: Instant::now(),
            subscriptions: AHashMap::with_capacity(8),
            inflight: InflightWindow::new(params.receive_maximum, params.max_inflight),
            queue: SendQueue::new(
                params.queue_max,
                params.queue_high_watermark,
                params.queue_overflow,
            ),
            acl_cache: AclCache::new(params.acl_cache_size, params.acl_cache_ttl),
            will: None,
            will_delay_interval: 0,
            disconnected_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Expired while disconnected
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.session_expiry_interval == 0 {
            return true;
        }
        if self.session_expiry_interval == u32::MAX {
            return false;
        }
        self.disconnected_at
            .is_some_and(|at| at.elapsed().as_secs() >= self.session_expiry_interval as u64)
    }

    /// No bytes for more than 1.5x the keepalive interval
    pub fn keep_alive_exceeded(&self) -> bool {
        if self.keep_alive == 0 || self.state != SessionState::Connected {
            return false;
        }
        let timeout = Duration::from_secs((self.keep_alive as u64 * 3) / 2);
        self.last_activity.elapsed() > timeout
    }

    pub fn add_subscription(
        &mut self,
        filter: Arc<str>,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> bool {
        self.subscriptions
            .insert(
                filter,
                SessionSubscription {
                    options,
                    subscription_id,
                },
            )
            .is_some()
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Thread-safe session store keyed by client id
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

/// How `get_or_create` satisfied the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLookup {
    Created,
    /// Prior state survived and was resumed (CONNACK session_present)
    Resumed,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Fetch or create the session for a connecting client
    ///
    /// A clean start always discards prior state. Otherwise a live,
    /// unexpired session is resumed with its subscriptions and inflight
    /// windows intact.
    pub fn get_or_create(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        params: &SessionParams,
    ) -> (Arc<RwLock<Session>>, SessionLookup) {
        let client_id: Arc<str> = Arc::from(client_id);

        if !clean_start {
            if let Some(existing) = self.sessions.get(&client_id) {
                let session = existing.clone();
                drop(existing);
                let mut s = session.write();
                if !s.is_expired() {
                    s.state = SessionState::Connecting;
                    s.protocol_version = protocol_version;
                    s.clean_start = false;
                    s.disconnected_at = None;
                    s.touch();
                    drop(s);
                    return (session, SessionLookup::Resumed);
                }
            }
        }

        let mut session = Session::new(client_id.clone(), protocol_version, params);
        session.clean_start = clean_start;
        let session = Arc::new(RwLock::new(session));
        self.sessions.insert(client_id, session.clone());
        (session, SessionLookup::Created)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Mark a session disconnected; reaps immediately when the expiry
    /// interval is zero. Returns true when the session was reaped.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let reap = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                s.state = SessionState::Disconnected;
                s.disconnected_at = Some(Instant::now());
                s.clean_start || s.session_expiry_interval == 0
            }
            None => return false,
        };
        // Remove outside the map reference to avoid deadlocking the shard
        if reap {
            self.sessions.remove(client_id);
        }
        reap
    }

    /// Drop expired sessions and purge expired queued messages everywhere.
    /// Returns the reaped client ids so the caller can release routes.
    pub fn sweep_expired(&self) -> Vec<Arc<str>> {
        let mut reaped = Vec::new();
        self.sessions.retain(|client_id, session| {
            let mut s = session.write();
            s.queue.purge_expired();
            if s.is_expired() {
                reaped.push(client_id.clone());
                false
            } else {
                true
            }
        });
        reaped
    }

    /// Connected sessions whose keepalive lapsed
    pub fn keep_alive_lapsed(&self) -> Vec<Arc<str>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().read().keep_alive_exceeded())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SessionParams {
        SessionParams::default()
    }

    #[test]
    fn test_clean_start_discards_state() {
        let store = SessionStore::new();
        let (session, lookup) =
            store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        assert_eq!(lookup, SessionLookup::Created);
        session
            .write()
            .add_subscription(Arc::from("t"), SubscriptionOptions::default(), None);

        let (_, lookup) = store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        assert_eq!(lookup, SessionLookup::Resumed);

        let (session, lookup) = store.get_or_create("c1", ProtocolVersion::V5, true, &params());
        assert_eq!(lookup, SessionLookup::Created);
        assert!(session.read().subscriptions.is_empty());
    }

    #[test]
    fn test_expired_session_not_resumed() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.session_expiry_interval = 0;
            s.disconnected_at = Some(Instant::now());
        }
        let (_, lookup) = store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        assert_eq!(lookup, SessionLookup::Created);
    }

    #[test]
    fn test_disconnect_reaps_zero_expiry() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", ProtocolVersion::V311, false, &params());
        session.write().state = SessionState::Connected;
        assert!(store.disconnect("c1"));
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_disconnect_keeps_session_within_expiry() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        {
            let mut s = session.write();
            s.state = SessionState::Connected;
            s.session_expiry_interval = 3_600;
        }
        assert!(!store.disconnect("c1"));
        assert!(store.get("c1").is_some());
        assert_eq!(store.sweep_expired().len(), 0);
    }

    #[test]
    fn test_sweep_reaps_expired() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create("c1", ProtocolVersion::V5, false, &params());
        {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.session_expiry_interval = 0;
            s.disconnected_at = Some(Instant::now());
        }
        let reaped = store.sweep_expired();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].as_ref(), "c1");
        assert!(store.is_empty());
    }

    #[test]
    fn test_keep_alive_exceeded() {
        let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, &params());
        session.state = SessionState::Connected;
        session.keep_alive = 1;
        assert!(!session.keep_alive_exceeded());
        session.last_activity = Instant::now() - Duration::from_secs(2);
        assert!(session.keep_alive_exceeded());
        // Keepalive 0 disables the timer
        session.keep_alive = 0;
        assert!(!session.keep_alive_exceeded());
    }
}
