//! Authentication/authorization capability and the per-session ACL cache
//!
//! Concrete backends (LDAP, SQL, HTTP, built-in) live outside the core and
//! implement [`AuthProvider`]; the core never imports backend symbols.
//! Authorization decisions are cached per session in a bounded LRU keyed by
//! `(action, topic)`; a global epoch counter invalidates every cache when
//! authorization rules change.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use async_trait::async_trait;
use compact_str::CompactString;

use crate::protocol::{ProtocolVersion, ReasonCode};

/// The action an authorization check applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclAction {
    Publish,
    Subscribe,
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Allow,
    Deny,
}

impl AclDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AclDecision::Allow)
    }
}

/// Outcome of authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// Denied with the v5 reason code surfaced on CONNACK
    Deny(ReasonCode),
}

impl AuthDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthDecision::Allow)
    }

    pub fn reason_code(self) -> ReasonCode {
        match self {
            AuthDecision::Allow => ReasonCode::Success,
            AuthDecision::Deny(code) => code,
        }
    }
}

/// Identity of the client a check runs for
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub username: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub protocol_version: ProtocolVersion,
}

/// Backend failure; authorization fails closed on it
#[derive(Debug)]
pub enum AuthError {
    /// Backend unreachable or misbehaving
    Backend(String),
    /// Operation not supported by this provider
    Unsupported,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Backend(msg) => write!(f, "auth backend error: {}", msg),
            AuthError::Unsupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Pluggable authentication/authorization backend
///
/// Lifecycle methods let the broker start, stop and health-check a backend
/// bound to a listener; `on_query` serves the admin surface.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate a connecting client
    async fn authenticate(
        &self,
        client: &ClientInfo,
        password: Option<&[u8]>,
    ) -> Result<AuthDecision, AuthError>;

    /// Authorize an action on a topic or filter
    async fn authorize(
        &self,
        client: &ClientInfo,
        action: AclAction,
        topic: &str,
    ) -> Result<AclDecision, AuthError>;

    async fn on_start(&self) -> Result<(), AuthError> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), AuthError> {
        Ok(())
    }

    async fn on_health_check(&self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Admin-plane query against the backend
    async fn on_query(&self, _query: &str) -> Result<String, AuthError> {
        Err(AuthError::Unsupported)
    }
}

/// Built-in provider that accepts everyone
pub struct AllowAll;

#[async_trait]
impl AuthProvider for AllowAll {
    async fn authenticate(
        &self,
        _client: &ClientInfo,
        _password: Option<&[u8]>,
    ) -> Result<AuthDecision, AuthError> {
        Ok(AuthDecision::Allow)
    }

    async fn authorize(
        &self,
        _client: &ClientInfo,
        _action: AclAction,
        _topic: &str,
    ) -> Result<AclDecision, AuthError> {
        Ok(AclDecision::Allow)
    }
}

/// Cluster-wide invalidation epoch for ACL caches
///
/// `invalidate_all()` is the `empty_acl_cache` broadcast: bumping the epoch
/// makes every per-session cache discard its entries on next access.
#[derive(Debug, Default)]
pub struct AclCacheEpoch(AtomicU64);

impl AclCacheEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn invalidate_all(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

#[derive(Debug)]
struct CacheEntry {
    decision: AclDecision,
    inserted_at: Instant,
    last_used: u64,
}

/// Per-session LRU of authorization decisions
///
/// Owned by the session task, never shared. Entries expire by TTL and the
/// whole cache drops when the global epoch moves.
#[derive(Debug)]
pub struct AclCache {
    entries: AHashMap<(AclAction, CompactString), CacheEntry>,
    capacity: usize,
    ttl: Option<Duration>,
    epoch_seen: u64,
    clock: u64,
}

impl AclCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: AHashMap::with_capacity(capacity.min(64)),
            capacity,
            ttl,
            epoch_seen: 0,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn sync_epoch(&mut self, epoch: u64) {
        if epoch != self.epoch_seen {
            self.entries.clear();
            self.epoch_seen = epoch;
        }
    }

    /// Cached decision for `(action, topic)`, if fresh
    pub fn get(&mut self, action: AclAction, topic: &str, epoch: u64) -> Option<AclDecision> {
        if self.capacity == 0 {
            return None;
        }
        self.sync_epoch(epoch);

        self.clock += 1;
        let clock = self.clock;
        let key = (action, CompactString::new(topic));

        let expired = match self.entries.get(&key) {
            None => return None,
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl),
        };
        if expired {
            self.entries.remove(&key);
            return None;
        }

        let entry = self.entries.get_mut(&key)?;
        entry.last_used = clock;
        Some(entry.decision)
    }

    /// Insert a decision, evicting the least recently used entry when full
    pub fn insert(&mut self, action: AclAction, topic: &str, decision: AclDecision, epoch: u64) {
        if self.capacity == 0 {
            return;
        }
        self.sync_epoch(epoch);

        if self.entries.len() >= self.capacity
            && !self.entries.contains_key(&(action, CompactString::new(topic)))
        {
            if let Some(lru_key) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&lru_key);
            }
        }

        self.clock += 1;
        self.entries.insert(
            (action, CompactString::new(topic)),
            CacheEntry {
                decision,
                inserted_at: Instant::now(),
                last_used: self.clock,
            },
        );
    }
}
