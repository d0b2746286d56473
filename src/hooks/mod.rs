//! Hook chain
//!
//! Extension points invoked at broker lifecycle moments. Callbacks are
//! registered with a signed priority (lower runs earlier) and an optional
//! topic filter restricting which events they see. Results fold through the
//! chain: `Continue` leaves the accumulator untouched, `ContinueWith`
//! replaces it, `Stop` short-circuits the remainder.
//!
//! A failing callback is isolated to the current packet: authentication and
//! authorization points fail closed, observability points fail open with a
//! log line and a counter bump.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::acl::{AclAction, AclDecision, AuthDecision, ClientInfo};
use crate::broker::Message;
use crate::metrics::BrokerStats;
use crate::protocol::{ReasonCode, SubscriptionOptions};
use crate::topic::topic_matches_filter;


/// Lifecycle points a hook can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    ClientConnect,
    ClientAuthenticate,
    ClientCheckAcl,
    ClientConnected,
    ClientDisconnected,
    SessionSubscribed,
    SessionUnsubscribed,
    MessagePublish,
    MessageDelivered,
}

/// Fold outcome of one callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction<T> {
    /// Continue the chain, accumulator unchanged
    Continue,
    /// Continue the chain with an updated accumulator
    ContinueWith(T),
    /// Short-circuit the chain
    Stop,
}

/// Hook failure; isolation policy depends on the hook point
#[derive(Debug)]
pub enum HookError {
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "hook error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Broker hook callbacks
///
/// Every method has a no-op default, so implementations only override the
/// points they care about.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn on_client_connect(&self, _client: &ClientInfo) -> HookResult<HookAction<()>> {
        Ok(HookAction::Continue)
    }

    async fn on_authenticate(
        &self,
        _client: &ClientInfo,
        _password: Option<&[u8]>,
    ) -> HookResult<HookAction<AuthDecision>> {
        Ok(HookAction::Continue)
    }

    async fn on_check_acl(
        &self,
        _client: &ClientInfo,
        _action: AclAction,
        _topic: &str,
    ) -> HookResult<HookAction<AclDecision>> {
        Ok(HookAction::Continue)
    }

    /// May rewrite the message (fold) or drop it (`Stop`)
    async fn on_message_publish(&self, _message: &Message) -> HookResult<HookAction<Message>> {
        Ok(HookAction::Continue)
    }

    async fn on_session_subscribed(
        &self,
        _client: &ClientInfo,
        _filter: &str,
        _options: &SubscriptionOptions,
    ) {
    }

    async fn on_session_unsubscribed(&self, _client: &ClientInfo, _filter: &str) {}

    async fn on_client_connected(&self, _client: &ClientInfo) {}

    async fn on_client_disconnected(&self, _client: &ClientInfo, _reason: ReasonCode) {}

    async fn on_message_delivered(&self, _client_id: &str, _message: &Message) {}
}

/// Registration parameters for a hook
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Lower priorities run earlier; ties keep registration order
    pub priority: i32,
    /// Restrict topic-carrying events to matching topics
    pub filter: Option<String>,
    /// Restrict to specific points; `None` means every point
    pub points: Option<Vec<HookPoint>>,
}

/// Handle for unregistering a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

struct HookEntry {
    id: u64,
    hook: Arc<dyn Hook>,
    spec: HookSpec,
}

impl HookEntry {
    fn applies(&self, point: HookPoint, topic: Option<&str>) -> bool {
        if let Some(points) = &self.spec.points {
            if !points.contains(&point) {
                return false;
            }
        }
        match (&self.spec.filter, topic) {
            (Some(filter), Some(topic)) => topic_matches_filter(topic, filter),
            // Filtered hooks skip events with no topic context
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Ordered chain of hooks
pub struct HookRegistry {
    entries: RwLock<Vec<HookEntry>>,
    next_id: AtomicU64,
    stats: Arc<BrokerStats>,
}

impl HookRegistry {
    pub fn new(stats: Arc<BrokerStats>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Register a hook with default priority at every point
    pub fn register(&self, hook: Arc<dyn Hook>) -> HookId {
        self.register_with(hook, HookSpec::default())
    }

    pub fn register_with(&self, hook: Arc<dyn Hook>, spec: HookSpec) -> HookId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.push(HookEntry { id, hook, spec });
        // Stable sort keeps registration order within a priority
        entries.sort_by_key(|e| e.spec.priority);
        HookId(id)
    }

    pub fn unregister(&self, id: HookId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id.0);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn chain(&self, point: HookPoint, topic: Option<&str>) -> Vec<Arc<dyn Hook>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.applies(point, topic))
            .map(|e| e.hook.clone())
            .collect()
    }

    fn record_failure(&self, point: HookPoint, err: &HookError) {
        BrokerStats::incr(&self.stats.hook_failures);
        warn!("hook failed at {:?}: {}", point, err);
    }

    /// client.connect: any `Stop` or failure rejects the connection
    pub async fn client_connect(&self, client: &ClientInfo) -> bool {
        for hook in self.chain(HookPoint::ClientConnect, None) {
            match hook.on_client_connect(client).await {
                Ok(HookAction::Stop) => return false,
                Ok(_) => {}
                Err(e) => {
                    self.record_failure(HookPoint::ClientConnect, &e);
                    return false;
                }
            }
        }
        true
    }

    /// client.authenticate: folds a decision, fail-closed on error
    pub async fn authenticate(&self, client: &ClientInfo, password: Option<&[u8]>) -> AuthDecision {
        let mut decision = AuthDecision::Allow;
        for hook in self.chain(HookPoint::ClientAuthenticate, None) {
            match hook.on_authenticate(client, password).await {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::ContinueWith(d)) => decision = d,
                Ok(HookAction::Stop) => break,
                Err(e) => {
                    self.record_failure(HookPoint::ClientAuthenticate, &e);
                    return AuthDecision::Deny(ReasonCode::ServerUnavailable);
                }
            }
        }
        decision
    }

    /// client.check_acl: folds a decision, fail-closed on error
    pub async fn check_acl(
        &self,
        client: &ClientInfo,
        action: AclAction,
        topic: &str,
    ) -> AclDecision {
        let mut decision = AclDecision::Allow;
        for hook in self.chain(HookPoint::ClientCheckAcl, Some(topic)) {
            match hook.on_check_acl(client, action, topic).await {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::ContinueWith(d)) => decision = d,
                Ok(HookAction::Stop) => break,
                Err(e) => {
                    self.record_failure(HookPoint::ClientCheckAcl, &e);
                    return AclDecision::Deny;
                }
            }
        }
        decision
    }

    /// message.publish: folds the message; `Stop` drops it, errors fail open
    pub async fn message_publish(&self, mut message: Message) -> Option<Message> {
        for hook in self.chain(HookPoint::MessagePublish, Some(message.topic.as_ref())) {
            match hook.on_message_publish(&message).await {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::ContinueWith(m)) => message = m,
                Ok(HookAction::Stop) => return None,
                Err(e) => self.record_failure(HookPoint::MessagePublish, &e),
            }
        }
        Some(message)
    }

    pub async fn session_subscribed(
        &self,
        client: &ClientInfo,
        filter: &str,
        options: &SubscriptionOptions,
    ) {
        for hook in self.chain(HookPoint::SessionSubscribed, None) {
            hook.on_session_subscribed(client, filter, options).await;
        }
    }

    pub async fn session_unsubscribed(&self, client: &ClientInfo, filter: &str) {
        for hook in self.chain(HookPoint::SessionUnsubscribed, None) {
            hook.on_session_unsubscribed(client, filter).await;
        }
    }

    pub async fn client_connected(&self, client: &ClientInfo) {
        for hook in self.chain(HookPoint::ClientConnected, None) {
            hook.on_client_connected(client).await;
        }
    }

    pub async fn client_disconnected(&self, client: &ClientInfo, reason: ReasonCode) {
        for hook in self.chain(HookPoint::ClientDisconnected, None) {
            hook.on_client_disconnected(client, reason).await;
        }
    }

    pub async fn message_delivered(&self, client_id: &str, message: &Message) {
        for hook in self.chain(HookPoint::MessageDelivered, Some(message.topic.as_ref())) {
            hook.on_message_delivered(client_id, message).await;
        }
    }
}
