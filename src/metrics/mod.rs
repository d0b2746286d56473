//! Broker statistics
//!
//! Plain relaxed atomic counters bumped on the hot paths. Telemetry sinks
//! are external collaborators; they read a `snapshot()` through the admin
//! surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Core counters, shared via `Arc`
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// Publishes accepted from clients
    pub messages_received: AtomicU64,
    /// Deliveries enqueued to sessions
    pub messages_sent: AtomicU64,
    /// Deliveries dropped (queue overflow, no quota, expired)
    pub messages_dropped: AtomicU64,
    /// Publishes forwarded to other cluster nodes
    pub messages_forwarded: AtomicU64,
    /// Session queue overflows (any policy)
    pub queue_overflows: AtomicU64,
    /// Sessions displaced by a new connection with the same client id
    pub session_takeovers: AtomicU64,
    /// Cluster routes added / deleted by this node
    pub routes_added: AtomicU64,
    pub routes_deleted: AtomicU64,
    /// ACL cache effectiveness
    pub acl_cache_hits: AtomicU64,
    pub acl_cache_misses: AtomicU64,
    /// Hook callbacks that returned an error and were isolated
    pub hook_failures: AtomicU64,
    /// Inflight messages retransmitted
    pub retransmissions: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_forwarded: u64,
    pub queue_overflows: u64,
    pub session_takeovers: u64,
    pub routes_added: u64,
    pub routes_deleted: u64,
    pub acl_cache_hits: u64,
    pub acl_cache_misses: u64,
    pub hook_failures: u64,
    pub retransmissions: u64,
}

impl BrokerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            session_takeovers: self.session_takeovers.load(Ordering::Relaxed),
            routes_added: self.routes_added.load(Ordering::Relaxed),
            routes_deleted: self.routes_deleted.load(Ordering::Relaxed),
            acl_cache_hits: self.acl_cache_hits.load(Ordering::Relaxed),
            acl_cache_misses: self.acl_cache_misses.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = BrokerStats::new();
        BrokerStats::incr(&stats.messages_received);
        BrokerStats::incr(&stats.messages_received);
        BrokerStats::incr(&stats.queue_overflows);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.queue_overflows, 1);
        assert_eq!(snap.messages_sent, 0);
    }
}
