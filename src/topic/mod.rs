//! Topic matching and the local subscription index
//!
//! Two parallel structures keyed by filter back the index: a hash map from
//! filter to its local subscriber entries (exact delivery after a match),
//! and a trie holding exactly the wildcard filters. A concrete-topic lookup
//! unions the exact hash hit with the trie matches, so non-wildcard
//! workloads never pay for trie descent.
//!
//! Subscribe/unsubscribe report boundary transitions (first subscriber for
//! a filter arrived, last one left) so the broker can create and delete
//! cluster routes with reference-count semantics.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    is_wildcard, parse_shared_subscription, topic_matches_filter, validate_topic_filter,
    validate_topic_filter_bounded, validate_topic_name, validate_topic_name_bounded, FilterError,
};

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::SubscriptionOptions;

/// A local subscriber entry for one filter
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Owning session
    pub client_id: Arc<str>,
    pub options: SubscriptionOptions,
    /// v5 subscription identifier echoed on deliveries
    pub subscription_id: Option<u32>,
    /// Shared subscription group, if subscribed via $share/{group}/{filter}
    pub share_group: Option<Arc<str>>,
}

/// Result of adding a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// An identical subscription (same session, same group) was replaced
    pub replaced: bool,
    /// First local subscription for this (filter, share group); the caller
    /// owes the cluster a route
    pub first_for_route: bool,
}

/// Result of removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    /// A subscription actually existed and was removed
    pub removed: bool,
    /// Last local subscription for this (filter, share group); the caller
    /// owes the cluster a route delete
    pub last_for_route: bool,
}

/// A route that lost its final local subscriber during bulk removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedRoute {
    pub filter: Arc<str>,
    pub share_group: Option<Arc<str>>,
}

struct Inner {
    /// Every live filter, wildcard or not, with its subscriber entries
    filters: AHashMap<Arc<str>, SmallVec<[Subscription; 4]>>,
    /// Wildcard filters only; values are the hash-map keys
    wildcards: TopicTrie<Arc<str>>,
}

impl Inner {
    fn route_count(&self, filter: &str, group: Option<&str>) -> usize {
        self.filters
            .get(filter)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.share_group.as_deref() == group)
                    .count()
            })
            .unwrap_or(0)
    }

    fn drop_filter_if_empty(&mut self, filter: &str) {
        let empty = self.filters.get(filter).is_some_and(|subs| subs.is_empty());
        if empty {
            self.filters.remove(filter);
            if is_wildcard(filter) {
                self.wildcards.remove(filter);
            }
        }
    }
}

/// Thread-safe local subscription index
pub struct SubscriptionStore {
    inner: RwLock<Inner>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                filters: AHashMap::new(),
                wildcards: TopicTrie::new(),
            }),
        }
    }

    /// Add a subscription
    ///
    /// `filter` may carry the $share/{group}/{filter} prefix; the group is
    /// recorded on the entry and the index is keyed by the bare filter.
    /// An existing subscription by the same session (and group) is replaced,
    /// per the MQTT re-subscribe rules.
    pub fn subscribe(&self, filter: &str, mut subscription: Subscription) -> SubscribeOutcome {
        let actual = match parse_shared_subscription(filter) {
            Some((group, actual)) => {
                subscription.share_group = Some(Arc::from(group));
                actual
            }
            None => filter,
        };
        let group = subscription.share_group.clone();

        let mut inner = self.inner.write();
        let first_for_route = inner.route_count(actual, group.as_deref()) == 0;

        if let Some(subs) = inner.filters.get_mut(actual) {
            let before = subs.len();
            subs.retain(|s| {
                !(s.client_id == subscription.client_id && s.share_group == subscription.share_group)
            });
            let replaced = subs.len() != before;
            subs.push(subscription);
            SubscribeOutcome {
                replaced,
                first_for_route,
            }
        } else {
            let key: Arc<str> = Arc::from(actual);
            inner
                .filters
                .insert(key.clone(), SmallVec::from_elem(subscription, 1));
            if is_wildcard(actual) {
                inner.wildcards.insert(actual, key);
            }
            SubscribeOutcome {
                replaced: false,
                first_for_route,
            }
        }
    }

    /// Remove one session's subscription to a filter
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> UnsubscribeOutcome {
        let (actual, group) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (actual, Some(group)),
            None => (filter, None),
        };

        let mut inner = self.inner.write();
        let Some(subs) = inner.filters.get_mut(actual) else {
            return UnsubscribeOutcome {
                removed: false,
                last_for_route: false,
            };
        };

        let before = subs.len();
        subs.retain(|s| {
            s.client_id.as_ref() != client_id || s.share_group.as_deref() != group
        });
        let removed = subs.len() != before;

        let last_for_route = removed && inner.route_count(actual, group) == 0;
        inner.drop_filter_if_empty(actual);

        UnsubscribeOutcome {
            removed,
            last_for_route,
        }
    }

    /// Remove every subscription held by a session, returning the routes
    /// that lost their last local subscriber
    pub fn unsubscribe_all(&self, client_id: &str) -> Vec<ReleasedRoute> {
        let mut inner = self.inner.write();
        let mut released = Vec::new();
        let mut emptied_filters: Vec<Arc<str>> = Vec::new();

        for (filter, subs) in inner.filters.iter_mut() {
            let mut dropped_groups: SmallVec<[Option<Arc<str>>; 2]> = SmallVec::new();
            subs.retain(|s| {
                if s.client_id.as_ref() == client_id {
                    if !dropped_groups.contains(&s.share_group) {
                        dropped_groups.push(s.share_group.clone());
                    }
                    false
                } else {
                    true
                }
            });
            for group in dropped_groups {
                let survivors = subs
                    .iter()
                    .filter(|s| s.share_group == group)
                    .count();
                if survivors == 0 {
                    released.push(ReleasedRoute {
                        filter: filter.clone(),
                        share_group: group,
                    });
                }
            }
            if subs.is_empty() {
                emptied_filters.push(filter.clone());
            }
        }

        for filter in emptied_filters {
            inner.filters.remove(filter.as_ref());
            if is_wildcard(&filter) {
                inner.wildcards.remove(&filter);
            }
        }

        released
    }

    /// All subscriber entries matching a concrete topic
    ///
    /// The union of the exact lookup and the wildcard trie matches. Entries
    /// are not de-duplicated by session; dispatch folds them.
    pub fn match_local(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let inner = self.inner.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();

        if let Some(subs) = inner.filters.get(topic) {
            result.extend(subs.iter().cloned());
        }
        inner.wildcards.matches(topic, |filter| {
            if let Some(subs) = inner.filters.get(filter.as_ref()) {
                result.extend(subs.iter().cloned());
            }
        });

        result
    }

    /// Number of distinct live filters
    pub fn filter_count(&self) -> usize {
        self.inner.read().filters.len()
    }

    /// Snapshot of every subscription, for admin inspection
    pub fn list(&self) -> Vec<(Arc<str>, Subscription)> {
        let inner = self.inner.read();
        inner
            .filters
            .iter()
            .flat_map(|(filter, subs)| subs.iter().map(|s| (filter.clone(), s.clone())))
            .collect()
    }

    /// Filters a given session is subscribed to
    pub fn filters_of(&self, client_id: &str) -> Vec<Arc<str>> {
        let inner = self.inner.read();
        inner
            .filters
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.client_id.as_ref() == client_id))
            .map(|(filter, _)| filter.clone())
            .collect()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn sub(client: &str) -> Subscription {
        Subscription {
            client_id: Arc::from(client),
            options: SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                ..Default::default()
            },
            subscription_id: None,
            share_group: None,
        }
    }

    #[test]
    fn test_subscribe_reports_route_boundaries() {
        let store = SubscriptionStore::new();

        let out = store.subscribe("room/+/temp", sub("a"));
        assert!(out.first_for_route);
        let out = store.subscribe("room/+/temp", sub("b"));
        assert!(!out.first_for_route);

        let out = store.unsubscribe("room/+/temp", "a");
        assert!(out.removed);
        assert!(!out.last_for_route);
        let out = store.unsubscribe("room/+/temp", "b");
        assert!(out.removed);
        assert!(out.last_for_route);
        assert_eq!(store.filter_count(), 0);
    }

    #[test]
    fn test_resubscribe_replaces() {
        let store = SubscriptionStore::new();
        store.subscribe("t", sub("a"));
        let out = store.subscribe("t", sub("a"));
        assert!(out.replaced);
        assert!(!out.first_for_route);
        assert_eq!(store.match_local("t").len(), 1);
    }

    #[test]
    fn test_match_unions_exact_and_wildcard() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("exact"));
        store.subscribe("a/+", sub("wild"));

        let matched = store.match_local("a/b");
        let mut clients: Vec<_> = matched.iter().map(|s| s.client_id.to_string()).collect();
        clients.sort();
        assert_eq!(clients, vec!["exact", "wild"]);
    }

    #[test]
    fn test_shared_subscription_routes_by_group() {
        let store = SubscriptionStore::new();

        let out = store.subscribe("$share/g1/jobs/#", sub("a"));
        assert!(out.first_for_route);
        // A plain subscription to the same filter is a distinct route
        let out = store.subscribe("jobs/#", sub("a"));
        assert!(out.first_for_route);
        // Second member of g1 is not
        let out = store.subscribe("$share/g1/jobs/#", sub("b"));
        assert!(!out.first_for_route);

        let matched = store.match_local("jobs/x");
        assert_eq!(matched.len(), 3);
        assert_eq!(
            matched.iter().filter(|s| s.share_group.is_some()).count(),
            2
        );

        let out = store.unsubscribe("$share/g1/jobs/#", "a");
        assert!(!out.last_for_route);
        let out = store.unsubscribe("$share/g1/jobs/#", "b");
        assert!(out.last_for_route);
        // Plain subscription still holds its route
        assert_eq!(store.filter_count(), 1);
    }

    #[test]
    fn test_unsubscribe_all_releases_routes() {
        let store = SubscriptionStore::new();
        store.subscribe("a/#", sub("a"));
        store.subscribe("b", sub("a"));
        store.subscribe("b", sub("c"));

        let mut released = store.unsubscribe_all("a");
        released.sort_by(|x, y| x.filter.cmp(&y.filter));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].filter.as_ref(), "a/#");

        // "b" still has a subscriber, so its route survives
        assert_eq!(store.filter_count(), 1);
        assert!(store.match_local("a/x").is_empty());
    }

    #[test]
    fn test_sys_topics_never_match_root_wildcards() {
        let store = SubscriptionStore::new();
        store.subscribe("#", sub("a"));
        assert!(store.match_local("$SYS/uptime").is_empty());
        assert_eq!(store.match_local("normal/topic").len(), 1);
    }
}
