//! Cluster route table
//!
//! A RAM-resident replicated bag of `(filter, destination)` records
//! answering "which nodes have subscribers for this topic". Exact filters
//! live in a sharded map; wildcard filters are additionally indexed by a
//! counted trie so topic matching stays sub-linear. The table is rebuilt
//! from live sessions at startup and synchronized between nodes by the
//! cluster layer.
//!
//! All mutation goes through the hash-partitioned [`RouterWorkers`]
//! (`worker.rs`), which serialize changes per filter and scope the trie's
//! critical section according to the configured [`LockMode`].

mod worker;

pub use worker::{RouteError, RouteOrigin, RouterWorkers};

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::config::LockMode;
use crate::topic::{is_wildcard, TopicTrie};

/// Cluster node identifier
pub type NodeId = Arc<str>;

/// Where a route points: a node, optionally narrowed to a share group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub node: NodeId,
    pub share_group: Option<Arc<str>>,
}

impl Destination {
    pub fn node(node: NodeId) -> Self {
        Self {
            node,
            share_group: None,
        }
    }

    pub fn shared(node: NodeId, group: Arc<str>) -> Self {
        Self {
            node,
            share_group: Some(group),
        }
    }
}

/// One replicated route record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub filter: Arc<str>,
    pub destination: Destination,
}

/// Emitted by the workers on 0<->1 boundary transitions of locally-owned
/// routes; the cluster layer replicates these to peers
#[derive(Debug, Clone)]
pub enum RouteEvent {
    Added(Route),
    Removed(Route),
}

#[derive(Debug)]
struct RouteEntry {
    destination: Destination,
    /// Reference count; the record exists while count > 0
    count: u32,
}

/// The route table proper
///
/// Reads are concurrent; mutation is only correct under the router-worker
/// discipline (one worker per filter shard, lock mode applied around the
/// wildcard index).
pub struct RouteTable {
    entries: DashMap<Arc<str>, SmallVec<[RouteEntry; 2]>>,
    wildcards: RwLock<TopicTrie<Arc<str>>>,
    /// Taken around whole mutations in `tab` mode
    table_lock: Mutex<()>,
    lock_mode: LockMode,
}

impl RouteTable {
    pub fn new(lock_mode: LockMode) -> Self {
        Self {
            entries: DashMap::new(),
            wildcards: RwLock::new(TopicTrie::new()),
            table_lock: Mutex::new(()),
            lock_mode,
        }
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Distinct filters with at least one route
    pub fn filter_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add one reference to `(filter, destination)`; true on the 0->1
    /// boundary
    pub(crate) fn apply_add(&self, filter: &Arc<str>, destination: &Destination) -> bool {
        let _tab = (self.lock_mode == LockMode::Tab).then(|| self.table_lock.lock());

        let mut subs = self.entries.entry(filter.clone()).or_default();
        if let Some(entry) = subs.iter_mut().find(|e| e.destination == *destination) {
            entry.count += 1;
            return false;
        }
        subs.push(RouteEntry {
            destination: destination.clone(),
            count: 1,
        });
        let filter_is_new = subs.len() == 1;
        drop(subs);

        if filter_is_new && is_wildcard(filter) {
            self.wildcards.write().insert(filter, filter.clone());
        }
        true
    }

    /// Drop one reference from `(filter, destination)`; true on the 1->0
    /// boundary
    pub(crate) fn apply_remove(&self, filter: &Arc<str>, destination: &Destination) -> bool {
        let _tab = (self.lock_mode == LockMode::Tab).then(|| self.table_lock.lock());

        let Some(mut subs) = self.entries.get_mut(filter) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|e| e.destination == *destination) else {
            return false;
        };

        subs[pos].count -= 1;
        if subs[pos].count > 0 {
            return false;
        }
        subs.remove(pos);
        let filter_gone = subs.is_empty();
        drop(subs);

        if filter_gone {
            self.entries.remove(filter.as_ref());
            if is_wildcard(filter) {
                self.wildcards.write().remove(filter);
            }
        }
        true
    }

    /// Drop every route pointing at a node, returning what was removed
    pub(crate) fn apply_purge_node<F>(&self, node: &str, owns_filter: F) -> Vec<Route>
    where
        F: Fn(&str) -> bool,
    {
        let _tab = (self.lock_mode == LockMode::Tab).then(|| self.table_lock.lock());

        let mut removed = Vec::new();
        let mut emptied: Vec<Arc<str>> = Vec::new();

        for mut item in self.entries.iter_mut() {
            if !owns_filter(item.key()) {
                continue;
            }
            let filter = item.key().clone();
            item.value_mut().retain(|entry| {
                if entry.destination.node.as_ref() == node {
                    removed.push(Route {
                        filter: filter.clone(),
                        destination: entry.destination.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            if item.value().is_empty() {
                emptied.push(filter);
            }
        }

        for filter in emptied {
            self.entries.remove(filter.as_ref());
            if is_wildcard(&filter) {
                self.wildcards.write().remove(&filter);
            }
        }

        removed
    }

    /// Destinations registered for an exact filter
    pub fn lookup(&self, filter: &str) -> Vec<Destination> {
        self.entries
            .get(filter)
            .map(|subs| subs.iter().map(|e| e.destination.clone()).collect())
            .unwrap_or_default()
    }

    /// Every destination whose filter matches the topic
    pub fn match_topic(&self, topic: &str) -> Vec<Destination> {
        let mut out: Vec<Destination> = Vec::new();
        let mut push_filter = |filter: &str| {
            if let Some(subs) = self.entries.get(filter) {
                for entry in subs.iter() {
                    if !out.contains(&entry.destination) {
                        out.push(entry.destination.clone());
                    }
                }
            }
        };

        push_filter(topic);
        let wildcards = self.wildcards.read();
        wildcards.matches(topic, |filter| push_filter(filter));
        out
    }

    /// De-duplicated nodes with any subscriber for the topic
    pub fn match_nodes(&self, topic: &str) -> SmallVec<[NodeId; 4]> {
        let mut nodes: SmallVec<[NodeId; 4]> = SmallVec::new();
        for destination in self.match_topic(topic) {
            if !nodes.iter().any(|n| *n == destination.node) {
                nodes.push(destination.node);
            }
        }
        nodes
    }

    /// Every live route, for admin listing and anti-entropy sync
    pub fn snapshot(&self) -> Vec<Route> {
        self.entries
            .iter()
            .flat_map(|item| {
                let filter = item.key().clone();
                item.value()
                    .iter()
                    .map(|e| Route {
                        filter: filter.clone(),
                        destination: e.destination.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Filters routed to the given node
    pub fn filters_for_node(&self, node: &str) -> Vec<Arc<str>> {
        self.entries
            .iter()
            .filter(|item| {
                item.value()
                    .iter()
                    .any(|e| e.destination.node.as_ref() == node)
            })
            .map(|item| item.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Destination {
        Destination::node(Arc::from(name))
    }

    #[test]
    fn test_refcount_boundaries() {
        let table = RouteTable::new(LockMode::Key);
        let filter: Arc<str> = Arc::from("a/+");

        assert!(table.apply_add(&filter, &node("n1")));
        assert!(!table.apply_add(&filter, &node("n1")));
        assert!(table.apply_add(&filter, &node("n2")));

        assert!(!table.apply_remove(&filter, &node("n1")));
        assert!(table.apply_remove(&filter, &node("n1")));
        assert_eq!(table.lookup("a/+").len(), 1);

        assert!(table.apply_remove(&filter, &node("n2")));
        assert!(table.is_empty());
        // Wildcard index pruned with the last route
        assert!(table.match_nodes("a/b").is_empty());
    }

    #[test]
    fn test_match_topic_unions_exact_and_wildcard() {
        let table = RouteTable::new(LockMode::Key);
        table.apply_add(&Arc::from("a/b"), &node("n1"));
        table.apply_add(&Arc::from("a/#"), &node("n2"));
        table.apply_add(&Arc::from("+/b"), &node("n1"));

        let nodes = table.match_nodes("a/b");
        assert_eq!(nodes.len(), 2);
        assert_eq!(table.match_nodes("a/c").len(), 1);
        assert!(table.match_nodes("$SYS/x").is_empty());
    }

    #[test]
    fn test_shared_destinations_are_distinct() {
        let table = RouteTable::new(LockMode::Key);
        let filter: Arc<str> = Arc::from("jobs/#");
        let plain = node("n1");
        let shared = Destination::shared(Arc::from("n1"), Arc::from("g"));

        assert!(table.apply_add(&filter, &plain));
        assert!(table.apply_add(&filter, &shared));
        assert_eq!(table.lookup("jobs/#").len(), 2);
        // Both collapse to one node for forwarding
        assert_eq!(table.match_nodes("jobs/x").len(), 1);
    }

    #[test]
    fn test_purge_node() {
        let table = RouteTable::new(LockMode::Tab);
        table.apply_add(&Arc::from("a"), &node("n1"));
        table.apply_add(&Arc::from("a"), &node("n2"));
        table.apply_add(&Arc::from("b/#"), &node("n1"));

        let removed = table.apply_purge_node("n1", |_| true);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.filter_count(), 1);
        assert_eq!(table.lookup("a").len(), 1);
        assert!(table.match_nodes("b/x").is_empty());
    }

    #[test]
    fn test_filters_for_node() {
        let table = RouteTable::new(LockMode::Key);
        table.apply_add(&Arc::from("a"), &node("n1"));
        table.apply_add(&Arc::from("b"), &node("n2"));

        let filters = table.filters_for_node("n1");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].as_ref(), "a");
    }
}
