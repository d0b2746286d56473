//! Router workers
//!
//! A fixed pool of tasks serializing route mutations: every command for a
//! filter hashes to the same worker, so concurrent add/delete of one filter
//! cannot lose updates, and the trie's critical section for a key is only
//! ever entered by its shard. Node purges fan out to every worker, each
//! cleaning the filters it owns.
//!
//! Every operation carries a deadline. A deadline miss, a full queue after
//! shutdown, or exhausting the advisory-lock retries surfaces as a
//! recoverable [`RouteError`], never a panic.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Destination, NodeId, Route, RouteEvent, RouteTable};
use crate::config::LockMode;
use crate::topic::is_wildcard;

/// Routing failure taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Deadline elapsed before the worker answered
    Timeout,
    /// Mutation kept conflicting on the advisory lock past the retry bound
    Unavailable,
    /// Worker pool is shut down
    Closed,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Timeout => write!(f, "route operation timed out"),
            RouteError::Unavailable => write!(f, "route unavailable after retries"),
            RouteError::Closed => write!(f, "router workers closed"),
        }
    }
}

impl std::error::Error for RouteError {}

/// Who asked for a mutation
///
/// Only locally-originated boundary transitions are published as
/// [`RouteEvent`]s; echoes applied on behalf of a peer are not replicated
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    Local,
    Remote,
}

#[derive(Debug)]
enum MutateOp {
    Add {
        filter: Arc<str>,
        destination: Destination,
    },
    Remove {
        filter: Arc<str>,
        destination: Destination,
    },
}

impl MutateOp {
    fn filter(&self) -> &Arc<str> {
        match self {
            MutateOp::Add { filter, .. } | MutateOp::Remove { filter, .. } => filter,
        }
    }
}

enum Command {
    Mutate {
        op: MutateOp,
        origin: RouteOrigin,
        reply: oneshot::Sender<Result<bool, RouteError>>,
    },
    PurgeNode {
        node: NodeId,
        reply: oneshot::Sender<Vec<Route>>,
    },
}

struct Worker {
    id: usize,
    pool_size: usize,
    table: Arc<RouteTable>,
    lock_mode: LockMode,
    global_lock: Arc<Mutex<()>>,
    hasher: ahash::RandomState,
    events: broadcast::Sender<RouteEvent>,
    max_retries: u32,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Mutate { op, origin, reply } => {
                    let result = self.apply(&op).await;
                    if let Ok(true) = result {
                        if origin == RouteOrigin::Local {
                            self.publish_event(&op);
                        }
                    }
                    let _ = reply.send(result);
                }
                Command::PurgeNode { node, reply } => {
                    let removed = self
                        .table
                        .apply_purge_node(&node, |filter| self.owns(filter));
                    if !removed.is_empty() {
                        debug!(
                            "worker {} purged {} routes for node '{}'",
                            self.id,
                            removed.len(),
                            node
                        );
                    }
                    let _ = reply.send(removed);
                }
            }
        }
        debug!("router worker {} exited", self.id);
    }

    fn owns(&self, filter: &str) -> bool {
        (self.hasher.hash_one(filter) as usize) % self.pool_size == self.id
    }

    /// Apply a mutation under the configured lock discipline
    ///
    /// `key` and `tab` scoping happen inside the table. `global` takes the
    /// cluster advisory lock around any wildcard change, with bounded
    /// exponential backoff; deletes take the same path as inserts.
    async fn apply(&self, op: &MutateOp) -> Result<bool, RouteError> {
        if self.lock_mode == LockMode::Global && is_wildcard(op.filter()) {
            let mut delay = Duration::from_millis(10);
            for attempt in 0..=self.max_retries {
                if let Some(_guard) = self.global_lock.try_lock() {
                    return Ok(self.apply_locked(op));
                }
                if attempt == self.max_retries {
                    break;
                }
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            warn!(
                "wildcard route change for '{}' gave up after {} retries",
                op.filter(),
                self.max_retries
            );
            return Err(RouteError::Unavailable);
        }
        Ok(self.apply_locked(op))
    }

    fn apply_locked(&self, op: &MutateOp) -> bool {
        match op {
            MutateOp::Add {
                filter,
                destination,
            } => self.table.apply_add(filter, destination),
            MutateOp::Remove {
                filter,
                destination,
            } => self.table.apply_remove(filter, destination),
        }
    }

    fn publish_event(&self, op: &MutateOp) {
        let event = match op {
            MutateOp::Add {
                filter,
                destination,
            } => RouteEvent::Added(Route {
                filter: filter.clone(),
                destination: destination.clone(),
            }),
            MutateOp::Remove {
                filter,
                destination,
            } => RouteEvent::Removed(Route {
                filter: filter.clone(),
                destination: destination.clone(),
            }),
        };
        let _ = self.events.send(event);
    }
}

/// Handle to the worker pool
pub struct RouterWorkers {
    senders: Vec<mpsc::Sender<Command>>,
    hasher: ahash::RandomState,
    op_timeout: Duration,
    events: broadcast::Sender<RouteEvent>,
}

impl RouterWorkers {
    /// Spawn `pool_size` workers over the table
    pub fn spawn(
        pool_size: usize,
        table: Arc<RouteTable>,
        lock_mode: LockMode,
        op_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let pool_size = pool_size.max(1);
        // Workers and the handle must agree on the filter -> shard mapping
        let hasher = ahash::RandomState::with_seeds(0x6d71, 0x7275, 0x6f74, 0x6573);
        let (events, _) = broadcast::channel(1_024);
        let global_lock = Arc::new(Mutex::new(()));

        let mut senders = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let (tx, rx) = mpsc::channel(1_024);
            senders.push(tx);
            let worker = Worker {
                id,
                pool_size,
                table: table.clone(),
                lock_mode,
                global_lock: global_lock.clone(),
                hasher: hasher.clone(),
                events: events.clone(),
                max_retries,
            };
            tokio::spawn(worker.run(rx));
        }

        Self {
            senders,
            hasher,
            op_timeout,
            events,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.senders.len()
    }

    /// Boundary transitions of locally-owned routes
    pub fn subscribe_events(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    fn shard(&self, filter: &str) -> usize {
        (self.hasher.hash_one(filter) as usize) % self.senders.len()
    }

    /// Add a route reference; resolves true on the 0->1 boundary
    pub async fn add_route(
        &self,
        filter: Arc<str>,
        destination: Destination,
        origin: RouteOrigin,
    ) -> Result<bool, RouteError> {
        self.mutate(
            MutateOp::Add {
                filter,
                destination,
            },
            origin,
        )
        .await
    }

    /// Drop a route reference; resolves true on the 1->0 boundary
    pub async fn delete_route(
        &self,
        filter: Arc<str>,
        destination: Destination,
        origin: RouteOrigin,
    ) -> Result<bool, RouteError> {
        self.mutate(
            MutateOp::Remove {
                filter,
                destination,
            },
            origin,
        )
        .await
    }

    async fn mutate(&self, op: MutateOp, origin: RouteOrigin) -> Result<bool, RouteError> {
        let shard = self.shard(op.filter());
        let (reply, rx) = oneshot::channel();
        let command = Command::Mutate { op, origin, reply };

        timeout(self.op_timeout, self.senders[shard].send(command))
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(|_| RouteError::Closed)?;
        timeout(self.op_timeout, rx)
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(|_| RouteError::Closed)?
    }

    /// Remove every route pointing at a dead node, across all shards
    pub async fn purge_node(&self, node: NodeId) -> Result<Vec<Route>, RouteError> {
        let mut receivers = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (reply, rx) = oneshot::channel();
            let command = Command::PurgeNode {
                node: node.clone(),
                reply,
            };
            timeout(self.op_timeout, sender.send(command))
                .await
                .map_err(|_| RouteError::Timeout)?
                .map_err(|_| RouteError::Closed)?;
            receivers.push(rx);
        }

        let mut removed = Vec::new();
        for rx in receivers {
            let part = timeout(self.op_timeout, rx)
                .await
                .map_err(|_| RouteError::Timeout)?
                .map_err(|_| RouteError::Closed)?;
            removed.extend(part);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Destination {
        Destination::node(Arc::from(name))
    }

    fn spawn_workers(lock_mode: LockMode) -> (RouterWorkers, Arc<RouteTable>) {
        let table = Arc::new(RouteTable::new(lock_mode));
        let workers = RouterWorkers::spawn(
            4,
            table.clone(),
            lock_mode,
            Duration::from_secs(1),
            3,
        );
        (workers, table)
    }

    #[tokio::test]
    async fn test_add_and_delete_route() {
        let (workers, table) = spawn_workers(LockMode::Key);

        let added = workers
            .add_route(Arc::from("a/+"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        assert!(added);
        assert_eq!(table.match_nodes("a/b").len(), 1);

        let removed = workers
            .delete_route(Arc::from("a/+"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        assert!(removed);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_serialized_adds_refcount() {
        let (workers, table) = spawn_workers(LockMode::Key);
        let filter: Arc<str> = Arc::from("x");

        // Concurrent add/delete of one filter lands on one worker, so no
        // interleaving can lose an update
        let mut handles = Vec::new();
        for _ in 0..8 {
            let filter = filter.clone();
            let add = workers.add_route(filter, node("n1"), RouteOrigin::Local);
            handles.push(add);
        }
        let boundaries: usize = futures_join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r == Ok(true))
            .count();
        assert_eq!(boundaries, 1);
        assert_eq!(table.lookup("x").len(), 1);

        for i in 0..8 {
            let removed = workers
                .delete_route(filter.clone(), node("n1"), RouteOrigin::Local)
                .await
                .unwrap();
            assert_eq!(removed, i == 7);
        }
        assert!(table.is_empty());
    }

    async fn futures_join_all<F, T>(futures: Vec<F>) -> Vec<T>
    where
        F: std::future::Future<Output = T>,
    {
        let mut out = Vec::with_capacity(futures.len());
        for f in futures {
            out.push(f.await);
        }
        out
    }

    #[tokio::test]
    async fn test_events_only_for_local_boundaries() {
        let (workers, _table) = spawn_workers(LockMode::Key);
        let mut events = workers.subscribe_events();

        workers
            .add_route(Arc::from("a"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        // Refcount bump, no boundary: no event
        workers
            .add_route(Arc::from("a"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        // Remote echo: boundary but not replicated
        workers
            .add_route(Arc::from("b"), node("n2"), RouteOrigin::Remote)
            .await
            .unwrap();
        workers
            .delete_route(Arc::from("b"), node("n2"), RouteOrigin::Remote)
            .await
            .unwrap();
        // Marker to prove nothing else was queued
        workers
            .add_route(Arc::from("z"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            RouteEvent::Added(route) => assert_eq!(route.filter.as_ref(), "a"),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            RouteEvent::Added(route) => assert_eq!(route.filter.as_ref(), "z"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_purge_node_across_shards() {
        let (workers, table) = spawn_workers(LockMode::Key);
        for i in 0..16 {
            let filter: Arc<str> = Arc::from(format!("t/{}", i).as_str());
            workers
                .add_route(filter.clone(), node("dead"), RouteOrigin::Remote)
                .await
                .unwrap();
            workers
                .add_route(filter, node("alive"), RouteOrigin::Remote)
                .await
                .unwrap();
        }

        let removed = workers.purge_node(Arc::from("dead")).await.unwrap();
        assert_eq!(removed.len(), 16);
        assert_eq!(table.filter_count(), 16);
        for route in table.snapshot() {
            assert_eq!(route.destination.node.as_ref(), "alive");
        }
    }

    #[tokio::test]
    async fn test_global_lock_mode_applies() {
        let (workers, table) = spawn_workers(LockMode::Global);
        let added = workers
            .add_route(Arc::from("w/#"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        assert!(added);
        let removed = workers
            .delete_route(Arc::from("w/#"), node("n1"), RouteOrigin::Local)
            .await
            .unwrap();
        assert!(removed);
        assert!(table.is_empty());
    }
}
