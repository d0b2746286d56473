//! Cluster coordination
//!
//! Ties the membership view, the per-peer links and the route table
//! together: locally-originated route boundary events replicate to every
//! connected peer, inbound route echoes apply through the router workers
//! tagged with their origin, publishes forward at most once per destination
//! node, and a member leaving purges its routes within a couple of gossip
//! heartbeats.

mod membership;
mod peer;
pub mod protocol;

pub use membership::{GossipMembership, Membership, MembershipEvent};
pub use peer::{NodePeer, PeerStatus};
pub use protocol::{NodeMessage, NODE_PROTOCOL_VERSION};

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::Message;
use crate::config::ClusterConfig;
use crate::metrics::BrokerStats;
use crate::router::{Destination, NodeId, RouteError, RouteOrigin, RouteTable, RouterWorkers};
use crate::router::RouteEvent;

/// A decoded frame with the peer it came from
pub type InboundFrame = (NodeId, NodeMessage);

/// A publish received from a peer node, handed to the broker for local
/// fanout only (never re-forwarded)
#[derive(Debug, Clone)]
pub struct RemotePublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub sys: bool,
    pub from_client: String,
    pub origin_node: String,
}

/// Callback delivering remote publishes into the local fanout path
pub type LocalFanout = Arc<dyn Fn(RemotePublish) + Send + Sync>;

/// Cluster failure taxonomy
#[derive(Debug)]
pub enum ClusterError {
    Gossip(String),
    Io(std::io::Error),
    Protocol(String),
    Handshake(String),
    /// Peer link down or its queue full
    PeerUnavailable(String),
    Route(RouteError),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Gossip(msg) => write!(f, "gossip error: {}", msg),
            ClusterError::Io(e) => write!(f, "io error: {}", e),
            ClusterError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClusterError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            ClusterError::PeerUnavailable(node) => write!(f, "peer '{}' unavailable", node),
            ClusterError::Route(e) => write!(f, "route error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e)
    }
}

impl From<RouteError> for ClusterError {
    fn from(e: RouteError) -> Self {
        ClusterError::Route(e)
    }
}

/// Coordinates peers, route replication and publish forwarding
pub struct ClusterManager {
    node_id: NodeId,
    peers: Arc<DashMap<NodeId, Arc<NodePeer>>>,
    stats: Arc<BrokerStats>,
}

impl ClusterManager {
    /// Start the cluster plane
    ///
    /// Spawns the peer listener, the membership watcher, the route event
    /// replicator and the inbound frame handler.
    pub async fn spawn(
        config: &ClusterConfig,
        membership: Arc<dyn Membership>,
        workers: Arc<RouterWorkers>,
        table: Arc<RouteTable>,
        local_fanout: LocalFanout,
        stats: Arc<BrokerStats>,
    ) -> Result<Arc<Self>, ClusterError> {
        let node_id: NodeId = Arc::from(membership.node_id());
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(4_096);

        let manager = Arc::new(Self {
            node_id: node_id.clone(),
            peers: Arc::new(DashMap::new()),
            stats,
        });

        // Inbound peer connections
        let listener = TcpListener::bind(config.peer_addr).await?;
        info!("cluster peer listener on {}", config.peer_addr);
        tokio::spawn(Self::listener_loop(
            listener,
            node_id.to_string(),
            table.clone(),
            inbound_tx.clone(),
        ));

        // Membership events -> peer lifecycle + route purge
        tokio::spawn(Self::membership_loop(
            manager.clone(),
            membership.clone(),
            table.clone(),
            workers.clone(),
            inbound_tx,
        ));

        // Local route boundaries -> replicate to peers
        tokio::spawn(Self::replication_loop(
            manager.clone(),
            workers.subscribe_events(),
        ));

        // Inbound frames -> route echoes and local fanout
        tokio::spawn(Self::inbound_loop(
            manager.clone(),
            inbound_rx,
            workers,
            table,
            local_fanout,
        ));

        Ok(manager)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    /// Forward a message once to each destination node
    pub fn forward(&self, nodes: &[NodeId], message: &Message) {
        for node in nodes {
            if *node == self.node_id {
                continue;
            }
            let Some(peer) = self.peers.get(node) else {
                debug!("no link to node '{}', dropping forward", node);
                continue;
            };
            let frame = NodeMessage::Publish {
                topic: message.topic.to_string(),
                payload: message.payload.to_vec(),
                qos: message.qos as u8,
                retain: message.flags.retain,
                sys: message.flags.sys,
                from_client: message.from.to_string(),
                origin_node: self.node_id.to_string(),
            };
            match peer.send(frame) {
                Ok(()) => BrokerStats::incr(&self.stats.messages_forwarded),
                Err(e) => warn!("forward to '{}' failed: {}", node, e),
            }
        }
    }

    /// The local node's route state for anti-entropy sync
    fn route_state(table: &RouteTable, local_node: &str) -> Vec<(String, Option<String>)> {
        table
            .snapshot()
            .into_iter()
            .filter(|route| route.destination.node.as_ref() == local_node)
            .map(|route| {
                (
                    route.filter.to_string(),
                    route.destination.share_group.map(|g| g.to_string()),
                )
            })
            .collect()
    }

    async fn listener_loop(
        listener: TcpListener,
        local_node_id: String,
        table: Arc<RouteTable>,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("incoming cluster connection from {}", addr);
                    let local_node_id = local_node_id.clone();
                    let table = table.clone();
                    let inbound_tx = inbound_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_incoming(stream, local_node_id, table, inbound_tx).await
                        {
                            debug!("incoming cluster connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("cluster accept failed: {}", e),
            }
        }
    }

    async fn handle_incoming(
        stream: TcpStream,
        local_node_id: String,
        table: Arc<RouteTable>,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) -> Result<(), ClusterError> {
        use protocol::frame_message;

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; 64 * 1024];
        let mut filled = 0usize;

        let hello = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            peer::read_frame(&mut reader, &mut buf, &mut filled),
        )
        .await
        .map_err(|_| ClusterError::Handshake("timed out".to_string()))??;

        let peer_node_id: NodeId = match hello {
            NodeMessage::Hello { node_id, version } => {
                if version != NODE_PROTOCOL_VERSION {
                    return Err(ClusterError::Handshake(format!(
                        "protocol version mismatch: {} vs {}",
                        version, NODE_PROTOCOL_VERSION
                    )));
                }
                Arc::from(node_id.as_str())
            }
            other => {
                return Err(ClusterError::Handshake(format!(
                    "expected Hello, got {}",
                    other.type_name()
                )))
            }
        };
        info!("incoming cluster peer: {}", peer_node_id);

        let ack = NodeMessage::HelloAck {
            node_id: local_node_id.clone(),
            version: NODE_PROTOCOL_VERSION,
        };
        writer
            .write_all(&frame_message(&ack).map_err(|e| ClusterError::Protocol(e.to_string()))?)
            .await?;

        let sync = NodeMessage::RouteSync {
            routes: Self::route_state(&table, &local_node_id),
        };
        writer
            .write_all(&frame_message(&sync).map_err(|e| ClusterError::Protocol(e.to_string()))?)
            .await?;

        loop {
            match peer::read_frame(&mut reader, &mut buf, &mut filled).await? {
                NodeMessage::Ping => {
                    let pong = frame_message(&NodeMessage::Pong)
                        .map_err(|e| ClusterError::Protocol(e.to_string()))?;
                    writer.write_all(&pong).await?;
                }
                NodeMessage::Pong => {}
                NodeMessage::Goodbye => {
                    info!("cluster peer '{}' said goodbye", peer_node_id);
                    return Ok(());
                }
                message => {
                    if inbound_tx.send((peer_node_id.clone(), message)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn membership_loop(
        manager: Arc<Self>,
        membership: Arc<dyn Membership>,
        table: Arc<RouteTable>,
        workers: Arc<RouterWorkers>,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) {
        let mut events = membership.watch();
        let local_node_id = manager.node_id.to_string();

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("membership watcher lagged by {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match event {
                MembershipEvent::Joined { node, peer_addr } => {
                    if manager.peers.contains_key(&node) {
                        continue;
                    }
                    info!("cluster member '{}' joined at {}", node, peer_addr);
                    let table = table.clone();
                    let local = local_node_id.clone();
                    let route_state: Arc<
                        dyn Fn() -> Vec<(String, Option<String>)> + Send + Sync,
                    > = Arc::new(move || Self::route_state(&table, &local));
                    let peer = NodePeer::spawn(
                        node.clone(),
                        peer_addr,
                        local_node_id.clone(),
                        route_state,
                        inbound_tx.clone(),
                    );
                    manager.peers.insert(node, peer);
                }
                MembershipEvent::Left { node } => {
                    info!("cluster member '{}' left", node);
                    if let Some((_, peer)) = manager.peers.remove(&node) {
                        peer.stop();
                    }
                    match workers.purge_node(node.clone()).await {
                        Ok(removed) => {
                            for _ in &removed {
                                BrokerStats::incr(&manager.stats.routes_deleted);
                            }
                            if !removed.is_empty() {
                                info!(
                                    "purged {} routes for departed node '{}'",
                                    removed.len(),
                                    node
                                );
                            }
                        }
                        Err(e) => error!("route purge for '{}' failed: {}", node, e),
                    }
                }
            }
        }
    }

    async fn replication_loop(
        manager: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<RouteEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("route replicator lagged by {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let message = match &event {
                RouteEvent::Added(route) => NodeMessage::RouteAdd {
                    filter: route.filter.to_string(),
                    share_group: route.destination.share_group.as_ref().map(|g| g.to_string()),
                },
                RouteEvent::Removed(route) => NodeMessage::RouteDelete {
                    filter: route.filter.to_string(),
                    share_group: route.destination.share_group.as_ref().map(|g| g.to_string()),
                },
            };

            for peer in manager.peers.iter() {
                if let Err(e) = peer.value().send(message.clone()) {
                    debug!("route replication to '{}' skipped: {}", peer.key(), e);
                }
            }
        }
    }

    async fn inbound_loop(
        manager: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundFrame>,
        workers: Arc<RouterWorkers>,
        table: Arc<RouteTable>,
        local_fanout: LocalFanout,
    ) {
        while let Some((peer_node, message)) = inbound_rx.recv().await {
            match message {
                NodeMessage::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                    sys,
                    from_client,
                    origin_node,
                } => {
                    // Defense against forwarding loops
                    if origin_node == manager.node_id.as_ref() {
                        continue;
                    }
                    local_fanout(RemotePublish {
                        topic,
                        payload,
                        qos,
                        retain,
                        sys,
                        from_client,
                        origin_node,
                    });
                }
                NodeMessage::RouteAdd {
                    filter,
                    share_group,
                } => {
                    let destination = match share_group {
                        Some(group) => {
                            Destination::shared(peer_node.clone(), Arc::from(group.as_str()))
                        }
                        None => Destination::node(peer_node.clone()),
                    };
                    if let Err(e) = workers
                        .add_route(Arc::from(filter.as_str()), destination, RouteOrigin::Remote)
                        .await
                    {
                        warn!("remote route add for '{}' failed: {}", filter, e);
                    }
                }
                NodeMessage::RouteDelete {
                    filter,
                    share_group,
                } => {
                    let destination = match share_group {
                        Some(group) => {
                            Destination::shared(peer_node.clone(), Arc::from(group.as_str()))
                        }
                        None => Destination::node(peer_node.clone()),
                    };
                    if let Err(e) = workers
                        .delete_route(Arc::from(filter.as_str()), destination, RouteOrigin::Remote)
                        .await
                    {
                        warn!("remote route delete for '{}' failed: {}", filter, e);
                    }
                }
                NodeMessage::RouteSync { routes } => {
                    Self::reconcile_routes(&workers, &table, &peer_node, routes).await;
                }
                other => {
                    debug!(
                        "unexpected {} from '{}' on inbound path",
                        other.type_name(),
                        peer_node
                    );
                }
            }
        }
    }

    /// Replace this node's view of a peer's routes with the synced set
    async fn reconcile_routes(
        workers: &RouterWorkers,
        table: &RouteTable,
        peer_node: &NodeId,
        routes: Vec<(String, Option<String>)>,
    ) {
        let wanted: Vec<(Arc<str>, Option<Arc<str>>)> = routes
            .into_iter()
            .map(|(filter, group)| {
                (
                    Arc::from(filter.as_str()),
                    group.map(|g| Arc::from(g.as_str())),
                )
            })
            .collect();

        // Drop stale records the peer no longer advertises, and remember
        // what is already present so re-syncs stay idempotent
        let mut present: Vec<(Arc<str>, Option<Arc<str>>)> = Vec::new();
        for route in table.snapshot() {
            if route.destination.node != *peer_node {
                continue;
            }
            let still_wanted = wanted.iter().any(|(filter, group)| {
                *filter == route.filter && *group == route.destination.share_group
            });
            if still_wanted {
                present.push((route.filter.clone(), route.destination.share_group.clone()));
            } else {
                let _ = workers
                    .delete_route(
                        route.filter.clone(),
                        route.destination.clone(),
                        RouteOrigin::Remote,
                    )
                    .await;
            }
        }

        for (filter, group) in wanted {
            if present.iter().any(|(f, g)| *f == filter && *g == group) {
                continue;
            }
            let destination = match group {
                Some(group) => Destination::shared(peer_node.clone(), group),
                None => Destination::node(peer_node.clone()),
            };
            if let Err(e) = workers
                .add_route(filter.clone(), destination, RouteOrigin::Remote)
                .await
            {
                warn!("route sync add for '{}' failed: {}", filter, e);
            }
        }
    }

    /// Stop all peer links
    pub fn stop(&self) {
        for peer in self.peers.iter() {
            peer.value().stop();
        }
    }
}
