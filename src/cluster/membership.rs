//! Cluster membership over gossip
//!
//! Thin contract over the membership collaborator: a monotonic view of the
//! member set within a node plus at-least-once joined/left events. The
//! production implementation rides chitchat's phi-accrual failure detector;
//! each node advertises the TCP address peers should forward messages to in
//! its gossip state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ClusterError;
use crate::config::ClusterConfig;
use crate::router::NodeId;

/// Gossip state key carrying the peer forwarding address
const KEY_PEER_ADDR: &str = "peer_addr";

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined { node: NodeId, peer_addr: SocketAddr },
    Left { node: NodeId },
}

/// Cluster membership contract presented to the core
#[async_trait]
pub trait Membership: Send + Sync {
    /// This node's stable identifier
    fn node_id(&self) -> &str;

    /// Current members other than this node, with their peer addresses
    async fn members(&self) -> Vec<(NodeId, SocketAddr)>;

    /// Subscribe to joined/left events (at-least-once delivery)
    fn watch(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// chitchat-backed membership
pub struct GossipMembership {
    node_id: String,
    handle: ChitchatHandle,
    events: broadcast::Sender<MembershipEvent>,
}

impl GossipMembership {
    /// Join the gossip cluster and start watching for changes
    pub async fn spawn(config: &ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        let node_id = config.resolved_node_id();

        info!(
            "joining cluster as '{}' (gossip={}, peer={})",
            node_id, config.gossip_addr, config.peer_addr
        );

        let chitchat_id = ChitchatId::new(node_id.clone(), 0, config.gossip_addr);
        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval(),
            ..Default::default()
        };
        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "meshmq".to_string(),
            gossip_interval: config.gossip_interval(),
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period(),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![(KEY_PEER_ADDR.to_string(), config.peer_addr.to_string())];
        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| ClusterError::Gossip(e.to_string()))?;

        let (events, _) = broadcast::channel(256);
        let membership = Arc::new(Self {
            node_id,
            handle,
            events,
        });

        tokio::spawn(Self::watcher_loop(
            membership.clone(),
            config.gossip_interval(),
        ));

        Ok(membership)
    }

    fn snapshot_members(
        chitchat: &chitchat::Chitchat,
        local_node_id: &str,
    ) -> HashMap<NodeId, SocketAddr> {
        let mut members = HashMap::new();
        let snapshot = chitchat.state_snapshot();
        for node_state in &snapshot.node_states {
            let id = node_state.chitchat_id().node_id.clone();
            if id == local_node_id {
                continue;
            }
            let Some(addr) = node_state
                .get(KEY_PEER_ADDR)
                .and_then(|s| s.parse::<SocketAddr>().ok())
            else {
                continue;
            };
            members.insert(Arc::from(id.as_str()), addr);
        }
        members
    }

    /// Diff membership snapshots each gossip interval and emit events
    async fn watcher_loop(membership: Arc<Self>, interval: std::time::Duration) {
        let mut known: HashMap<NodeId, SocketAddr> = HashMap::new();
        let chitchat = membership.handle.chitchat();

        loop {
            tokio::time::sleep(interval).await;

            let current = {
                let cc = chitchat.lock().await;
                Self::snapshot_members(&cc, &membership.node_id)
            };

            for (node, addr) in &current {
                if !known.contains_key(node) {
                    debug!("cluster member joined: {} at {}", node, addr);
                    let _ = membership.events.send(MembershipEvent::Joined {
                        node: node.clone(),
                        peer_addr: *addr,
                    });
                }
            }
            for node in known.keys() {
                if !current.contains_key(node) {
                    debug!("cluster member left: {}", node);
                    let _ = membership
                        .events
                        .send(MembershipEvent::Left { node: node.clone() });
                }
            }

            known = current;
        }
    }
}

#[async_trait]
impl Membership for GossipMembership {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn members(&self) -> Vec<(NodeId, SocketAddr)> {
        let chitchat = self.handle.chitchat();
        let cc = chitchat.lock().await;
        Self::snapshot_members(&cc, &self.node_id)
            .into_iter()
            .collect()
    }

    fn watch(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
