//! Outbound peer link
//!
//! One framed TCP connection per remote node, owned by a background task:
//! connect, handshake, push the local route state, then pump the outbound
//! queue while reading inbound frames. Connection loss reconnects with
//! exponential backoff; the queue sheds when the peer is unreachable so a
//! dead node cannot stall dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{frame_message, read_frame_length, NodeMessage, NODE_PROTOCOL_VERSION};
use super::{ClusterError, InboundFrame};
use crate::router::NodeId;

const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Link health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    Connecting = 0,
    Connected = 1,
    Stopped = 2,
}

/// Handle to one remote node's link
pub struct NodePeer {
    node_id: NodeId,
    addr: SocketAddr,
    status: AtomicU8,
    outbound: mpsc::Sender<NodeMessage>,
}

impl NodePeer {
    /// Spawn the link task
    ///
    /// `route_state` supplies the RouteSync payload sent after each
    /// successful handshake; `inbound` receives every decoded frame.
    pub fn spawn(
        node_id: NodeId,
        addr: SocketAddr,
        local_node_id: String,
        route_state: Arc<dyn Fn() -> Vec<(String, Option<String>)> + Send + Sync>,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(1_024);
        let peer = Arc::new(Self {
            node_id,
            addr,
            status: AtomicU8::new(PeerStatus::Connecting as u8),
            outbound: outbound_tx,
        });

        tokio::spawn(Self::link_loop(
            peer.clone(),
            local_node_id,
            route_state,
            inbound,
            outbound_rx,
        ));

        peer
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn status(&self) -> PeerStatus {
        match self.status.load(Ordering::Acquire) {
            0 => PeerStatus::Connecting,
            1 => PeerStatus::Connected,
            _ => PeerStatus::Stopped,
        }
    }

    fn set_status(&self, status: PeerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Queue a message for the peer; sheds when the link is down or slow
    pub fn send(&self, message: NodeMessage) -> Result<(), ClusterError> {
        self.outbound
            .try_send(message)
            .map_err(|_| ClusterError::PeerUnavailable(self.node_id.to_string()))
    }

    /// Stop the link after a best-effort Goodbye
    pub fn stop(&self) {
        let _ = self.outbound.try_send(NodeMessage::Goodbye);
        self.set_status(PeerStatus::Stopped);
    }

    async fn link_loop(
        peer: Arc<Self>,
        local_node_id: String,
        route_state: Arc<dyn Fn() -> Vec<(String, Option<String>)> + Send + Sync>,
        inbound: mpsc::Sender<InboundFrame>,
        mut outbound_rx: mpsc::Receiver<NodeMessage>,
    ) {
        let mut backoff = RECONNECT_MIN;

        loop {
            if peer.status() == PeerStatus::Stopped {
                return;
            }
            peer.set_status(PeerStatus::Connecting);

            let stream = match TcpStream::connect(peer.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("connect to peer '{}' failed: {}", peer.node_id, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            };

            match Self::run_connection(
                &peer,
                stream,
                &local_node_id,
                &route_state,
                &inbound,
                &mut outbound_rx,
            )
            .await
            {
                Ok(()) => return,
                Err(e) => {
                    if peer.status() == PeerStatus::Stopped {
                        return;
                    }
                    warn!("peer '{}' link lost: {}", peer.node_id, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    async fn run_connection(
        peer: &Arc<Self>,
        stream: TcpStream,
        local_node_id: &str,
        route_state: &Arc<dyn Fn() -> Vec<(String, Option<String>)> + Send + Sync>,
        inbound: &mpsc::Sender<InboundFrame>,
        outbound_rx: &mut mpsc::Receiver<NodeMessage>,
    ) -> Result<(), ClusterError> {
        let (mut reader, mut writer) = stream.into_split();

        // Handshake
        let hello = NodeMessage::Hello {
            node_id: local_node_id.to_string(),
            version: NODE_PROTOCOL_VERSION,
        };
        writer
            .write_all(&frame_message(&hello).map_err(|e| ClusterError::Protocol(e.to_string()))?)
            .await?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut filled = 0usize;
        let ack = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_frame(&mut reader, &mut buf, &mut filled),
        )
        .await
        .map_err(|_| ClusterError::Handshake("timed out".to_string()))??;

        match ack {
            NodeMessage::HelloAck { node_id, version } => {
                if version != NODE_PROTOCOL_VERSION {
                    return Err(ClusterError::Handshake(format!(
                        "protocol version mismatch: {} vs {}",
                        version, NODE_PROTOCOL_VERSION
                    )));
                }
                if node_id != peer.node_id.as_ref() {
                    return Err(ClusterError::Handshake(format!(
                        "expected node '{}', got '{}'",
                        peer.node_id, node_id
                    )));
                }
            }
            other => {
                return Err(ClusterError::Handshake(format!(
                    "expected HelloAck, got {}",
                    other.type_name()
                )))
            }
        }

        // Anti-entropy: push the full local route state
        let sync = NodeMessage::RouteSync {
            routes: route_state(),
        };
        writer
            .write_all(&frame_message(&sync).map_err(|e| ClusterError::Protocol(e.to_string()))?)
            .await?;

        peer.set_status(PeerStatus::Connected);
        info!("cluster peer '{}' connected at {}", peer.node_id, peer.addr);

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else {
                        return Ok(());
                    };
                    let stopping = matches!(message, NodeMessage::Goodbye);
                    let frame = frame_message(&message)
                        .map_err(|e| ClusterError::Protocol(e.to_string()))?;
                    writer.write_all(&frame).await?;
                    if stopping {
                        return Ok(());
                    }
                }
                frame = read_frame(&mut reader, &mut buf, &mut filled) => {
                    match frame? {
                        NodeMessage::Ping => {
                            let pong = frame_message(&NodeMessage::Pong)
                                .map_err(|e| ClusterError::Protocol(e.to_string()))?;
                            writer.write_all(&pong).await?;
                        }
                        NodeMessage::Pong => {}
                        NodeMessage::Goodbye => {
                            info!("cluster peer '{}' said goodbye", peer.node_id);
                            return Ok(());
                        }
                        message => {
                            let _ = inbound
                                .send((peer.node_id.clone(), message))
                                .await;
                        }
                    }
                }
                _ = ping.tick() => {
                    let frame = frame_message(&NodeMessage::Ping)
                        .map_err(|e| ClusterError::Protocol(e.to_string()))?;
                    writer.write_all(&frame).await?;
                }
            }
        }
    }

}

/// Read one length-prefixed frame, buffering partial reads
pub(crate) async fn read_frame(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut Vec<u8>,
    filled: &mut usize,
) -> Result<NodeMessage, ClusterError> {
    loop {
        if let Some(len) = read_frame_length(&buf[..*filled]) {
            let total = 4 + len as usize;
            if total > buf.len() {
                buf.resize(total, 0);
            }
            if *filled >= total {
                let message = NodeMessage::decode(&buf[4..total])
                    .map_err(|e| ClusterError::Protocol(e.to_string()))?;
                buf.copy_within(total..*filled, 0);
                *filled -= total;
                return Ok(message);
            }
        }

        let n = reader.read(&mut buf[*filled..]).await?;
        if n == 0 {
            return Err(ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed",
            )));
        }
        *filled += n;
    }
}
