//! Broker core
//!
//! Owns the stores and drives the routing data flow: decoded packets come
//! in per session, publishes fan out through the dispatcher, subscription
//! changes reference-count cluster routes through the router workers.
//! Transports are external: `connect` hands back a channel the transport
//! drains, and every later packet arrives through `handle_packet`.

mod dispatch;
mod message;

pub use message::{Message, MessageFlags, MessageHeaders, MessageIdGen, SYS_ORIGIN};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::acl::{AclAction, AclCacheEpoch, AclDecision, AllowAll, AuthProvider, ClientInfo};
use crate::cluster::{ClusterError, ClusterManager, Membership, RemotePublish};
use crate::config::Config;
use crate::hooks::HookRegistry;
use crate::metrics::{BrokerStats, StatsSnapshot};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredSession};
use crate::protocol::{
    ConnAck, Connect, Disconnect, Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish,
    QoS, ReasonCode, SubAck, Subscribe, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};
use crate::retained::RetainedStore;
use crate::router::{
    Destination, NodeId, Route, RouteOrigin, RouteTable, RouterWorkers,
};
use crate::session::{
    Retransmit, Session, SessionLookup, SessionParams, SessionState, SessionStore,
};
use crate::topic::{
    is_wildcard, parse_shared_subscription, validate_topic_filter_bounded,
    validate_topic_name_bounded, ReleasedRoute, Subscription as LocalSubscription,
    SubscriptionStore,
};

use dispatch::Dispatcher;

/// What the transport gets back for an accepted connection
pub struct SessionLink {
    pub client_id: Arc<str>,
    /// Packets the transport must encode and write, in order
    pub outbound: mpsc::Receiver<Packet>,
}

/// A retained replay owed to a fresh subscription, run after its SUBACK
struct RetainedReplay {
    filter: String,
    options: SubscriptionOptions,
    subscription_id: Option<u32>,
}

/// Result of a CONNECT
pub enum ConnectOutcome {
    Accepted {
        connack: ConnAck,
        link: SessionLink,
    },
    /// CONNACK to send before closing the transport
    Rejected(ConnAck),
}

/// The broker core
pub struct Broker {
    config: Config,
    params: SessionParams,
    node_id: NodeId,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    route_table: Arc<RouteTable>,
    routers: Arc<RouterWorkers>,
    retained: Arc<RetainedStore>,
    hooks: Arc<HookRegistry>,
    auth: Arc<dyn AuthProvider>,
    acl_epoch: Arc<AclCacheEpoch>,
    connections: Arc<DashMap<Arc<str>, mpsc::Sender<Packet>>>,
    dispatcher: Arc<Dispatcher>,
    cluster: RwLock<Option<Arc<ClusterManager>>>,
    persistence: Option<Arc<PersistenceManager>>,
    stats: Arc<BrokerStats>,
    msg_ids: Arc<MessageIdGen>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Build a broker that accepts everyone (hooks can still deny)
    pub fn new(config: Config) -> Self {
        Self::with_auth(config, Arc::new(AllowAll))
    }

    /// Build a broker with a pluggable auth/ACL backend
    ///
    /// Must run inside a tokio runtime: the router worker pool spawns here.
    pub fn with_auth(config: Config, auth: Arc<dyn AuthProvider>) -> Self {
        let params = SessionParams::from(&config);
        let node_id: NodeId = Arc::from(config.cluster.resolved_node_id().as_str());
        let stats = Arc::new(BrokerStats::new());
        let sessions = Arc::new(SessionStore::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let route_table = Arc::new(RouteTable::new(config.routing.lock_mode));
        let routers = Arc::new(RouterWorkers::spawn(
            config.routing.effective_pool_size(),
            route_table.clone(),
            config.routing.lock_mode,
            config.routing.op_timeout(),
            config.routing.max_retries,
        ));
        let retained = Arc::new(RetainedStore::new());
        let hooks = Arc::new(HookRegistry::new(stats.clone()));
        let connections = Arc::new(DashMap::new());
        let msg_ids = Arc::new(MessageIdGen::new());
        let (shutdown, _) = broadcast::channel(1);

        let dispatcher = Arc::new(Dispatcher::new(
            node_id.clone(),
            subscriptions.clone(),
            sessions.clone(),
            connections.clone(),
            route_table.clone(),
            retained.clone(),
            hooks.clone(),
            stats.clone(),
            msg_ids.clone(),
            config.shared_subscription.policy,
        ));

        Self {
            config,
            params,
            node_id,
            sessions,
            subscriptions,
            route_table,
            routers,
            retained,
            hooks,
            auth,
            acl_epoch: Arc::new(AclCacheEpoch::new()),
            connections,
            dispatcher,
            cluster: RwLock::new(None),
            persistence: None,
            stats,
            msg_ids,
            shutdown,
        }
    }

    /// Attach durable storage and reload retained/session state
    pub async fn attach_persistence(
        &mut self,
        persistence: Arc<PersistenceManager>,
    ) -> Result<(), crate::persistence::PersistenceError> {
        let loaded = persistence.load_all().await?;
        info!(
            "persistence loaded: {} retained, {} sessions",
            loaded.retained.len(),
            loaded.sessions.len()
        );
        let retained = Arc::new(RetainedStore::durable(persistence.clone()));
        retained.load(loaded.retained);
        // Sessions reload lazily on reconnect; the retained store swap must
        // happen before any dispatch, so attach early in startup
        self.retained = retained.clone();
        self.dispatcher = Arc::new(Dispatcher::new(
            self.node_id.clone(),
            self.subscriptions.clone(),
            self.sessions.clone(),
            self.connections.clone(),
            self.route_table.clone(),
            retained,
            self.hooks.clone(),
            self.stats.clone(),
            self.msg_ids.clone(),
            self.config.shared_subscription.policy,
        ));
        self.persistence = Some(persistence);
        Ok(())
    }

    /// Join a cluster through the given membership view
    pub async fn enable_cluster(
        &self,
        membership: Arc<dyn Membership>,
    ) -> Result<(), ClusterError> {
        let dispatcher = self.dispatcher.clone();
        let fanout: crate::cluster::LocalFanout = Arc::new(move |remote: RemotePublish| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.dispatch_remote(remote).await;
            });
        });

        let manager = ClusterManager::spawn(
            &self.config.cluster,
            membership,
            self.routers.clone(),
            self.route_table.clone(),
            fanout,
            self.stats.clone(),
        )
        .await?;
        *self.cluster.write() = Some(manager);
        Ok(())
    }

    /// Spawn the maintenance loops (expiry, keepalive, retransmission)
    pub fn start(self: &Arc<Self>) {
        let broker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let sweep = self.config.session.expiry_check_interval_duration();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        broker.sweep_sessions().await;
                        broker.enforce_keepalive().await;
                    }
                }
            }
        });

        let broker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let retry = self.config.session.retry_interval_duration();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => broker.retransmit_inflight().await,
                }
            }
        });
    }

    /// Signal every background task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stop();
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    // ------------------------------------------------------------------
    // Connect / takeover
    // ------------------------------------------------------------------

    pub async fn connect(
        &self,
        mut connect: Connect,
        peer_addr: Option<SocketAddr>,
    ) -> ConnectOutcome {
        let version = connect.protocol_version;

        if connect.client_id.is_empty() {
            if !connect.clean_start {
                return ConnectOutcome::Rejected(ConnAck {
                    session_present: false,
                    reason_code: ReasonCode::ClientIdNotValid,
                    properties: Default::default(),
                });
            }
            connect.client_id = format!("meshmq-{}", uuid::Uuid::new_v4().simple());
        }
        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());

        let info = ClientInfo {
            client_id: client_id.clone(),
            username: connect.username.clone(),
            peer_addr,
            protocol_version: version,
        };

        if !self.hooks.client_connect(&info).await {
            return ConnectOutcome::Rejected(ConnAck {
                session_present: false,
                reason_code: ReasonCode::NotAuthorized,
                properties: Default::default(),
            });
        }

        let decision = match self
            .auth
            .authenticate(&info, connect.password.as_deref())
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("authentication backend failed for '{}': {}", client_id, e);
                return ConnectOutcome::Rejected(ConnAck {
                    session_present: false,
                    reason_code: ReasonCode::ServerUnavailable,
                    properties: Default::default(),
                });
            }
        };
        if !decision.is_allowed() {
            return ConnectOutcome::Rejected(ConnAck {
                session_present: false,
                reason_code: decision.reason_code(),
                properties: Default::default(),
            });
        }
        let decision = self
            .hooks
            .authenticate(&info, connect.password.as_deref())
            .await;
        if !decision.is_allowed() {
            return ConnectOutcome::Rejected(ConnAck {
                session_present: false,
                reason_code: decision.reason_code(),
                properties: Default::default(),
            });
        }

        // One connected session per client id: displace the prior owner
        if let Some((_, old_tx)) = self.connections.remove(&client_id) {
            BrokerStats::incr(&self.stats.session_takeovers);
            info!("session takeover for '{}'", client_id);
            let _ = old_tx.try_send(Packet::Disconnect(Disconnect {
                reason_code: ReasonCode::SessionTakenOver,
                properties: Default::default(),
            }));
            // The displaced connection ends non-gracefully, so its will fires
            if let Some(old_session) = self.sessions.get(&client_id) {
                self.publish_will_now(&client_id, &old_session).await;
            }
        }

        // A clean start discards any prior state, routes included
        if connect.clean_start {
            if self.sessions.get(&client_id).is_some() {
                let released = self.subscriptions.unsubscribe_all(&client_id);
                self.release_routes(released).await;
            }
            if let Some(persistence) = &self.persistence {
                persistence.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        }

        let (session, lookup) =
            self.sessions
                .get_or_create(&client_id, version, connect.clean_start, &self.params);

        let mut session_present = lookup == SessionLookup::Resumed;
        if lookup == SessionLookup::Created && !connect.clean_start {
            session_present = self.reload_session(&client_id, &session).await;
        }

        {
            let mut s = session.write();
            s.state = SessionState::Connected;
            s.clean_start = connect.clean_start;
            s.keep_alive = connect.keep_alive.min(self.params.max_keep_alive);
            s.session_expiry_interval = connect
                .properties
                .session_expiry_interval
                .unwrap_or(if connect.clean_start {
                    0
                } else {
                    self.params.expiry_default_secs
                });
            s.will = connect.will.clone();
            s.will_delay_interval = connect
                .will
                .as_ref()
                .and_then(|w| w.properties.will_delay_interval)
                .unwrap_or(0);
            if let Some(receive_maximum) = connect.properties.receive_maximum {
                s.inflight.set_receive_maximum(receive_maximum);
            }
            s.disconnected_at = None;
            s.touch();
        }

        let (tx, rx) = mpsc::channel(self.config.limits.outbound_channel_capacity.max(1));
        self.connections.insert(client_id.clone(), tx.clone());

        // Resumed QoS flows retransmit with their original packet ids
        if session_present {
            let replay = session.write().inflight.resume_replay();
            for retransmit in replay {
                let packet = match retransmit {
                    Retransmit::Publish(publish) => Packet::Publish(publish),
                    Retransmit::PubRel(packet_id) => Packet::PubRel(PubRel::new(packet_id)),
                };
                let _ = tx.try_send(packet);
            }
            self.dispatcher.flush_queued(&client_id);
        }

        self.hooks.client_connected(&info).await;

        let mut connack = ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            properties: Default::default(),
        };
        if version.is_v5() {
            connack.properties.receive_maximum = Some(self.config.limits.receive_maximum);
        }

        ConnectOutcome::Accepted {
            connack,
            link: SessionLink {
                client_id,
                outbound: rx,
            },
        }
    }

    /// Restore a persisted non-clean session; true when state was recovered
    async fn reload_session(&self, client_id: &Arc<str>, session: &Arc<RwLock<Session>>) -> bool {
        let Some(persistence) = &self.persistence else {
            return false;
        };
        let stored = match persistence.get_session(client_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(e) => {
                warn!("session reload for '{}' failed: {}", client_id, e);
                return false;
            }
        };

        for sub in &stored.subscriptions {
            let options = sub.options();
            let share_group = parse_shared_subscription(&sub.filter).map(|(g, _)| g);
            let outcome = self.subscriptions.subscribe(
                &sub.filter,
                LocalSubscription {
                    client_id: client_id.clone(),
                    options,
                    subscription_id: sub.subscription_id,
                    share_group: None,
                },
            );
            if outcome.first_for_route {
                let bare = parse_shared_subscription(&sub.filter)
                    .map(|(_, f)| f)
                    .unwrap_or(sub.filter.as_str());
                let destination = self.local_destination(share_group);
                if let Err(e) = self
                    .routers
                    .add_route(Arc::from(bare), destination, RouteOrigin::Local)
                    .await
                {
                    warn!("route restore for '{}' failed: {}", sub.filter, e);
                } else {
                    BrokerStats::incr(&self.stats.routes_added);
                }
            }
        }

        let mut s = session.write();
        s.session_expiry_interval = stored.session_expiry_interval;
        for (filter_key, sub) in stored
            .subscriptions
            .iter()
            .map(|sub| (Arc::from(sub.filter.as_str()), sub))
        {
            s.add_subscription(filter_key, sub.options(), sub.subscription_id);
        }
        for inflight in stored.inflight {
            s.inflight.restore_outgoing(inflight.into_inflight());
        }
        for queued in stored.queued {
            s.queue.enqueue(queued.into_publish());
        }
        true
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    /// Process one decoded packet from a connected client
    ///
    /// On a protocol error the session has already been torn down with the
    /// matching reason; the transport should close the socket.
    pub async fn handle_packet(
        &self,
        client_id: &Arc<str>,
        packet: Packet,
    ) -> Result<(), ProtocolError> {
        if let Some(session) = self.sessions.get(client_id) {
            session.write().touch();
        }

        let result = match packet {
            Packet::Publish(publish) => self.handle_publish(client_id, publish).await,
            Packet::PubAck(ack) => self.handle_puback(client_id, ack),
            Packet::PubRec(rec) => self.handle_pubrec(client_id, rec),
            Packet::PubRel(rel) => self.handle_pubrel(client_id, rel).await,
            Packet::PubComp(comp) => self.handle_pubcomp(client_id, comp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, subscribe).await,
            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(client_id, unsub).await,
            Packet::PingReq => {
                self.send_to(client_id, Packet::PingResp);
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                self.handle_disconnect(client_id, disconnect).await;
                Ok(())
            }
            Packet::Connect(_) => Err(ProtocolError::UnexpectedPacket("CONNECT after session")),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ProtocolError::UnexpectedPacket("server-to-client packet"))
            }
            Packet::Auth(_) => Err(ProtocolError::Unsupported("re-authentication")),
        };

        if let Err(e) = &result {
            debug!("protocol error from '{}': {}", client_id, e);
            self.teardown(client_id, e.reason_code(), true, Some(e.reason_code()))
                .await;
        }
        result
    }

    /// The transport saw EOF or an I/O error without a DISCONNECT
    pub async fn connection_closed(&self, client_id: &Arc<str>) {
        self.teardown(client_id, ReasonCode::UnspecifiedError, true, None)
            .await;
    }

    async fn handle_publish(
        &self,
        client_id: &Arc<str>,
        publish: Publish,
    ) -> Result<(), ProtocolError> {
        BrokerStats::incr(&self.stats.messages_received);

        validate_topic_name_bounded(&publish.topic, self.config.limits.max_topic_length)
            .map_err(|_| ProtocolError::ProtocolViolation("invalid topic name"))?;
        if publish.qos as u8 > self.config.mqtt.max_qos {
            return Err(ProtocolError::Unsupported("QoS above maximum"));
        }
        if publish.retain && !self.config.mqtt.retain_available {
            return Err(ProtocolError::Unsupported("retain not available"));
        }

        let Some(session) = self.sessions.get(client_id) else {
            return Err(ProtocolError::UnexpectedPacket("PUBLISH before CONNECT"));
        };
        let info = self.client_info(client_id, &session);

        if !self
            .authorize(&session, &info, AclAction::Publish, &publish.topic)
            .await
        {
            debug!("publish to '{}' denied for '{}'", publish.topic, client_id);
            // v5 gets the reason on the ack; v3 silently drops
            match (publish.qos, publish.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => self.send_to(
                    client_id,
                    Packet::PubAck(PubAck::with_reason(packet_id, ReasonCode::NotAuthorized)),
                ),
                (QoS::ExactlyOnce, Some(packet_id)) => self.send_to(
                    client_id,
                    Packet::PubRec(PubRec::with_reason(packet_id, ReasonCode::NotAuthorized)),
                ),
                _ => false,
            };
            return Ok(());
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.route_publish(client_id, &session, publish).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("QoS 1 without packet id"))?;
                self.route_publish(client_id, &session, publish).await;
                self.send_to(client_id, Packet::PubAck(PubAck::new(packet_id)));
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or(ProtocolError::ProtocolViolation("QoS 2 without packet id"))?;
                // Hold until PUBREL; a duplicate id is the client retrying
                session.write().inflight.store_incoming(packet_id, publish);
                self.send_to(client_id, Packet::PubRec(PubRec::new(packet_id)));
            }
        }
        Ok(())
    }

    /// Hook fold, then hand the message to the dispatcher
    async fn route_publish(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) {
        let headers = {
            let s = session.read();
            MessageHeaders {
                username: None,
                peer_addr: None,
                protocol_version: Some(s.protocol_version),
                expiry: publish.properties.message_expiry_interval,
            }
        };
        let message =
            Message::from_publish(self.msg_ids.next(), client_id.clone(), &publish, headers);

        let Some(message) = self.hooks.message_publish(message).await else {
            debug!("publish to '{}' dropped by hook", publish.topic);
            return;
        };

        let cluster = self.cluster.read().clone();
        self.dispatcher.dispatch(message, cluster.as_ref()).await;
    }

    fn handle_puback(&self, client_id: &Arc<str>, ack: PubAck) -> Result<(), ProtocolError> {
        if let Some(session) = self.sessions.get(client_id) {
            session.write().inflight.ack_puback(ack.packet_id);
            self.dispatcher.flush_queued(client_id);
        }
        Ok(())
    }

    fn handle_pubrec(&self, client_id: &Arc<str>, rec: PubRec) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Ok(());
        };
        if session.write().inflight.ack_pubrec(rec.packet_id) {
            self.send_to(client_id, Packet::PubRel(PubRel::new(rec.packet_id)));
        } else {
            self.send_to(
                client_id,
                Packet::PubRel(PubRel::with_reason(
                    rec.packet_id,
                    ReasonCode::PacketIdNotFound,
                )),
            );
        }
        Ok(())
    }

    async fn handle_pubrel(&self, client_id: &Arc<str>, rel: PubRel) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Ok(());
        };
        let released = session.write().inflight.release_incoming(rel.packet_id);

        let reason = if released.is_some() {
            ReasonCode::Success
        } else {
            ReasonCode::PacketIdNotFound
        };
        self.send_to(
            client_id,
            Packet::PubComp(PubComp::with_reason(rel.packet_id, reason)),
        );

        // QoS 2 delivery completes exactly once, on first release
        if let Some(publish) = released {
            self.route_publish(client_id, &session, publish).await;
        }
        Ok(())
    }

    fn handle_pubcomp(&self, client_id: &Arc<str>, comp: PubComp) -> Result<(), ProtocolError> {
        if let Some(session) = self.sessions.get(client_id) {
            session.write().inflight.ack_pubcomp(comp.packet_id);
            self.dispatcher.flush_queued(client_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscribe / unsubscribe
    // ------------------------------------------------------------------

    async fn handle_subscribe(
        &self,
        client_id: &Arc<str>,
        subscribe: Subscribe,
    ) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Err(ProtocolError::UnexpectedPacket("SUBSCRIBE before CONNECT"));
        };
        let info = self.client_info(client_id, &session);
        let subscription_id = subscribe.properties.subscription_identifier;

        if subscription_id.is_some() && !self.config.mqtt.subscription_identifiers {
            let reason_codes = vec![ReasonCode::SubIdNotSupported; subscribe.subscriptions.len()];
            self.send_to(
                client_id,
                Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    reason_codes,
                    properties: Default::default(),
                }),
            );
            return Ok(());
        }

        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut replays = Vec::new();
        for subscription in &subscribe.subscriptions {
            let (reason, replay) = self
                .apply_subscription(
                    client_id,
                    &session,
                    &info,
                    &subscription.filter,
                    subscription.options,
                    subscription_id,
                )
                .await;
            reason_codes.push(reason);
            replays.extend(replay);
        }

        // SUBACK goes out before any retained replay
        self.send_to(
            client_id,
            Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                reason_codes,
                properties: Default::default(),
            }),
        );
        for replay in replays {
            self.replay_retained(
                client_id,
                &session,
                &replay.filter,
                replay.options,
                replay.subscription_id,
            );
        }
        Ok(())
    }

    /// One subscription: validate, authorize, index, route
    ///
    /// Returns the SUBACK reason and, when due, the retained replay to run
    /// after the SUBACK is sent.
    async fn apply_subscription(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        info: &ClientInfo,
        filter: &str,
        mut options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> (ReasonCode, Option<RetainedReplay>) {
        if validate_topic_filter_bounded(filter, self.config.limits.max_topic_length).is_err() {
            return (ReasonCode::TopicFilterInvalid, None);
        }
        let share = parse_shared_subscription(filter);
        if share.is_some() && !self.config.mqtt.shared_subscriptions {
            return (ReasonCode::SharedSubsNotSupported, None);
        }
        let bare = share.map(|(_, f)| f).unwrap_or(filter);
        if is_wildcard(bare) && !self.config.mqtt.wildcard_subscriptions {
            return (ReasonCode::WildcardSubsNotSupported, None);
        }

        if !self
            .authorize(session, info, AclAction::Subscribe, bare)
            .await
        {
            debug!("subscribe to '{}' denied for '{}'", filter, client_id);
            return (ReasonCode::NotAuthorized, None);
        }

        options.qos = options
            .qos
            .min(QoS::from_u8(self.config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce));

        let outcome = self.subscriptions.subscribe(
            filter,
            LocalSubscription {
                client_id: client_id.clone(),
                options,
                subscription_id,
                share_group: None,
            },
        );

        if outcome.first_for_route {
            let destination = self.local_destination(share.map(|(g, _)| g));
            match self
                .routers
                .add_route(Arc::from(bare), destination, RouteOrigin::Local)
                .await
            {
                Ok(_) => BrokerStats::incr(&self.stats.routes_added),
                Err(e) => {
                    warn!("route add for '{}' failed: {}", filter, e);
                    self.subscriptions.unsubscribe(filter, client_id);
                    return (ReasonCode::UnspecifiedError, None);
                }
            }
        }

        let existed = session
            .write()
            .add_subscription(Arc::from(filter), options, subscription_id);

        self.hooks
            .session_subscribed(info, filter, &options)
            .await;

        // Retained replay: never for shared subscriptions, and only as the
        // retain handling option allows
        let skip_replay = share.is_some()
            || !self.config.mqtt.retain_available
            || match options.retain_handling {
                crate::protocol::RetainHandling::Send => false,
                crate::protocol::RetainHandling::SendIfNew => existed,
                crate::protocol::RetainHandling::DoNotSend => true,
            };
        let replay = (!skip_replay).then(|| RetainedReplay {
            filter: bare.to_string(),
            options,
            subscription_id,
        });

        (ReasonCode::granted_qos(options.qos), replay)
    }

    /// Deliver matching retained messages to a fresh subscription
    fn replay_retained(
        &self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) {
        for retained in self.retained.matching(filter) {
            // Expired entries are skipped and their remaining time carried
            let Some(remaining) = retained.remaining_expiry() else {
                continue;
            };
            let qos = retained.qos.min(options.qos);
            let mut publish = Publish {
                dup: false,
                qos,
                // Replay to a new subscription always carries the flag
                retain: true,
                topic: retained.topic.clone(),
                packet_id: None,
                payload: retained.payload.clone(),
                properties: retained.properties.clone(),
            };
            publish.properties.message_expiry_interval = remaining;
            if let Some(id) = subscription_id {
                publish.properties.subscription_identifiers.push(id);
            }

            let packet = {
                let mut s = session.write();
                if qos != QoS::AtMostOnce {
                    if !s.inflight.has_send_capacity() {
                        s.queue.enqueue(publish);
                        continue;
                    }
                    let packet_id = s.inflight.next_packet_id();
                    publish.packet_id = Some(packet_id);
                    s.inflight.track_outgoing(packet_id, publish.clone());
                }
                Packet::Publish(publish)
            };
            self.send_to(client_id, packet);
        }
    }

    async fn handle_unsubscribe(
        &self,
        client_id: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get(client_id) else {
            return Err(ProtocolError::UnexpectedPacket(
                "UNSUBSCRIBE before CONNECT",
            ));
        };
        let info = self.client_info(client_id, &session);

        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for filter in &unsubscribe.filters {
            let outcome = self.subscriptions.unsubscribe(filter, client_id);
            if outcome.removed {
                session.write().remove_subscription(filter);
                self.hooks.session_unsubscribed(&info, filter).await;
                reason_codes.push(ReasonCode::Success);
            } else {
                reason_codes.push(ReasonCode::NoSubscriptionExisted);
            }

            if outcome.last_for_route {
                let share = parse_shared_subscription(filter);
                let bare = share.map(|(_, f)| f).unwrap_or(filter.as_str());
                let destination = self.local_destination(share.map(|(g, _)| g));
                match self
                    .routers
                    .delete_route(Arc::from(bare), destination, RouteOrigin::Local)
                    .await
                {
                    Ok(_) => BrokerStats::incr(&self.stats.routes_deleted),
                    Err(e) => warn!("route delete for '{}' failed: {}", filter, e),
                }
            }
        }

        self.send_to(
            client_id,
            Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
                reason_codes,
                properties: Default::default(),
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect / teardown
    // ------------------------------------------------------------------

    async fn handle_disconnect(&self, client_id: &Arc<str>, disconnect: Disconnect) {
        let graceful = disconnect.reason_code != ReasonCode::DisconnectWithWill;
        if let Some(session) = self.sessions.get(client_id) {
            if let Some(expiry) = disconnect.properties.session_expiry_interval {
                session.write().session_expiry_interval = expiry;
            }
        }
        self.teardown(client_id, disconnect.reason_code, !graceful, None)
            .await;
    }

    /// Administrative kick
    pub async fn kick(&self, client_id: &str) -> bool {
        let client_id: Arc<str> = Arc::from(client_id);
        if self.sessions.get(&client_id).is_none() {
            return false;
        }
        info!("kicking client '{}'", client_id);
        self.teardown(
            &client_id,
            ReasonCode::AdministrativeAction,
            true,
            Some(ReasonCode::AdministrativeAction),
        )
        .await;
        true
    }

    /// Common teardown: connection, will, routes, session persistence
    async fn teardown(
        &self,
        client_id: &Arc<str>,
        reason: ReasonCode,
        publish_will: bool,
        notify_client: Option<ReasonCode>,
    ) {
        if let Some((_, tx)) = self.connections.remove(client_id) {
            if let Some(reason_code) = notify_client {
                let _ = tx.try_send(Packet::Disconnect(Disconnect {
                    reason_code,
                    properties: Default::default(),
                }));
            }
        }

        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let info = self.client_info(client_id, &session);

        // Transition first so the delayed-will guard observes the
        // disconnect it belongs to
        let clean = session.read().clean_start;
        let reaped = if clean {
            self.sessions.remove(client_id);
            session.write().state = SessionState::Disconnected;
            true
        } else {
            self.sessions.disconnect(client_id)
        };

        if publish_will {
            if reaped {
                // The session ends here, so any will delay collapses
                self.publish_will_now(client_id, &session).await;
            } else {
                self.schedule_will(client_id, &session).await;
            }
        } else {
            session.write().will = None;
        }

        if reaped {
            // Session death releases every route it held
            let released = self.subscriptions.unsubscribe_all(client_id);
            self.release_routes(released).await;
            if let Some(persistence) = &self.persistence {
                persistence.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        } else if let Some(persistence) = &self.persistence {
            let stored = StoredSession::capture(
                &session.read(),
                self.config.session.persisted_queue_max,
            );
            persistence.write(PersistenceOp::SetSession {
                client_id: client_id.to_string(),
                session: stored,
            });
        }

        self.hooks.client_disconnected(&info, reason).await;
        debug!("client '{}' disconnected ({})", client_id, reason);
    }

    /// Publish the will immediately or after its delay interval
    async fn schedule_will(&self, client_id: &Arc<str>, session: &Arc<RwLock<Session>>) {
        let delay = {
            let s = session.read();
            if s.will.is_none() {
                return;
            }
            s.will_delay_interval
        };

        if delay == 0 {
            self.publish_will_now(client_id, session).await;
            return;
        }

        // Delayed will: fire only if the same disconnect is still in effect
        let disconnected_at = session.read().disconnected_at;
        let session = session.clone();
        let client_id = client_id.clone();
        let dispatcher = self.dispatcher.clone();
        let cluster = self.cluster.read().clone();
        let msg_ids = self.msg_ids.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;
            let will = {
                let mut s = session.write();
                let still_pending = s.state == SessionState::Disconnected
                    && s.disconnected_at == disconnected_at
                    && s.will.is_some();
                if still_pending {
                    s.will.take()
                } else {
                    None
                }
            };
            if let Some(will) = will {
                debug!("publishing delayed will for '{}'", client_id);
                let message = will_message(&msg_ids, &client_id, will);
                dispatcher.dispatch(message, cluster.as_ref()).await;
            }
        });
    }

    async fn publish_will_now(&self, client_id: &Arc<str>, session: &Arc<RwLock<Session>>) {
        let Some(will) = session.write().will.take() else {
            return;
        };
        debug!("publishing will for '{}' to '{}'", client_id, will.topic);
        let message = will_message(&self.msg_ids, client_id, will);
        let cluster = self.cluster.read().clone();
        self.dispatcher.dispatch(message, cluster.as_ref()).await;
    }

    // ------------------------------------------------------------------
    // Maintenance loops
    // ------------------------------------------------------------------

    async fn sweep_sessions(&self) {
        let reaped = self.sessions.sweep_expired();
        for client_id in reaped {
            debug!("session '{}' expired", client_id);
            let released = self.subscriptions.unsubscribe_all(&client_id);
            self.release_routes(released).await;
            if let Some(persistence) = &self.persistence {
                persistence.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        }
    }

    async fn enforce_keepalive(&self) {
        for client_id in self.sessions.keep_alive_lapsed() {
            info!("keepalive lapsed for '{}'", client_id);
            self.teardown(
                &client_id,
                ReasonCode::KeepAliveTimeout,
                true,
                Some(ReasonCode::KeepAliveTimeout),
            )
            .await;
        }
    }

    async fn retransmit_inflight(&self) {
        let retry_interval = self.config.session.retry_interval_duration();
        let retry_max = self.config.session.retry_max;

        for client_id in self.sessions.client_ids() {
            if !self.connections.contains_key(&client_id) {
                continue;
            }
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };
            let (due, exhausted) = session
                .write()
                .inflight
                .due_for_retry(retry_interval, retry_max);

            for retransmit in due {
                BrokerStats::incr(&self.stats.retransmissions);
                let packet = match retransmit {
                    Retransmit::Publish(publish) => Packet::Publish(publish),
                    Retransmit::PubRel(packet_id) => Packet::PubRel(PubRel::new(packet_id)),
                };
                self.send_to(&client_id, packet);
            }

            if exhausted {
                info!("'{}' exhausted retransmissions, disconnecting", client_id);
                self.teardown(
                    &client_id,
                    ReasonCode::UnspecifiedError,
                    true,
                    Some(ReasonCode::UnspecifiedError),
                )
                .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    async fn authorize(
        &self,
        session: &Arc<RwLock<Session>>,
        info: &ClientInfo,
        action: AclAction,
        topic: &str,
    ) -> bool {
        let epoch = self.acl_epoch.current();
        if let Some(decision) = session.write().acl_cache.get(action, topic, epoch) {
            BrokerStats::incr(&self.stats.acl_cache_hits);
            return decision.is_allowed();
        }
        BrokerStats::incr(&self.stats.acl_cache_misses);

        // Backend first, then the hook chain; both fail closed
        let mut decision = match self.auth.authorize(info, action, topic).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("authorization backend failed: {}", e);
                AclDecision::Deny
            }
        };
        if decision.is_allowed() {
            decision = self.hooks.check_acl(info, action, topic).await;
        }

        session
            .write()
            .acl_cache
            .insert(action, topic, decision, epoch);
        decision.is_allowed()
    }

    /// Broadcast invalidation after an authorization rule change
    pub fn empty_acl_cache(&self) {
        self.acl_epoch.invalidate_all();
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Publish a broker-originated message
    pub async fn publish_sys(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        let message = Message::sys(self.msg_ids.next(), Arc::from(topic), payload, qos, retain);
        let cluster = self.cluster.read().clone();
        self.dispatcher.dispatch(message, cluster.as_ref()).await;
    }

    /// Subscribe on behalf of a connected client
    pub async fn subscribe_on_behalf(
        &self,
        client_id: &str,
        filter: &str,
        options: SubscriptionOptions,
    ) -> ReasonCode {
        let client_id: Arc<str> = Arc::from(client_id);
        let Some(session) = self.sessions.get(&client_id) else {
            return ReasonCode::ClientIdNotValid;
        };
        let info = self.client_info(&client_id, &session);
        let (reason, replay) = self
            .apply_subscription(&client_id, &session, &info, filter, options, None)
            .await;
        if let Some(replay) = replay {
            self.replay_retained(
                &client_id,
                &session,
                &replay.filter,
                replay.options,
                replay.subscription_id,
            );
        }
        reason
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Known client ids, connected or not
    pub fn list_clients(&self) -> Vec<Arc<str>> {
        self.sessions.client_ids()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Routes for one topic, or the whole table
    pub fn list_routes(&self, topic: Option<&str>) -> Vec<Route> {
        match topic {
            Some(topic) => {
                let destinations = self.route_table.match_topic(topic);
                destinations
                    .into_iter()
                    .map(|destination| Route {
                        filter: Arc::from(topic),
                        destination,
                    })
                    .collect()
            }
            None => self.route_table.snapshot(),
        }
    }

    pub fn list_subscriptions(&self) -> Vec<(Arc<str>, LocalSubscription)> {
        self.subscriptions.list()
    }

    pub fn retained_topics(&self) -> Vec<Arc<str>> {
        self.retained.topics()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn client_info(&self, client_id: &Arc<str>, session: &Arc<RwLock<Session>>) -> ClientInfo {
        let s = session.read();
        ClientInfo {
            client_id: client_id.clone(),
            username: None,
            peer_addr: None,
            protocol_version: s.protocol_version,
        }
    }

    fn local_destination(&self, share_group: Option<&str>) -> Destination {
        match share_group {
            Some(group) => Destination::shared(self.node_id.clone(), Arc::from(group)),
            None => Destination::node(self.node_id.clone()),
        }
    }

    async fn release_routes(&self, released: Vec<ReleasedRoute>) {
        for route in released {
            let destination = self.local_destination(route.share_group.as_deref());
            match self
                .routers
                .delete_route(route.filter.clone(), destination, RouteOrigin::Local)
                .await
            {
                Ok(_) => BrokerStats::incr(&self.stats.routes_deleted),
                Err(e) => warn!("route release for '{}' failed: {}", route.filter, e),
            }
        }
    }

    fn send_to(&self, client_id: &Arc<str>, packet: Packet) -> bool {
        match self.connections.get(client_id) {
            Some(tx) => tx.try_send(packet).is_ok(),
            None => false,
        }
    }
}

/// Build the will's routed message
fn will_message(msg_ids: &MessageIdGen, client_id: &Arc<str>, will: Will) -> Message {
    let publish = Publish {
        dup: false,
        qos: will.qos,
        retain: will.retain,
        topic: Arc::from(will.topic.as_str()),
        packet_id: None,
        payload: will.payload,
        properties: will.properties,
    };
    Message::from_publish(
        msg_ids.next(),
        client_id.clone(),
        &publish,
        MessageHeaders::default(),
    )
}
