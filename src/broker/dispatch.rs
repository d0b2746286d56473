//! Publish fanout
//!
//! One dispatch per accepted publish: match the route table for destination
//! nodes, forward once per remote node, and fan out to local sessions.
//! Local matches fold per session (highest granted QoS wins, any
//! retain-as-published sticks, all subscription identifiers collect), so a
//! session subscribed through several matching filters still receives the
//! message exactly once. Shared subscription groups elect one member per
//! publish under the configured policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Message, MessageIdGen};
use crate::cluster::{ClusterManager, RemotePublish};
use crate::config::SharePolicy;
use crate::hooks::HookRegistry;
use crate::metrics::BrokerStats;
use crate::protocol::{Disconnect, Packet, Publish, QoS, ReasonCode};
use crate::retained::RetainedStore;
use crate::router::{NodeId, RouteTable};
use crate::session::{EnqueueResult, SessionStore};
use crate::topic::{Subscription, SubscriptionStore};

/// Per-session folded delivery decision
struct Delivery {
    qos: QoS,
    retain_as_published: bool,
    subscription_ids: SmallVec<[u32; 4]>,
}

/// The broker's fanout engine
pub(crate) struct Dispatcher {
    node_id: NodeId,
    subscriptions: Arc<SubscriptionStore>,
    sessions: Arc<SessionStore>,
    connections: Arc<DashMap<Arc<str>, mpsc::Sender<Packet>>>,
    route_table: Arc<RouteTable>,
    retained: Arc<RetainedStore>,
    hooks: Arc<HookRegistry>,
    stats: Arc<BrokerStats>,
    msg_ids: Arc<MessageIdGen>,
    share_policy: SharePolicy,
    /// Round-robin cursors keyed by share group
    share_counters: DashMap<Arc<str>, AtomicUsize>,
    hasher: ahash::RandomState,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: NodeId,
        subscriptions: Arc<SubscriptionStore>,
        sessions: Arc<SessionStore>,
        connections: Arc<DashMap<Arc<str>, mpsc::Sender<Packet>>>,
        route_table: Arc<RouteTable>,
        retained: Arc<RetainedStore>,
        hooks: Arc<HookRegistry>,
        stats: Arc<BrokerStats>,
        msg_ids: Arc<MessageIdGen>,
        share_policy: SharePolicy,
    ) -> Self {
        Self {
            node_id,
            subscriptions,
            sessions,
            connections,
            route_table,
            retained,
            hooks,
            stats,
            msg_ids,
            share_policy,
            share_counters: DashMap::new(),
            hasher: ahash::RandomState::new(),
        }
    }

    /// Route a publish: retained update, remote forwards, local fanout
    pub(crate) async fn dispatch(&self, message: Message, cluster: Option<&Arc<ClusterManager>>) {
        if message.flags.retain {
            self.retained.apply(&message);
        }

        let nodes = self.route_table.match_nodes(&message.topic);
        if nodes.is_empty() {
            trace!("no destinations for '{}'", message.topic);
            return;
        }

        if let Some(cluster) = cluster {
            cluster.forward(&nodes, &message);
        }
        if nodes.iter().any(|n| *n == self.node_id) {
            self.fanout_local(&message).await;
        }
    }

    /// A publish received from a peer node: local fanout only
    pub(crate) async fn dispatch_remote(&self, remote: RemotePublish) {
        let publish = Publish {
            qos: QoS::from_u8(remote.qos).unwrap_or(QoS::AtMostOnce),
            retain: remote.retain,
            topic: Arc::from(remote.topic.as_str()),
            payload: remote.payload.into(),
            ..Default::default()
        };
        let mut message = Message::from_publish(
            self.msg_ids.next(),
            Arc::from(remote.from_client.as_str()),
            &publish,
            Default::default(),
        );
        message.flags.sys = remote.sys;

        if message.flags.retain {
            self.retained.apply(&message);
        }
        self.fanout_local(&message).await;
    }

    /// Enqueue to every matching local session, at most once each
    pub(crate) async fn fanout_local(&self, message: &Message) {
        let matches = self.subscriptions.match_local(&message.topic);
        if matches.is_empty() {
            return;
        }

        let mut deliveries: AHashMap<Arc<str>, Delivery> =
            AHashMap::with_capacity(matches.len());
        let mut shared: AHashMap<Arc<str>, SmallVec<[Subscription; 4]>> = AHashMap::new();

        for sub in matches {
            if sub.options.no_local && sub.client_id == message.from {
                continue;
            }
            match &sub.share_group {
                Some(group) => shared.entry(group.clone()).or_default().push(sub),
                None => Self::fold(&mut deliveries, &sub),
            }
        }

        for (group, members) in shared {
            if let Some(elected) = self.elect(&group, &members, message) {
                Self::fold(&mut deliveries, elected);
            }
        }

        for (client_id, delivery) in deliveries {
            self.deliver(&client_id, message, delivery).await;
        }
    }

    fn fold(deliveries: &mut AHashMap<Arc<str>, Delivery>, sub: &Subscription) {
        let entry = deliveries
            .entry(sub.client_id.clone())
            .or_insert_with(|| Delivery {
                qos: sub.options.qos,
                retain_as_published: sub.options.retain_as_published,
                subscription_ids: SmallVec::new(),
            });
        if sub.options.qos > entry.qos {
            entry.qos = sub.options.qos;
        }
        if sub.options.retain_as_published {
            entry.retain_as_published = true;
        }
        if let Some(id) = sub.subscription_id {
            if !entry.subscription_ids.contains(&id) {
                entry.subscription_ids.push(id);
            }
        }
    }

    /// Pick the group member receiving this publish
    fn elect<'a>(
        &self,
        group: &Arc<str>,
        members: &'a [Subscription],
        message: &Message,
    ) -> Option<&'a Subscription> {
        if members.is_empty() {
            return None;
        }
        let index = match self.share_policy {
            SharePolicy::RoundRobin => {
                let counter = self
                    .share_counters
                    .entry(group.clone())
                    .or_insert_with(|| AtomicUsize::new(0));
                counter.fetch_add(1, Ordering::Relaxed) % members.len()
            }
            SharePolicy::Random => {
                // Message ids are unique, so hashing them spreads evenly
                // without an RNG dependency
                (self.hasher.hash_one((message.id, group.as_ref())) as usize) % members.len()
            }
            SharePolicy::HashClientid => {
                (self.hasher.hash_one(message.from.as_ref()) as usize) % members.len()
            }
        };
        members.get(index)
    }

    async fn deliver(&self, client_id: &Arc<str>, message: &Message, delivery: Delivery) {
        let effective_qos = message.qos.min(delivery.qos);
        let retain = delivery.retain_as_published && message.flags.retain;
        let mut publish = message.to_publish(effective_qos, retain);
        publish.properties.subscription_identifiers = delivery.subscription_ids;

        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let connection = self.connections.get(client_id).map(|c| c.clone());

        enum Plan {
            Send(Publish),
            Queued(EnqueueResult),
            Dropped,
        }

        let plan = {
            let mut s = session.write();
            match &connection {
                None => {
                    if s.clean_start {
                        Plan::Dropped
                    } else {
                        Plan::Queued(s.queue.enqueue(publish))
                    }
                }
                Some(_) if s.queue.over_watermark() => {
                    // Backpressure: hold QoS 1/2 in the queue, shed QoS 0
                    if effective_qos == QoS::AtMostOnce {
                        Plan::Dropped
                    } else {
                        Plan::Queued(s.queue.enqueue(publish))
                    }
                }
                Some(_) => {
                    if effective_qos != QoS::AtMostOnce {
                        if !s.inflight.has_send_capacity() {
                            Plan::Queued(s.queue.enqueue(publish))
                        } else {
                            let packet_id = s.inflight.next_packet_id();
                            publish.packet_id = Some(packet_id);
                            s.inflight.track_outgoing(packet_id, publish.clone());
                            Plan::Send(publish)
                        }
                    } else {
                        Plan::Send(publish)
                    }
                }
            }
        };

        match plan {
            Plan::Send(publish) => {
                let qos = publish.qos;
                let sent = connection
                    .as_ref()
                    .is_some_and(|tx| tx.try_send(Packet::Publish(publish)).is_ok());
                if sent {
                    BrokerStats::incr(&self.stats.messages_sent);
                    self.hooks.message_delivered(client_id, message).await;
                } else if qos == QoS::AtMostOnce {
                    // Slow consumer; at-most-once may shed
                    BrokerStats::incr(&self.stats.messages_dropped);
                } else {
                    // Inflight entry stays; the retry sweep retransmits
                    debug!("outbound channel full for '{}', will retry", client_id);
                }
            }
            Plan::Queued(result) => match result {
                EnqueueResult::Queued => BrokerStats::incr(&self.stats.messages_sent),
                EnqueueResult::DroppedNewest | EnqueueResult::DroppedOldest => {
                    BrokerStats::incr(&self.stats.queue_overflows);
                    BrokerStats::incr(&self.stats.messages_dropped);
                }
                EnqueueResult::Disconnect => {
                    BrokerStats::incr(&self.stats.queue_overflows);
                    debug!("queue overflow disconnects '{}'", client_id);
                    if let Some(tx) = &connection {
                        let _ = tx.try_send(Packet::Disconnect(Disconnect {
                            reason_code: ReasonCode::QuotaExceeded,
                            properties: Default::default(),
                        }));
                    }
                    self.connections.remove(client_id);
                }
            },
            Plan::Dropped => {
                BrokerStats::incr(&self.stats.messages_dropped);
            }
        }
    }

    /// Flush a resumed or unblocked session's queue into its connection
    ///
    /// Called after reconnect and whenever acks free inflight capacity.
    pub(crate) fn flush_queued(&self, client_id: &Arc<str>) -> usize {
        let Some(session) = self.sessions.get(client_id) else {
            return 0;
        };
        let Some(connection) = self.connections.get(client_id).map(|c| c.clone()) else {
            return 0;
        };

        let mut sent = 0;
        loop {
            let packet = {
                let mut s = session.write();
                // Respect the inflight window while draining
                let Some(next_qos) = s.queue.front_qos() else {
                    break;
                };
                if next_qos != QoS::AtMostOnce && !s.inflight.has_send_capacity() {
                    break;
                }
                let Some(mut publish) = s.queue.pop_front() else {
                    break;
                };
                if publish.qos != QoS::AtMostOnce {
                    let packet_id = s.inflight.next_packet_id();
                    publish.packet_id = Some(packet_id);
                    s.inflight.track_outgoing(packet_id, publish.clone());
                }
                Packet::Publish(publish)
            };

            if connection.try_send(packet).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }
}
