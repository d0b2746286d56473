//! End-to-end broker tests over the decoded-packet surface
//!
//! Each "client" is a channel-backed connection: CONNECT through
//! `Broker::connect`, inbound packets through `Broker::handle_packet`,
//! outbound packets drained from the session link.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use meshmq::broker::{Broker, ConnectOutcome};
use meshmq::config::Config;
use meshmq::protocol::{
    Connect, Disconnect, Packet, ProtocolVersion, PubAck, PubComp, PubRec, Publish, QoS,
    ReasonCode, Subscribe, Subscription, SubscriptionOptions, Unsubscribe, Will,
};

struct TestClient {
    client_id: Arc<str>,
    outbound: mpsc::Receiver<Packet>,
}

impl TestClient {
    /// Next outbound packet, or panic after a short wait
    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    /// Assert nothing is delivered within a small window
    async fn assert_silent(&mut self) {
        let result =
            tokio::time::timeout(Duration::from_millis(100), self.outbound.recv()).await;
        if let Ok(Some(packet)) = result {
            panic!("expected silence, got {:?}", packet);
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.routing.worker_pool_size = 2;
    config
}

async fn connect_with(broker: &Broker, connect: Connect) -> (TestClient, bool) {
    match broker.connect(connect, None).await {
        ConnectOutcome::Accepted { connack, link } => (
            TestClient {
                client_id: link.client_id,
                outbound: link.outbound,
            },
            connack.session_present,
        ),
        ConnectOutcome::Rejected(connack) => {
            panic!("connect rejected: {:?}", connack.reason_code)
        }
    }
}

async fn connect(broker: &Broker, client_id: &str) -> TestClient {
    connect_with(
        broker,
        Connect {
            client_id: client_id.to_string(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await
    .0
}

async fn subscribe(broker: &Broker, client: &mut TestClient, filter: &str, qos: QoS) {
    broker
        .handle_packet(
            &client.client_id,
            Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription {
                    filter: filter.to_string(),
                    options: SubscriptionOptions {
                        qos,
                        ..Default::default()
                    },
                }],
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();
    match client.recv().await {
        Packet::SubAck(suback) => {
            assert!(
                suback.reason_codes.iter().all(|rc| rc.is_success()),
                "subscription rejected: {:?}",
                suback.reason_codes
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

async fn publish(
    broker: &Broker,
    client: &TestClient,
    topic: &str,
    payload: &str,
    qos: QoS,
    retain: bool,
    packet_id: Option<u16>,
) {
    broker
        .handle_packet(
            &client.client_id,
            Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: Arc::from(topic),
                packet_id,
                payload: Bytes::copy_from_slice(payload.as_bytes()),
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exact_match_qos1() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "sub-a").await;
    let mut b = connect(&broker, "pub-b").await;

    subscribe(&broker, &mut a, "room/1/temp", QoS::AtLeastOnce).await;

    publish(&broker, &b, "room/1/temp", "22", QoS::AtLeastOnce, false, Some(11)).await;

    // Publisher is acknowledged
    match b.recv().await {
        Packet::PubAck(ack) => assert_eq!(ack.packet_id, 11),
        other => panic!("expected PUBACK, got {:?}", other),
    }

    // Subscriber receives the message at the subscription QoS
    let delivery = a.recv_publish().await;
    assert_eq!(delivery.topic.as_ref(), "room/1/temp");
    assert_eq!(delivery.payload.as_ref(), b"22");
    assert_eq!(delivery.qos, QoS::AtLeastOnce);
    assert!(!delivery.retain);
    assert!(delivery.packet_id.is_some());
}

#[tokio::test]
async fn test_single_level_wildcard() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;

    subscribe(&broker, &mut a, "room/+/temp", QoS::AtMostOnce).await;

    publish(&broker, &b, "room/42/temp", "23", QoS::AtMostOnce, false, None).await;
    let delivery = a.recv_publish().await;
    assert_eq!(delivery.payload.as_ref(), b"23");

    // "+" matches exactly one level
    publish(&broker, &b, "room/temp", "x", QoS::AtMostOnce, false, None).await;
    a.assert_silent().await;
}

#[tokio::test]
async fn test_multi_level_wildcard_excludes_sys() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;

    subscribe(&broker, &mut a, "#", QoS::AtMostOnce).await;

    broker
        .publish_sys(
            "$SYS/brokers/1/uptime",
            Bytes::from_static(b"100"),
            QoS::AtMostOnce,
            false,
        )
        .await;
    a.assert_silent().await;

    // Ordinary topics still flow
    broker
        .publish_sys("normal", Bytes::from_static(b"1"), QoS::AtMostOnce, false)
        .await;
    let delivery = a.recv_publish().await;
    assert_eq!(delivery.topic.as_ref(), "normal");
}

#[tokio::test]
async fn test_retained_message_replay() {
    let broker = Broker::new(test_config());
    let b = connect(&broker, "b").await;

    publish(&broker, &b, "s/k", "1", QoS::AtMostOnce, true, None).await;

    // Later subscriber gets the retained message with the flag set
    let mut a = connect(&broker, "a").await;
    subscribe(&broker, &mut a, "s/k", QoS::AtMostOnce).await;
    let delivery = a.recv_publish().await;
    assert_eq!(delivery.payload.as_ref(), b"1");
    assert!(delivery.retain);

    // Empty retained payload deletes the entry
    publish(&broker, &b, "s/k", "", QoS::AtMostOnce, true, None).await;
    let mut c = connect(&broker, "c").await;
    subscribe(&broker, &mut c, "s/k", QoS::AtMostOnce).await;
    c.assert_silent().await;
}

#[tokio::test]
async fn test_retained_wildcard_replay() {
    let broker = Broker::new(test_config());
    let b = connect(&broker, "b").await;
    publish(&broker, &b, "room/1/temp", "20", QoS::AtMostOnce, true, None).await;
    publish(&broker, &b, "room/2/temp", "21", QoS::AtMostOnce, true, None).await;

    let mut a = connect(&broker, "a").await;
    subscribe(&broker, &mut a, "room/+/temp", QoS::AtMostOnce).await;

    let first = a.recv_publish().await;
    let second = a.recv_publish().await;
    let mut payloads = vec![first.payload, second.payload];
    payloads.sort();
    assert_eq!(payloads[0].as_ref(), b"20");
    assert_eq!(payloads[1].as_ref(), b"21");
}

#[tokio::test]
async fn test_shared_subscription_round_robin() {
    let broker = Broker::new(test_config());
    let mut members = Vec::new();
    for name in ["a", "b", "c"] {
        let mut client = connect(&broker, name).await;
        subscribe(&broker, &mut client, "$share/g/j/#", QoS::AtMostOnce).await;
        members.push(client);
    }
    let publisher = connect(&broker, "p").await;

    for i in 0..6 {
        publish(
            &broker,
            &publisher,
            "j/x",
            &format!("m{}", i),
            QoS::AtMostOnce,
            false,
            None,
        )
        .await;
    }

    // Round robin: exactly two each, in publish order per member
    for member in members.iter_mut() {
        let first = member.recv_publish().await;
        let second = member.recv_publish().await;
        assert!(first.payload < second.payload);
        member.assert_silent().await;
    }
}

#[tokio::test]
async fn test_at_most_once_per_session_across_overlapping_filters() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;

    subscribe(&broker, &mut a, "x/#", QoS::AtMostOnce).await;
    subscribe(&broker, &mut a, "x/+", QoS::AtLeastOnce).await;
    subscribe(&broker, &mut a, "x/y", QoS::AtMostOnce).await;

    publish(&broker, &b, "x/y", "once", QoS::AtMostOnce, false, None).await;

    let delivery = a.recv_publish().await;
    assert_eq!(delivery.payload.as_ref(), b"once");
    a.assert_silent().await;
}

#[tokio::test]
async fn test_no_local() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;

    broker
        .handle_packet(
            &a.client_id,
            Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription {
                    filter: "loop".to_string(),
                    options: SubscriptionOptions {
                        qos: QoS::AtMostOnce,
                        no_local: true,
                        ..Default::default()
                    },
                }],
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();
    a.recv().await; // SUBACK

    publish(&broker, &a, "loop", "own", QoS::AtMostOnce, false, None).await;
    a.assert_silent().await;

    // Another publisher still reaches the subscriber
    let b = connect(&broker, "b").await;
    publish(&broker, &b, "loop", "other", QoS::AtMostOnce, false, None).await;
    assert_eq!(a.recv_publish().await.payload.as_ref(), b"other");
}

#[tokio::test]
async fn test_session_takeover_preserves_subscription() {
    let broker = Broker::new(test_config());

    let (mut a, present) = connect_with(
        &broker,
        Connect {
            client_id: "c1".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(!present);
    subscribe(&broker, &mut a, "t", QoS::AtMostOnce).await;

    let (a2, present) = connect_with(
        &broker,
        Connect {
            client_id: "c1".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(present);

    // The displaced connection learns why it died
    match a.recv().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code, ReasonCode::SessionTakenOver)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }

    // Subscription survived onto the new connection
    let b = connect(&broker, "b").await;
    publish(&broker, &b, "t", "kept", QoS::AtMostOnce, false, None).await;
    let mut a2 = a2;
    assert_eq!(a2.recv_publish().await.payload.as_ref(), b"kept");
}

#[tokio::test]
async fn test_qos2_flow_and_resume_without_duplicate() {
    let broker = Broker::new(test_config());

    let (mut a, _) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    subscribe(&broker, &mut a, "q2", QoS::ExactlyOnce).await;

    let mut b = connect(&broker, "pub").await;

    // Publisher-side QoS 2: PUBLISH -> PUBREC, release on PUBREL
    publish(&broker, &b, "q2", "exact", QoS::ExactlyOnce, false, Some(5)).await;
    match b.recv().await {
        Packet::PubRec(rec) => assert_eq!(rec.packet_id, 5),
        other => panic!("expected PUBREC, got {:?}", other),
    }
    a.assert_silent().await; // not routed until released

    broker
        .handle_packet(&b.client_id, Packet::PubRel(meshmq::protocol::PubRel::new(5)))
        .await
        .unwrap();
    match b.recv().await {
        Packet::PubComp(comp) => assert_eq!(comp.packet_id, 5),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    // Subscriber-side QoS 2 up to PUBREL
    let delivery = a.recv_publish().await;
    assert_eq!(delivery.qos, QoS::ExactlyOnce);
    let packet_id = delivery.packet_id.unwrap();
    broker
        .handle_packet(&a.client_id, Packet::PubRec(PubRec::new(packet_id)))
        .await
        .unwrap();
    match a.recv().await {
        Packet::PubRel(rel) => assert_eq!(rel.packet_id, packet_id),
        other => panic!("expected PUBREL, got {:?}", other),
    }

    // Reconnect before PUBCOMP: the flow resumes at PUBREL, no second PUBLISH
    broker.connection_closed(&a.client_id).await;
    let (mut a, present) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(present);

    match a.recv().await {
        Packet::PubRel(rel) => assert_eq!(rel.packet_id, packet_id),
        other => panic!("expected resumed PUBREL, got {:?}", other),
    }
    broker
        .handle_packet(&a.client_id, Packet::PubComp(PubComp::new(packet_id)))
        .await
        .unwrap();
    a.assert_silent().await;
}

#[tokio::test]
async fn test_qos1_resume_replays_with_dup_and_same_id() {
    let broker = Broker::new(test_config());

    let (mut a, _) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    subscribe(&broker, &mut a, "t", QoS::AtLeastOnce).await;

    let b = connect(&broker, "pub").await;
    publish(&broker, &b, "t", "m", QoS::AtLeastOnce, false, None).await;
    let first = a.recv_publish().await;
    let packet_id = first.packet_id.unwrap();

    // Drop without acking; resume must retransmit the same id with DUP
    broker.connection_closed(&a.client_id).await;
    let (mut a, present) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(present);

    let replay = a.recv_publish().await;
    assert!(replay.dup);
    assert_eq!(replay.packet_id, Some(packet_id));

    broker
        .handle_packet(&a.client_id, Packet::PubAck(PubAck::new(packet_id)))
        .await
        .unwrap();
    a.assert_silent().await;
}

#[tokio::test]
async fn test_offline_queueing_for_persistent_session() {
    let mut config = test_config();
    config.session.queue_max = 2;
    config.session.queue_high_watermark = 2;
    let broker = Broker::new(config);

    let (mut a, _) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    subscribe(&broker, &mut a, "q", QoS::AtLeastOnce).await;

    // Graceful disconnect keeps the session within its expiry
    broker
        .handle_packet(
            &a.client_id,
            Packet::Disconnect(Disconnect::default()),
        )
        .await
        .unwrap();

    let b = connect(&broker, "pub").await;
    for payload in ["1", "2", "3"] {
        publish(&broker, &b, "q", payload, QoS::AtLeastOnce, false, None).await;
    }

    // Default drop-newest bounds the queue to the first two
    let (mut a, present) = connect_with(
        &broker,
        Connect {
            client_id: "sub".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(present);

    assert_eq!(a.recv_publish().await.payload.as_ref(), b"1");
    assert_eq!(a.recv_publish().await.payload.as_ref(), b"2");
    a.assert_silent().await;
    assert!(broker.stats().queue_overflows >= 1);
}

#[tokio::test]
async fn test_clean_start_discards_session_and_routes() {
    let broker = Broker::new(test_config());

    let (mut a, _) = connect_with(
        &broker,
        Connect {
            client_id: "c".to_string(),
            clean_start: false,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    subscribe(&broker, &mut a, "t", QoS::AtMostOnce).await;
    assert_eq!(broker.list_routes(None).len(), 1);

    // Clean reconnect: no session_present, no routes, no subscriptions
    let (_, present) = connect_with(
        &broker,
        Connect {
            client_id: "c".to_string(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(!present);
    assert!(broker.list_routes(None).is_empty());
    assert!(broker.list_subscriptions().is_empty());
}

#[tokio::test]
async fn test_route_cleanup_on_connection_loss() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;
    subscribe(&broker, &mut a, "x/#", QoS::AtMostOnce).await;
    subscribe(&broker, &mut a, "y", QoS::AtMostOnce).await;
    assert_eq!(broker.list_routes(None).len(), 2);

    // A clean session dying releases every route it held
    broker.connection_closed(&a.client_id).await;
    assert!(broker.list_routes(None).is_empty());
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_releases_route_on_last_subscriber() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;
    let mut b = connect(&broker, "b").await;
    subscribe(&broker, &mut a, "shared/t", QoS::AtMostOnce).await;
    subscribe(&broker, &mut b, "shared/t", QoS::AtMostOnce).await;
    assert_eq!(broker.list_routes(None).len(), 1);

    for client in [&a, &b] {
        broker
            .handle_packet(
                &client.client_id,
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 9,
                    filters: vec!["shared/t".to_string()],
                    properties: Default::default(),
                }),
            )
            .await
            .unwrap();
    }

    match a.recv().await {
        Packet::UnsubAck(unsuback) => {
            assert_eq!(unsuback.reason_codes, vec![ReasonCode::Success])
        }
        other => panic!("expected UNSUBACK, got {:?}", other),
    }
    assert!(broker.list_routes(None).is_empty());
}

#[tokio::test]
async fn test_will_published_on_ungraceful_disconnect() {
    let broker = Broker::new(test_config());
    let mut watcher = connect(&broker, "watcher").await;
    subscribe(&broker, &mut watcher, "status/+", QoS::AtMostOnce).await;

    let (dying, _) = connect_with(
        &broker,
        Connect {
            client_id: "dying".to_string(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            will: Some(Will {
                topic: "status/dying".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Default::default(),
            }),
            ..Default::default()
        },
    )
    .await;

    broker.connection_closed(&dying.client_id).await;
    let will = watcher.recv_publish().await;
    assert_eq!(will.topic.as_ref(), "status/dying");
    assert_eq!(will.payload.as_ref(), b"gone");
}

#[tokio::test]
async fn test_will_suppressed_on_clean_disconnect() {
    let broker = Broker::new(test_config());
    let mut watcher = connect(&broker, "watcher").await;
    subscribe(&broker, &mut watcher, "status/+", QoS::AtMostOnce).await;

    let (leaving, _) = connect_with(
        &broker,
        Connect {
            client_id: "leaving".to_string(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            will: Some(Will {
                topic: "status/leaving".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Default::default(),
            }),
            ..Default::default()
        },
    )
    .await;

    broker
        .handle_packet(
            &leaving.client_id,
            Packet::Disconnect(Disconnect::default()),
        )
        .await
        .unwrap();
    watcher.assert_silent().await;
}

#[tokio::test]
async fn test_kick() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;

    assert!(broker.kick("a").await);
    match a.recv().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code, ReasonCode::AdministrativeAction)
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
    assert!(!broker.kick("a").await);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_flow_control_defers_past_receive_maximum() {
    let broker = Broker::new(test_config());

    let (mut a, _) = {
        let mut connect = Connect {
            client_id: "slow".to_string(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        };
        connect.properties.receive_maximum = Some(1);
        connect_with(&broker, connect).await
    };
    subscribe(&broker, &mut a, "f", QoS::AtLeastOnce).await;

    let b = connect(&broker, "pub").await;
    publish(&broker, &b, "f", "1", QoS::AtLeastOnce, false, None).await;
    publish(&broker, &b, "f", "2", QoS::AtLeastOnce, false, None).await;

    // Window of one: the second message waits for the first ack
    let first = a.recv_publish().await;
    assert_eq!(first.payload.as_ref(), b"1");
    a.assert_silent().await;

    broker
        .handle_packet(
            &a.client_id,
            Packet::PubAck(PubAck::new(first.packet_id.unwrap())),
        )
        .await
        .unwrap();
    let second = a.recv_publish().await;
    assert_eq!(second.payload.as_ref(), b"2");
}

#[tokio::test]
async fn test_subscribe_deny_surfaces_reason_code() {
    use async_trait::async_trait;
    use meshmq::acl::{AclAction, AclDecision, AuthDecision, AuthError, AuthProvider, ClientInfo};

    struct DenySecret;

    #[async_trait]
    impl AuthProvider for DenySecret {
        async fn authenticate(
            &self,
            _client: &ClientInfo,
            _password: Option<&[u8]>,
        ) -> Result<AuthDecision, AuthError> {
            Ok(AuthDecision::Allow)
        }

        async fn authorize(
            &self,
            _client: &ClientInfo,
            _action: AclAction,
            topic: &str,
        ) -> Result<AclDecision, AuthError> {
            Ok(if topic.starts_with("secret") {
                AclDecision::Deny
            } else {
                AclDecision::Allow
            })
        }
    }

    let broker = Broker::with_auth(test_config(), Arc::new(DenySecret));
    let mut a = connect(&broker, "a").await;

    broker
        .handle_packet(
            &a.client_id,
            Packet::Subscribe(Subscribe {
                packet_id: 3,
                subscriptions: vec![
                    Subscription {
                        filter: "secret/x".to_string(),
                        options: Default::default(),
                    },
                    Subscription {
                        filter: "open/x".to_string(),
                        options: Default::default(),
                    },
                ],
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();

    match a.recv().await {
        Packet::SubAck(suback) => {
            assert_eq!(
                suback.reason_codes,
                vec![ReasonCode::NotAuthorized, ReasonCode::Success]
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }

    // Denied publish acks with the reason and is not routed
    let mut watcher = connect(&broker, "w").await;
    subscribe(&broker, &mut watcher, "#", QoS::AtMostOnce).await;
    publish(&broker, &a, "secret/x", "no", QoS::AtLeastOnce, false, Some(7)).await;
    match a.recv().await {
        Packet::PubAck(ack) => assert_eq!(ack.reason_code, ReasonCode::NotAuthorized),
        other => panic!("expected PUBACK, got {:?}", other),
    }
    watcher.assert_silent().await;
}

#[tokio::test]
async fn test_hook_can_rewrite_and_drop() {
    use async_trait::async_trait;
    use meshmq::broker::Message;
    use meshmq::hooks::{Hook, HookAction, HookResult};

    struct Scrubber;

    #[async_trait]
    impl Hook for Scrubber {
        async fn on_message_publish(&self, message: &Message) -> HookResult<HookAction<Message>> {
            if message.topic.as_ref() == "drop/me" {
                return Ok(HookAction::Stop);
            }
            let mut scrubbed = message.clone();
            scrubbed.payload = Bytes::from_static(b"scrubbed");
            Ok(HookAction::ContinueWith(scrubbed))
        }
    }

    let broker = Broker::new(test_config());
    broker.hooks().register(Arc::new(Scrubber));

    let mut a = connect(&broker, "a").await;
    subscribe(&broker, &mut a, "#", QoS::AtMostOnce).await;
    let b = connect(&broker, "b").await;

    publish(&broker, &b, "drop/me", "x", QoS::AtMostOnce, false, None).await;
    a.assert_silent().await;

    publish(&broker, &b, "keep/me", "original", QoS::AtMostOnce, false, None).await;
    assert_eq!(a.recv_publish().await.payload.as_ref(), b"scrubbed");
}

#[tokio::test]
async fn test_invalid_filter_rejected() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;

    broker
        .handle_packet(
            &a.client_id,
            Packet::Subscribe(Subscribe {
                packet_id: 2,
                subscriptions: vec![Subscription {
                    filter: "bad/#/worse".to_string(),
                    options: Default::default(),
                }],
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();

    match a.recv().await {
        Packet::SubAck(suback) => {
            assert_eq!(suback.reason_codes, vec![ReasonCode::TopicFilterInvalid])
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_with_wildcard_topic_disconnects() {
    let broker = Broker::new(test_config());
    let a = connect(&broker, "a").await;

    let result = broker
        .handle_packet(
            &a.client_id,
            Packet::Publish(Publish {
                topic: Arc::from("bad/+/topic"),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            }),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_ping() {
    let broker = Broker::new(test_config());
    let mut a = connect(&broker, "a").await;
    broker
        .handle_packet(&a.client_id, Packet::PingReq)
        .await
        .unwrap();
    assert!(matches!(a.recv().await, Packet::PingResp));
}

#[tokio::test]
async fn test_empty_client_id() {
    let broker = Broker::new(test_config());

    // Clean start gets an assigned id
    let (client, _) = connect_with(
        &broker,
        Connect {
            client_id: String::new(),
            clean_start: true,
            protocol_version: ProtocolVersion::V5,
            ..Default::default()
        },
    )
    .await;
    assert!(client.client_id.starts_with("meshmq-"));

    // Non-clean without an id is invalid
    match broker
        .connect(
            Connect {
                client_id: String::new(),
                clean_start: false,
                protocol_version: ProtocolVersion::V5,
                ..Default::default()
            },
            None,
        )
        .await
    {
        ConnectOutcome::Rejected(connack) => {
            assert_eq!(connack.reason_code, ReasonCode::ClientIdNotValid)
        }
        ConnectOutcome::Accepted { .. } => panic!("should be rejected"),
    }
}
