//! meshmq - routing and dispatch core for a clustered MQTT broker
//!
//! Implements the subscription index, cluster route table, wildcard trie,
//! dispatch path and session layer shared by MQTT v3.1, v3.1.1 and v5.0.
//! Transports, the wire codec, auth backends and admin surfaces are
//! external collaborators programming against the types exported here.

pub mod acl;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod router;
pub mod session;
pub mod topic;

pub use acl::{AclAction, AclCache, AclDecision, AllowAll, AuthDecision, AuthProvider, ClientInfo};
pub use broker::{Broker, ConnectOutcome, Message, SessionLink};
pub use cluster::{ClusterManager, GossipMembership, Membership};
pub use config::{Config, LockMode, OverflowPolicy, RetainedStorage, SharePolicy};
pub use hooks::{Hook, HookAction, HookPoint, HookRegistry, HookSpec};
pub use metrics::{BrokerStats, StatsSnapshot};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{Packet, ProtocolVersion, QoS, ReasonCode};
pub use retained::RetainedStore;
pub use router::{Destination, Route, RouteTable, RouterWorkers};
pub use session::{Session, SessionStore};
pub use topic::{topic_matches_filter, SubscriptionStore, TopicTrie};
