//! Configuration
//!
//! TOML-based configuration with support for:
//! - Routing (lock mode, router worker pool size)
//! - Session parameters (queues, expiry, keepalive, inflight limits)
//! - Shared subscription policy
//! - ACL cache bounds
//! - Retained message storage selection
//! - Cluster membership
//!
//! Values layer from built-in defaults, an optional TOML file and
//! `MESHMQ__`-prefixed environment overrides; `${NAME:-fallback}`
//! placeholders in the file expand against the environment before parsing.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Expand `${NAME}` and `${NAME:-fallback}` placeholders against the
/// process environment. Runs over the raw file contents before TOML
/// parsing, so placeholders work in any value position; an unset variable
/// without a fallback expands to the empty string.
fn expand_env_placeholders(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let pattern = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{(?P<name>[^}:]+)(?::-(?P<fallback>[^}]*))?\}")
            .expect("placeholder pattern is well-formed")
    });

    pattern
        .replace_all(content, |captures: &regex::Captures| {
            let name = captures.name("name").map_or("", |m| m.as_str());
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => captures
                    .name("fallback")
                    .map_or(String::new(), |m| m.as_str().to_string()),
            }
        })
        .into_owned()
}

/// Why configuration loading failed
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read
    Read(std::io::Error),
    /// The file contents are not valid TOML
    Toml(toml::de::Error),
    /// Layering defaults, file and environment overrides failed
    Layering(config::ConfigError),
    /// Values parsed but break a constraint the broker relies on
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Toml(e) => write!(f, "configuration is not valid TOML: {}", e),
            ConfigError::Layering(e) => write!(f, "assembling configuration failed: {}", e),
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read(e) => Some(e),
            ConfigError::Toml(e) => Some(e),
            ConfigError::Layering(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Read(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Layering(e)
    }
}

/// Lock scope for wildcard trie updates inside route transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Fine-grained per-key locks; trie updates ride inside the transaction
    #[default]
    Key,
    /// Table-scoped lock taken before the transaction commits
    Tab,
    /// Cluster-wide advisory lock around any wildcard route change
    Global,
}

/// What to do when a session queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming message
    #[default]
    DropNewest,
    /// Evict the oldest queued message
    DropOldest,
    /// Disconnect the slow session
    Disconnect,
}

/// Member selection for shared subscription groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharePolicy {
    Random,
    #[default]
    RoundRobin,
    /// Stable assignment by hash of the publishing client id
    HashClientid,
}

/// Retained message backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetainedStorage {
    #[default]
    Memory,
    Durable,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub routing: RoutingConfig,
    pub session: SessionConfig,
    pub shared_subscription: SharedSubscriptionConfig,
    pub acl: AclConfig,
    pub retained: RetainedConfig,
    pub mqtt: MqttConfig,
    pub limits: LimitsConfig,
    pub cluster: ClusterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Route table and router worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Lock scope for wildcard route changes: key | tab | global
    pub lock_mode: LockMode,
    /// Router worker shards; route mutations hash to a worker (0 = auto)
    pub worker_pool_size: usize,
    /// Deadline for a single route operation, in milliseconds
    pub op_timeout_ms: u64,
    /// Bounded retries before a conflicting mutation surfaces as unavailable
    pub max_retries: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Key,
            worker_pool_size: 0,
            op_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

impl RoutingConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Resolved pool size; 0 means one worker per available core
    pub fn effective_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            self.worker_pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum queued messages per session (backpressure threshold)
    pub queue_max: usize,
    /// Overflow behavior: drop_newest | drop_oldest | disconnect
    pub queue_overflow: OverflowPolicy,
    /// Queue depth above which dispatch stops non-essential deliveries
    pub queue_high_watermark: usize,
    /// Non-clean session retention after disconnect, in seconds
    pub expiry_default: u64,
    /// Default keep alive when the client requests 0, in seconds
    pub default_keep_alive: u16,
    /// Upper bound imposed on client keep alive requests
    pub max_keep_alive: u16,
    /// Expiry/keepalive sweep interval, in seconds
    pub expiry_check_interval: u64,
    /// Seconds before an unacked inflight message is retransmitted
    pub retry_interval: u64,
    /// Retransmissions before the session is disconnected
    pub retry_max: u32,
    /// Maximum inflight QoS 1/2 messages per direction
    pub max_inflight: u16,
    /// Newest queued messages persisted for a non-clean session
    pub persisted_queue_max: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_max: 1_000,
            queue_overflow: OverflowPolicy::DropNewest,
            queue_high_watermark: 800,
            expiry_default: 7_200,
            default_keep_alive: 60,
            max_keep_alive: 65_535,
            expiry_check_interval: 60,
            retry_interval: 30,
            retry_max: 5,
            max_inflight: 32,
            persisted_queue_max: 256,
        }
    }
}

impl SessionConfig {
    pub fn expiry_default_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_default)
    }

    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval)
    }

    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Shared subscription configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SharedSubscriptionConfig {
    /// Group member selection: random | round_robin | hash_clientid
    pub policy: SharePolicy,
}

/// ACL cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Per-session cache capacity (0 disables caching)
    pub cache_max_size: usize,
    /// Entry time-to-live in seconds (0 = no TTL)
    pub cache_ttl: u64,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 32,
            cache_ttl: 60,
        }
    }
}

impl AclConfig {
    pub fn cache_ttl_duration(&self) -> Option<Duration> {
        (self.cache_ttl > 0).then(|| Duration::from_secs(self.cache_ttl))
    }
}

/// Retained store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetainedConfig {
    /// memory | durable
    pub storage: RetainedStorage,
    /// Data directory for durable storage
    pub path: String,
}

impl Default for RetainedConfig {
    fn default() -> Self {
        Self {
            storage: RetainedStorage::Memory,
            path: "data/retained".to_string(),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level granted (0, 1, or 2)
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
        }
    }
}

/// Bounds applied to topics and per-connection buffers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum topic/filter length in bytes
    pub max_topic_length: usize,
    /// Per-connection outbound channel capacity
    pub outbound_channel_capacity: usize,
    /// Receive maximum advertised to clients (inbound flow control)
    pub receive_maximum: u16,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topic_length: 65_535,
            outbound_channel_capacity: 1_024,
            receive_maximum: 1_024,
        }
    }
}

/// Cluster membership configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Stable node identifier; generated when empty
    pub node_id: String,
    /// UDP gossip bind address
    pub gossip_addr: SocketAddr,
    /// TCP address peers connect to for message forwarding
    pub peer_addr: SocketAddr,
    /// Seed node gossip addresses
    pub seeds: Vec<String>,
    /// Gossip interval in milliseconds; also the membership heartbeat
    pub gossip_interval_ms: u64,
    /// Grace period before a dead node's state is dropped, in seconds
    pub dead_node_grace_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            gossip_addr: "0.0.0.0:7946".parse().unwrap(),
            peer_addr: "0.0.0.0:7947".parse().unwrap(),
            seeds: Vec::new(),
            gossip_interval_ms: 1_000,
            dead_node_grace_secs: 3_600,
        }
    }
}

impl ClusterConfig {
    /// The configured node id, or a generated one
    pub fn resolved_node_id(&self) -> String {
        if self.node_id.is_empty() {
            format!("node-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.node_id.clone()
        }
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn dead_node_grace_period(&self) -> Duration {
        Duration::from_secs(self.dead_node_grace_secs)
    }
}

impl Config {
    /// Load configuration, layering defaults, an optional TOML file and
    /// environment overrides (later layers win).
    ///
    /// The environment participates twice: `${NAME:-fallback}` placeholders
    /// inside the file expand before parsing, and `MESHMQ__`-prefixed
    /// variables override individual keys afterwards, with `__` separating
    /// nesting levels (`MESHMQ__ROUTING__LOCK_MODE=global` sets
    /// `routing.lock_mode`). A missing file is not an error; the remaining
    /// layers apply on their own.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("routing.lock_mode", "key")?
            .set_default("routing.worker_pool_size", 0)?
            .set_default("routing.op_timeout_ms", 5_000)?
            .set_default("routing.max_retries", 3)?
            .set_default("session.queue_max", 1_000)?
            .set_default("session.queue_overflow", "drop_newest")?
            .set_default("session.queue_high_watermark", 800)?
            .set_default("session.expiry_default", 7_200)?
            .set_default("session.default_keep_alive", 60)?
            .set_default("session.max_keep_alive", 65_535)?
            .set_default("session.expiry_check_interval", 60)?
            .set_default("session.retry_interval", 30)?
            .set_default("session.retry_max", 5)?
            .set_default("session.max_inflight", 32)?
            .set_default("session.persisted_queue_max", 256)?
            .set_default("shared_subscription.policy", "round_robin")?
            .set_default("acl.cache_max_size", 32)?
            .set_default("acl.cache_ttl", 60)?
            .set_default("retained.storage", "memory")?
            .set_default("retained.path", "data/retained")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.subscription_identifiers", true)?
            .set_default("mqtt.shared_subscriptions", true)?
            .set_default("limits.max_topic_length", 65_535)?
            .set_default("limits.outbound_channel_capacity", 1_024)?
            .set_default("limits.receive_maximum", 1_024)?
            .set_default("cluster.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = expand_env_placeholders(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file, defaults + env only
            }
            Err(e) => return Err(ConfigError::Read(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Invalid(
                "mqtt.max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.session.queue_max == 0 {
            return Err(ConfigError::Invalid(
                "session.queue_max must be positive".to_string(),
            ));
        }
        if self.session.queue_high_watermark > self.session.queue_max {
            return Err(ConfigError::Invalid(
                "session.queue_high_watermark cannot exceed session.queue_max".to_string(),
            ));
        }
        if self.session.max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "session.max_inflight must be positive".to_string(),
            ));
        }
        if self.limits.max_topic_length == 0 || self.limits.max_topic_length > 65_535 {
            return Err(ConfigError::Invalid(
                "limits.max_topic_length must be in 1..=65535".to_string(),
            ));
        }
        if self.cluster.enabled && self.cluster.gossip_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cluster.gossip_interval_ms must be positive".to_string(),
            ));
        }
        if self.retained.storage == RetainedStorage::Durable && self.retained.path.is_empty() {
            return Err(ConfigError::Invalid(
                "retained.path is required for durable storage".to_string(),
            ));
        }
        Ok(())
    }
}
