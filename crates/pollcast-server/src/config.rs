use anyhow::{Context, Result};
use pollcast_cache::{CacheConfig, LockConfig};
use pollcast_core::{HubConfig, LivenessPolicy, MembershipConfig, ServiceConfig, VoteConfig};
use pollcast_mq::{QueueConfig, QueueKeys};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheSection,
    pub lock: LockSection,
    pub queue: QueueSection,
    pub hub: HubSection,
    pub liveness: LivenessSection,
    pub votes: VotesSection,
    pub maintenance: MaintenanceSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/pollcast.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub default_ttl_secs: u64,
    pub null_ttl_secs: u64,
    pub jitter_fraction: f64,
    pub lock_ttl_ms: u64,
    pub double_delete_delay_ms: u64,
    pub prewarm_spread_secs: u64,
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let cache = CacheConfig::default();
        let membership = MembershipConfig::default();
        Self {
            default_ttl_secs: cache.default_ttl.as_secs(),
            null_ttl_secs: cache.null_ttl.as_secs(),
            jitter_fraction: cache.jitter_fraction,
            lock_ttl_ms: cache.lock_ttl.as_millis() as u64,
            double_delete_delay_ms: cache.double_delete_delay.as_millis() as u64,
            prewarm_spread_secs: cache.prewarm_spread.as_secs(),
            bloom_expected_items: membership.expected_items,
            bloom_false_positive_rate: membership.false_positive_rate,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub tries: u32,
    pub retry_delay_ms: u64,
    pub drift_factor: f64,
    pub backoff: bool,
}

impl Default for LockSection {
    fn default() -> Self {
        let lock = LockConfig::default();
        Self {
            tries: lock.tries,
            retry_delay_ms: lock.retry_delay.as_millis() as u64,
            drift_factor: lock.drift_factor,
            backoff: lock.exponential_backoff,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub prefix: String,
    pub poll_interval_ms: u64,
    pub processing_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub scan_interval_secs: u64,
    pub max_in_flight: usize,
    pub seen_ttl_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            prefix: "vote".to_string(),
            poll_interval_ms: queue.poll_interval.as_millis() as u64,
            processing_timeout_secs: queue.processing_timeout.as_secs(),
            retry_delay_secs: queue.retry_delay.as_secs(),
            max_retries: queue.max_retries,
            scan_interval_secs: queue.timeout_scan_interval.as_secs(),
            max_in_flight: queue.max_in_flight,
            seen_ttl_secs: queue.dedup_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub history_per_poll: usize,
    pub history_retention_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub dispatch_buffer: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            max_connections: hub.max_connections,
            outbound_buffer: hub.outbound_buffer,
            history_per_poll: hub.history_per_poll,
            history_retention_secs: hub.history_retention.as_secs(),
            inactivity_timeout_secs: hub.inactivity_timeout.as_secs(),
            dispatch_buffer: hub.dispatch_buffer,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub ping_interval_secs: u64,
    pub read_deadline_secs: u64,
    pub keepalive_ping_interval_secs: u64,
    pub keepalive_read_deadline_secs: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            ping_interval_secs: hub.standard.ping_interval.as_secs(),
            read_deadline_secs: hub.standard.read_deadline.as_secs(),
            keepalive_ping_interval_secs: hub.keepalive.ping_interval.as_secs(),
            keepalive_read_deadline_secs: hub.keepalive.read_deadline.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VotesSection {
    pub per_client_per_second: u32,
    pub burst: u32,
    pub dedupe_by_submitter: bool,
    pub submitter_lock_ttl_secs: u64,
}

impl Default for VotesSection {
    fn default() -> Self {
        let votes = VoteConfig::default();
        Self {
            per_client_per_second: votes.per_client_per_second,
            burst: votes.burst,
            dedupe_by_submitter: votes.dedupe_by_submitter,
            submitter_lock_ttl_secs: votes.submitter_lock_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub sweep_interval_secs: u64,
    pub prewarm_limit: i64,
    pub hot_refresh_interval_secs: u64,
    pub hot_refresh_limit: i64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        let service = ServiceConfig::default();
        Self {
            sweep_interval_secs: service.sweep_interval.as_secs(),
            prewarm_limit: service.prewarm_limit,
            hot_refresh_interval_secs: service.hot_refresh_interval.as_secs(),
            hot_refresh_limit: service.hot_refresh_limit,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!(path, "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let config = toml::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        Ok(config)
    }

    pub fn service_config(&self) -> ServiceConfig {
        let cache = &self.cache;
        let queue = &self.queue;
        let hub = &self.hub;
        let liveness = &self.liveness;

        ServiceConfig {
            cache: CacheConfig {
                default_ttl: Duration::from_secs(cache.default_ttl_secs),
                null_ttl: Duration::from_secs(cache.null_ttl_secs),
                jitter_fraction: cache.jitter_fraction.clamp(0.0, 1.0),
                lock_ttl: Duration::from_millis(cache.lock_ttl_ms),
                double_delete_delay: Duration::from_millis(cache.double_delete_delay_ms),
                prewarm_spread: Duration::from_secs(cache.prewarm_spread_secs),
            },
            lock: LockConfig {
                tries: self.lock.tries.max(1),
                retry_delay: Duration::from_millis(self.lock.retry_delay_ms),
                drift_factor: self.lock.drift_factor,
                exponential_backoff: self.lock.backoff,
            },
            membership: MembershipConfig {
                expected_items: cache.bloom_expected_items.max(1),
                false_positive_rate: cache.bloom_false_positive_rate,
            },
            queue: QueueConfig {
                keys: QueueKeys::with_prefix(&queue.prefix),
                max_retries: queue.max_retries.max(1),
                retry_delay: Duration::from_secs(queue.retry_delay_secs),
                processing_timeout: Duration::from_secs(queue.processing_timeout_secs),
                timeout_scan_interval: Duration::from_secs(queue.scan_interval_secs.max(1)),
                poll_interval: Duration::from_millis(queue.poll_interval_ms.max(1)),
                max_in_flight: queue.max_in_flight.max(1),
                dedup_ttl: Duration::from_secs(queue.seen_ttl_secs),
                ..QueueConfig::default()
            },
            hub: HubConfig {
                max_connections: hub.max_connections,
                outbound_buffer: hub.outbound_buffer,
                history_per_poll: hub.history_per_poll,
                history_retention: Duration::from_secs(hub.history_retention_secs),
                inactivity_timeout: Duration::from_secs(hub.inactivity_timeout_secs),
                dispatch_buffer: hub.dispatch_buffer,
                standard: LivenessPolicy {
                    ping_interval: Duration::from_secs(liveness.ping_interval_secs.max(1)),
                    read_deadline: Duration::from_secs(liveness.read_deadline_secs.max(1)),
                },
                keepalive: LivenessPolicy {
                    ping_interval: Duration::from_secs(liveness.keepalive_ping_interval_secs.max(1)),
                    read_deadline: Duration::from_secs(liveness.keepalive_read_deadline_secs.max(1)),
                },
                ..HubConfig::default()
            },
            votes: VoteConfig {
                per_client_per_second: self.votes.per_client_per_second,
                burst: self.votes.burst,
                dedupe_by_submitter: self.votes.dedupe_by_submitter,
                submitter_lock_ttl: Duration::from_secs(self.votes.submitter_lock_ttl_secs),
            },
            sweep_interval: Duration::from_secs(self.maintenance.sweep_interval_secs.max(1)),
            prewarm_limit: self.maintenance.prewarm_limit,
            hot_refresh_interval: Duration::from_secs(
                self.maintenance.hot_refresh_interval_secs.max(1),
            ),
            hot_refresh_limit: self.maintenance.hot_refresh_limit,
        }
    }
}
