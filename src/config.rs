use crate::download::rate_limit::RateLimiters;
use crate::download::selection::SelectionPolicy;
use crate::download::session::{RetryPolicy, SessionConfig};
use crate::download::types::ConnectionSpeed;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_connection_speed() -> ConnectionSpeed {
    ConnectionSpeed::Broadband
}
fn default_chunk_size() -> u64 {
    crate::download::session::DEFAULT_CHUNK_SIZE
}
fn default_min_split_size() -> u64 {
    crate::download::session::MIN_SPLIT_SIZE
}
fn default_min_acceptable_speed() -> u64 {
    // Bytes per second; a victim slower than this loses its tail to a fresh source.
    500
}
fn default_true() -> bool {
    true
}
fn default_selection() -> SelectionPolicy {
    SelectionPolicy::BiasedRandom
}
fn default_hopeless_ratio() -> f64 {
    crate::download::block_state::DEFAULT_HOPELESS_RATIO
}
fn default_max_source_failures() -> u32 {
    5
}
fn default_max_queue_position() -> u32 {
    50
}
fn default_idle_wait_secs() -> u64 {
    5
}
fn default_locate_wait_secs() -> u64 {
    120
}
fn default_max_partial_rounds() -> u32 {
    3
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_push_timeout_secs() -> u64 {
    20
}
fn default_gossip_push_timeout_secs() -> u64 {
    6
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_max_alts() -> usize {
    crate::download::mesh::DEFAULT_MAX_ALTS
}
fn default_failed_retry_secs() -> u64 {
    60
}
fn default_no_ranges_retry_secs() -> u64 {
    300
}
fn default_busy_none_active_secs() -> u64 {
    60
}
fn default_busy_some_active_secs() -> u64 {
    600
}
fn default_abandon_backoff_secs() -> u64 {
    1800
}
fn default_not_found_cooldown_secs() -> u64 {
    3600
}
fn default_min_queue_poll_secs() -> u64 {
    1
}
fn default_max_queue_poll_secs() -> u64 {
    180
}
fn default_persist_every_secs() -> u64 {
    30
}
fn default_max_connections() -> usize {
    64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub swarm: SwarmConfig,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Runtime tuning for each download session.
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.swarm;
        let t = &self.transfer;
        let r = &self.retry;
        SessionConfig {
            swarm_capacity: s.connection_speed.swarm_capacity(),
            default_chunk_size: s.default_chunk_size.max(1),
            min_split_size: s.min_split_size.max(1),
            min_acceptable_speed: s.min_acceptable_speed,
            steal_small_tails: s.steal_small_tails,
            selection: s.selection,
            discard_corrupt: s.discard_corrupt,
            hopeless_ratio: s.hopeless_ratio.clamp(0.0, 1.0),
            max_source_failures: s.max_source_failures.max(1),
            max_queue_position: s.max_queue_position,
            min_queue_poll: Duration::from_secs(t.min_queue_poll_secs),
            max_queue_poll: Duration::from_secs(t.max_queue_poll_secs.max(t.min_queue_poll_secs)),
            idle_wait: Duration::from_secs(s.idle_wait_secs.max(1)),
            locate_wait: Duration::from_secs(s.locate_wait_secs),
            max_partial_rounds: s.max_partial_rounds,
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            push_timeout: Duration::from_secs(t.push_timeout_secs),
            gossip_push_timeout: Duration::from_secs(t.gossip_push_timeout_secs),
            io_timeout: Duration::from_secs(t.io_timeout_secs),
            max_alts: t.max_alts_per_request,
            retry: RetryPolicy {
                failed: Duration::from_secs(r.failed_retry_after_secs),
                no_ranges: Duration::from_secs(r.no_ranges_retry_after_secs),
                busy_none_active: Duration::from_secs(r.busy_retry_none_active_secs),
                busy_some_active: Duration::from_secs(r.busy_retry_some_active_secs),
                abandon: Duration::from_secs(r.abandon_backoff_secs),
                not_found_cooldown: Duration::from_secs(r.not_found_cooldown_secs),
            },
        }
    }

    pub fn rate_limiters(&self) -> RateLimiters {
        RateLimiters::new(
            self.transfer.max_direct_bytes_per_sec,
            self.transfer.max_relayed_bytes_per_sec,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Sets how many workers a session runs at once.
    pub connection_speed: ConnectionSpeed,
    /// Lease size while no hash tree is known.
    pub default_chunk_size: u64,
    pub min_split_size: u64,
    pub min_acceptable_speed: u64,
    pub steal_small_tails: bool,
    pub selection: SelectionPolicy,
    /// Failed chunks are re-downloaded instead of kept.
    pub discard_corrupt: bool,
    /// Share of the file lost to corruption after which the user is asked.
    pub hopeless_ratio: f64,
    pub max_source_failures: u32,
    pub max_queue_position: u32,
    pub idle_wait_secs: u64,
    /// How long a session searches for sources before giving up.
    pub locate_wait_secs: u64,
    pub max_partial_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub connect_timeout_secs: u64,
    pub push_timeout_secs: u64,
    /// Push wait for sources learned through gossip, which are often stale.
    pub gossip_push_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// 0 = unlimited.
    pub max_direct_bytes_per_sec: u64,
    /// 0 = unlimited.
    pub max_relayed_bytes_per_sec: u64,
    pub max_alts_per_request: usize,
    /// A remote queue asking for a shorter or longer poll gets these.
    pub min_queue_poll_secs: u64,
    pub max_queue_poll_secs: u64,
    /// Open transfer connections across all downloads.
    pub max_connections: usize,
    /// TCP port for inbound push connections. 0 = no listener.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub failed_retry_after_secs: u64,
    pub no_ranges_retry_after_secs: u64,
    pub busy_retry_none_active_secs: u64,
    pub busy_retry_some_active_secs: u64,
    pub abandon_backoff_secs: u64,
    pub not_found_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub persist_every_secs: u64,
    /// Resume downloads that were running when the process stopped.
    pub auto_resume: bool,
    /// Answer given when no one is around to decide about corruption.
    pub keep_corrupt: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            connection_speed: default_connection_speed(),
            default_chunk_size: default_chunk_size(),
            min_split_size: default_min_split_size(),
            min_acceptable_speed: default_min_acceptable_speed(),
            steal_small_tails: default_true(),
            selection: default_selection(),
            discard_corrupt: default_true(),
            hopeless_ratio: default_hopeless_ratio(),
            max_source_failures: default_max_source_failures(),
            max_queue_position: default_max_queue_position(),
            idle_wait_secs: default_idle_wait_secs(),
            locate_wait_secs: default_locate_wait_secs(),
            max_partial_rounds: default_max_partial_rounds(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            push_timeout_secs: default_push_timeout_secs(),
            gossip_push_timeout_secs: default_gossip_push_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            max_direct_bytes_per_sec: 0,
            max_relayed_bytes_per_sec: 0,
            max_alts_per_request: default_max_alts(),
            min_queue_poll_secs: default_min_queue_poll_secs(),
            max_queue_poll_secs: default_max_queue_poll_secs(),
            max_connections: default_max_connections(),
            listen_port: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            failed_retry_after_secs: default_failed_retry_secs(),
            no_ranges_retry_after_secs: default_no_ranges_retry_secs(),
            busy_retry_none_active_secs: default_busy_none_active_secs(),
            busy_retry_some_active_secs: default_busy_some_active_secs(),
            abandon_backoff_secs: default_abandon_backoff_secs(),
            not_found_cooldown_secs: default_not_found_cooldown_secs(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            persist_every_secs: default_persist_every_secs(),
            auto_resume: default_true(),
            keep_corrupt: false,
        }
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level from config.toml
    // 3) info
    //
    // Example:
    // RUST_LOG=info,rust_swarm::download=debug
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let cfg: Config = toml::from_str(
            r#"
            [swarm]
            connection_speed = "t3"
            selection = "sequential"

            [retry]
            failed_retry_after_secs = 5
            "#,
        )
        .expect("parse");
        let session = cfg.session_config();
        assert_eq!(session.swarm_capacity, 8);
        assert_eq!(session.selection, SelectionPolicy::Sequential);
        assert_eq!(session.retry.failed, Duration::from_secs(5));
        assert_eq!(session.retry.busy_some_active, Duration::from_secs(600));
        assert_eq!(session.default_chunk_size, 100_000);
        assert_eq!(session.min_queue_poll, Duration::from_secs(1));
        assert_eq!(session.max_queue_poll, Duration::from_secs(180));
        assert_eq!(cfg.general.data_dir, "data");
    }

    #[test]
    fn defaults_roundtrip_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).expect("serialize");
        let back: Config = toml::from_str(&text).expect("parse");
        assert_eq!(back.swarm.max_queue_position, 50);
        assert!(back.service.auto_resume);
        assert_eq!(back.session_config().swarm_capacity, 6);
    }
}
