//! Configuration for the consistency layer.
//!
//! Loaded from a TOML file (`--config <path>` or `WAYFARE_CONFIG`), or built
//! from defaults overlaid with `WAYFARE_*` environment variables. Every
//! section falls back to its defaults when omitted from the file; unknown
//! keys are rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Fields compared between row images by default.
pub const DEFAULT_TRACKED_FIELDS: &[&str] =
    &["order_position", "rating", "is_active", "name", "description"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    pub cache: CacheSettings,
    pub ttl_policy: TtlPolicy,
    pub broadcast: BroadcastSettings,
    pub realtime: RealtimeSettings,
    pub remote: RemoteSettings,
    pub live: LiveSettings,
    pub lmdb: LmdbSettings,
}

/// Expiring read cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Durable storage key holding the cache snapshot.
    pub snapshot_key: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            default_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            snapshot_key: "wayfare.query-cache".to_string(),
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Per-operation TTLs for the read-through helpers.
///
/// Aggregate views change rarely and live longer; single-record lookups are
/// refreshed sooner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtlPolicy {
    pub all_records_ms: u64,
    pub top_n_ms: u64,
    pub by_id_ms: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            all_records_ms: 10 * 60 * 1000,
            top_n_ms: 10 * 60 * 1000,
            by_id_ms: 2 * 60 * 1000,
        }
    }
}

impl TtlPolicy {
    pub fn all_records(&self) -> Duration {
        Duration::from_millis(self.all_records_ms)
    }

    pub fn top_n(&self) -> Duration {
        Duration::from_millis(self.top_n_ms)
    }

    pub fn by_id(&self) -> Duration {
        Duration::from_millis(self.by_id_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BroadcastSettings {
    /// Durable storage key holding the latest invalidation signal.
    pub signal_key: String,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            signal_key: "wayfare.sync-trigger".to_string(),
        }
    }
}

/// Change-stream synchronizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeSettings {
    pub tracked_fields: Vec<String>,
    pub ranking_field: String,
    pub ordering_field: String,
    pub status_poll_interval_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            tracked_fields: DEFAULT_TRACKED_FIELDS.iter().map(|f| f.to_string()).collect(),
            ranking_field: "rating".to_string(),
            ordering_field: "order_position".to_string(),
            status_poll_interval_ms: 5_000,
        }
    }
}

impl RealtimeSettings {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveSettings {
    pub ws_endpoint: String,
    pub reconnect: ReconnectConfig,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://localhost:54321/realtime/v1/websocket".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LmdbSettings {
    pub path: Option<PathBuf>,
    pub map_size_mb: usize,
}

impl Default for LmdbSettings {
    fn default() -> Self {
        Self {
            path: None,
            map_size_mb: 16,
        }
    }
}

impl LayerConfig {
    /// Load from the path given by `--config` or `WAYFARE_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: LayerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables.
    ///
    /// Environment variables:
    /// - `WAYFARE_CACHE_MAX_ENTRIES`
    /// - `WAYFARE_CACHE_DEFAULT_TTL_MS`
    /// - `WAYFARE_CACHE_SWEEP_INTERVAL_MS`
    /// - `WAYFARE_REMOTE_BASE_URL`
    /// - `WAYFARE_REMOTE_API_KEY`
    /// - `WAYFARE_LIVE_WS_ENDPOINT`
    /// - `WAYFARE_STATUS_POLL_INTERVAL_MS`
    /// - `WAYFARE_LMDB_PATH`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("WAYFARE_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = v;
        }
        if let Some(v) = env_parse("WAYFARE_CACHE_DEFAULT_TTL_MS") {
            config.cache.default_ttl_ms = v;
        }
        if let Some(v) = env_parse("WAYFARE_CACHE_SWEEP_INTERVAL_MS") {
            config.cache.sweep_interval_ms = v;
        }
        if let Ok(v) = std::env::var("WAYFARE_REMOTE_BASE_URL") {
            config.remote.base_url = v;
        }
        if let Ok(v) = std::env::var("WAYFARE_REMOTE_API_KEY") {
            config.remote.api_key = Some(v).filter(|k| !k.trim().is_empty());
        }
        if let Ok(v) = std::env::var("WAYFARE_LIVE_WS_ENDPOINT") {
            config.live.ws_endpoint = v;
        }
        if let Some(v) = env_parse("WAYFARE_STATUS_POLL_INTERVAL_MS") {
            config.realtime.status_poll_interval_ms = v;
        }
        if let Ok(v) = std::env::var("WAYFARE_LMDB_PATH") {
            config.lmdb.path = Some(PathBuf::from(v));
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be > 0"));
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(invalid("cache.default_ttl_ms", "must be > 0"));
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(invalid("cache.sweep_interval_ms", "must be > 0"));
        }
        if self.cache.snapshot_key.trim().is_empty() {
            return Err(invalid("cache.snapshot_key", "must not be empty"));
        }
        if self.ttl_policy.all_records_ms == 0
            || self.ttl_policy.top_n_ms == 0
            || self.ttl_policy.by_id_ms == 0
        {
            return Err(invalid("ttl_policy", "all TTLs must be > 0"));
        }
        if self.broadcast.signal_key.trim().is_empty() {
            return Err(invalid("broadcast.signal_key", "must not be empty"));
        }
        if self.broadcast.signal_key == self.cache.snapshot_key {
            return Err(invalid(
                "broadcast.signal_key",
                "must differ from cache.snapshot_key",
            ));
        }
        if self.realtime.tracked_fields.is_empty() {
            return Err(invalid("realtime.tracked_fields", "must not be empty"));
        }
        if self.realtime.status_poll_interval_ms == 0 {
            return Err(invalid("realtime.status_poll_interval_ms", "must be > 0"));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(invalid("remote.base_url", "must not be empty"));
        }
        if self.remote.request_timeout_ms == 0 {
            return Err(invalid("remote.request_timeout_ms", "must be > 0"));
        }
        if self.live.ws_endpoint.trim().is_empty() {
            return Err(invalid("live.ws_endpoint", "must not be empty"));
        }
        if self.live.reconnect.initial_ms == 0 {
            return Err(invalid("live.reconnect.initial_ms", "must be > 0"));
        }
        if self.live.reconnect.max_ms < self.live.reconnect.initial_ms {
            return Err(invalid("live.reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.live.reconnect.multiplier < 1.0 {
            return Err(invalid("live.reconnect.multiplier", "must be >= 1.0"));
        }
        if self.lmdb.map_size_mb == 0 {
            return Err(invalid("lmdb.map_size_mb", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("WAYFARE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
