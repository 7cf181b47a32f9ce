//! Error types for Wayfare operations

use thiserror::Error;

/// Durable per-origin storage errors.
///
/// These never escape the cache or broadcaster public APIs: callers log
/// them and carry on as if the stored value were absent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Quota exceeded writing {key}: needs {needed} bytes, limit {limit}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        limit: usize,
    },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Persisted data that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Malformed snapshot under {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("Snapshot encoding failed: {reason}")]
    Encode { reason: String },
}

/// Remote read failures, returned to callers of the read-through helpers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Remote returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Failed to decode remote response: {reason}")]
    Decode { reason: String },

    #[error("No remote data store configured")]
    NotConfigured,

    #[error("Invalid remote setting {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

/// Live channel failures. Logged, never retried by the synchronizer itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to connect live channel for {table}: {reason}")]
    Connect { table: String, reason: String },

    #[error("Live channel protocol error: {reason}")]
    Protocol { reason: String },

    #[error("No async runtime available to drive the live channel")]
    NoRuntime,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or WAYFARE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Wayfare errors.
#[derive(Debug, Error)]
pub enum WayfareError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Wayfare operations.
pub type WayfareResult<T> = Result<T, WayfareError>;

/// Result type alias for durable storage calls.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_quota() {
        let err = StorageError::QuotaExceeded {
            key: "wayfare.query-cache".to_string(),
            needed: 6000,
            limit: 5000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Quota exceeded"));
        assert!(msg.contains("wayfare.query-cache"));
        assert!(msg.contains("6000"));
        assert!(msg.contains("5000"));
    }

    #[test]
    fn test_fetch_error_display_http() {
        let err = FetchError::Http {
            status: 503,
            message: "upstream down".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("503"));
        assert!(msg.contains("upstream down"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "cache.max_entries",
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cache.max_entries"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn test_wayfare_error_from_variants() {
        let storage = WayfareError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, WayfareError::Storage(_)));

        let snapshot = WayfareError::from(SnapshotError::Malformed {
            key: "k".to_string(),
            reason: "eof".to_string(),
        });
        assert!(matches!(snapshot, WayfareError::Snapshot(_)));

        let fetch = WayfareError::from(FetchError::NotConfigured);
        assert!(matches!(fetch, WayfareError::Fetch(_)));

        let channel = WayfareError::from(ChannelError::NoRuntime);
        assert!(matches!(channel, WayfareError::Channel(_)));

        let config = WayfareError::from(ConfigError::MissingConfigPath);
        assert!(matches!(config, WayfareError::Config(_)));
    }
}
