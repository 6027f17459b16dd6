//! Configuration for ParqueDB.
//!
//! Strongly named config records with defaulted fields, TOML file support,
//! environment overrides for the operational knobs, and path validation for
//! anything that accepts user-supplied paths.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ParqueError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParqueDbConfig {
    pub storage: StorageConfig,
    pub event_log: EventLogConfig,
    pub snapshot: SnapshotConfig,
    pub cache: CacheConfig,
    pub compaction: CompactionConfig,
    pub fts: FtsConfig,
    pub breaker: CircuitBreakerConfig,
    pub query: QueryConfig,
    pub metrics: MetricsConfig,
}

impl ParqueDbConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ParqueError::storage_io(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ParqueError::Validation {
            field: "config".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ParqueError::Validation {
            field: "config".to_string(),
            reason: e.to_string(),
        })?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ParqueError::storage_io(format!("failed to write config: {e}")))?;
        Ok(())
    }

    /// Apply the environment overrides recognized by the operational tools.
    pub fn apply_env(&mut self) {
        if let Some(value) = env_parse::<u32>("MAX_RETRIES") {
            self.compaction.max_retries = value;
        }
        if let Some(value) = env_parse::<usize>("FLUSH_THRESHOLD") {
            self.event_log.flush_threshold = value;
        }
        if let Ok(value) = std::env::var("COMPRESSION") {
            if let Ok(codec) = CompressionCodec::parse(&value) {
                self.storage.compression = codec;
            } else {
                tracing::warn!("ignoring unknown COMPRESSION value: {value}");
            }
        }
        if let Ok(value) = std::env::var("RAW_EVENTS_PREFIX") {
            self.storage.raw_events_prefix = value;
        }
        if let Ok(value) = std::env::var("PARQUET_PREFIX") {
            self.storage.parquet_prefix = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(ParqueError::Validation {
                field: "cache.max_entries".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.fts.min_word_length > self.fts.max_word_length {
            return Err(ParqueError::Validation {
                field: "fts.min_word_length".to_string(),
                reason: "min_word_length exceeds max_word_length".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.storage.bloom_fpr) || self.storage.bloom_fpr <= 0.0 {
            return Err(ParqueError::Validation {
                field: "storage.bloom_fpr".to_string(),
                reason: "false-positive rate must be in (0, 1)".to_string(),
            });
        }
        if self.query.default_concurrency == 0 {
            return Err(ParqueError::Validation {
                field: "query.default_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base data directory
    pub data_dir: PathBuf,

    /// Parquet compression codec
    pub compression: CompressionCodec,

    /// Bloom filter false-positive rate for segment indexes
    pub bloom_fpr: f64,

    /// Target rows per Parquet row group
    pub row_group_size: usize,

    /// Object-store prefix for the raw event log
    pub raw_events_prefix: String,

    /// Object-store prefix for Parquet segments
    pub parquet_prefix: String,

    /// Orphan retention before vacuum may delete (ms)
    pub retention_ms: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compression: CompressionCodec::Lz4,
            bloom_fpr: 0.01,
            row_group_size: 1000,
            raw_events_prefix: "raw-events".to_string(),
            parquet_prefix: "logs/workers".to_string(),
            retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Parquet compression codec. Names compare case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Uncompressed,
    Snappy,
    Zstd,
    Gzip,
    Lz4,
}

impl CompressionCodec {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => Ok(Self::Uncompressed),
            "snappy" => Ok(Self::Snappy),
            "zstd" => Ok(Self::Zstd),
            "gzip" => Ok(Self::Gzip),
            "lz4" => Ok(Self::Lz4),
            other => Err(ParqueError::Validation {
                field: "compression".to_string(),
                reason: format!("unknown codec `{other}`"),
            }),
        }
    }

    pub fn to_parquet(self) -> parquet::basic::Compression {
        use parquet::basic::{Compression, GzipLevel, ZstdLevel};
        match self {
            Self::Uncompressed => Compression::UNCOMPRESSED,
            Self::Snappy => Compression::SNAPPY,
            Self::Zstd => Compression::ZSTD(ZstdLevel::default()),
            Self::Gzip => Compression::GZIP(GzipLevel::default()),
            Self::Lz4 => Compression::LZ4,
        }
    }
}

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Events buffered in memory before a batch flush
    pub max_buffered_events: usize,

    /// Flush threshold for the persisted tail (FLUSH_THRESHOLD env)
    pub flush_threshold: usize,

    /// Maximum size of a single log segment before rotation (bytes)
    pub max_segment_size: usize,

    /// fsync after each flushed batch
    pub sync_on_write: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: 100,
            flush_threshold: 1000,
            max_segment_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Create a snapshot after this many events for an entity
    pub auto_snapshot_threshold: usize,

    /// Maximum age before creating a new snapshot (seconds)
    pub time_threshold_seconds: i64,

    /// Maximum number of snapshots to keep per entity
    pub max_snapshots_per_entity: usize,

    /// Enable automatic snapshot creation
    pub auto_snapshot: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_snapshot_threshold: 100,
            time_threshold_seconds: 3600,
            max_snapshots_per_entity: 10,
            auto_snapshot: true,
        }
    }
}

/// Entity cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached entities across all namespaces
    pub max_entries: usize,

    /// Optional TTL for cache entries (seconds); 0 disables expiry
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_seconds: 0,
        }
    }
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Events per compaction window before it is size-triggered
    pub window_size: usize,

    /// Age after which a non-empty window is triggered (seconds)
    pub window_max_age_seconds: i64,

    /// Heartbeat-less interval after which a processing window is stuck (seconds)
    pub stuck_after_seconds: i64,

    /// Retry budget for transient storage errors (MAX_RETRIES env)
    pub max_retries: u32,

    /// Interval between scheduler passes (seconds)
    pub tick_interval_seconds: u64,

    /// Enable the background scheduler
    pub auto_compact: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            window_max_age_seconds: 300,
            stuck_after_seconds: 60,
            max_retries: 3,
            tick_interval_seconds: 60,
            auto_compact: true,
        }
    }
}

/// Full-text index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    /// Filter stopwords during tokenization
    pub filter_stopwords: bool,

    /// Apply Porter stemming (English)
    pub stem: bool,

    /// Token length bounds
    pub min_word_length: usize,
    pub max_word_length: usize,

    /// BM25 tuning
    pub k1: f64,
    pub b: f64,

    /// Record token positions (required for phrase queries)
    pub positions: bool,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            filter_stopwords: true,
            stem: false,
            min_word_length: 2,
            max_word_length: 40,
            k1: 1.2,
            b: 0.75,
            positions: true,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Time in `open` before probing with `half-open` (ms)
    pub reset_timeout_ms: u64,

    /// Per-call deadline; timeouts count as failures (ms)
    pub call_timeout_ms: u64,

    /// State-change history ring size
    pub history_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            call_timeout_ms: 10_000,
            history_size: 64,
        }
    }
}

/// Query executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Row groups read concurrently per batch
    pub default_concurrency: usize,

    /// Inbound relations returned before truncation with a continuation token
    pub max_inbound: usize,

    /// `$text` without an FTS index falls back to a linear scan when true;
    /// otherwise the query is rejected
    pub text_scan_fallback: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            max_inbound: 1000,
            text_scan_fallback: true,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Upper bound on label values tracked per labelled metric
    pub max_label_cardinality: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_label_cardinality: 256,
        }
    }
}

/// Validate a user-supplied relative path against the data directory.
///
/// Rejects traversal segments, null bytes, newlines, and absolute paths
/// pointing outside `data_dir`.
pub fn validate_path(data_dir: &Path, candidate: &str) -> Result<PathBuf> {
    let reject = |reason: &str| {
        Err(ParqueError::Validation {
            field: "path".to_string(),
            reason: format!("{reason}: {candidate:?}"),
        })
    };

    if candidate.is_empty() {
        return reject("empty path");
    }
    if candidate.contains('\0') {
        return reject("path contains a null byte");
    }
    if candidate.contains('\n') || candidate.contains('\r') {
        return reject("path contains a newline");
    }

    let path = Path::new(candidate);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return reject("path traversal segment");
    }

    if path.is_absolute() {
        if !path.starts_with(data_dir) {
            return reject("absolute path outside the data directory");
        }
        return Ok(path.to_path_buf());
    }

    Ok(data_dir.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ParqueDbConfig::default().validate().unwrap();
    }

    #[test]
    fn test_codec_parse_case_insensitive() {
        for name in ["SNAPPY", "snappy", "Snappy"] {
            assert_eq!(
                CompressionCodec::parse(name).unwrap(),
                CompressionCodec::Snappy
            );
        }
        assert_eq!(
            CompressionCodec::parse("ZSTD").unwrap(),
            CompressionCodec::Zstd
        );
        assert_eq!(
            CompressionCodec::parse("lz4").unwrap(),
            CompressionCodec::Lz4
        );
        assert!(CompressionCodec::parse("brotli").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("parquedb.toml");

        let mut config = ParqueDbConfig::default();
        config.cache.max_entries = 42;
        config.storage.compression = CompressionCodec::Zstd;
        config.save(&path).unwrap();

        let loaded = ParqueDbConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cache.max_entries, 42);
        assert_eq!(loaded.storage.compression, CompressionCodec::Zstd);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ParqueDbConfig::default();
        config.cache.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = ParqueDbConfig::default();
        config.storage.bloom_fpr = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_path_rejections() {
        let data_dir = Path::new("/var/lib/parquedb");
        assert!(validate_path(data_dir, "../etc/passwd").is_err());
        assert!(validate_path(data_dir, "seg/../../x").is_err());
        assert!(validate_path(data_dir, "bad\0name").is_err());
        assert!(validate_path(data_dir, "bad\nname").is_err());
        assert!(validate_path(data_dir, "/etc/passwd").is_err());
        assert!(validate_path(data_dir, "").is_err());
    }

    #[test]
    fn test_validate_path_accepts_relative_and_inside() {
        let data_dir = Path::new("/var/lib/parquedb");
        assert_eq!(
            validate_path(data_dir, "segments/posts.parquet").unwrap(),
            data_dir.join("segments/posts.parquet")
        );
        assert!(validate_path(data_dir, "/var/lib/parquedb/refs/main").is_ok());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("MAX_RETRIES", "7");
        std::env::set_var("COMPRESSION", "GZIP");
        std::env::set_var("RAW_EVENTS_PREFIX", "events-raw");

        let mut config = ParqueDbConfig::default();
        config.apply_env();
        assert_eq!(config.compaction.max_retries, 7);
        assert_eq!(config.storage.compression, CompressionCodec::Gzip);
        assert_eq!(config.storage.raw_events_prefix, "events-raw");

        std::env::remove_var("MAX_RETRIES");
        std::env::remove_var("COMPRESSION");
        std::env::remove_var("RAW_EVENTS_PREFIX");
    }
}
