use std::path::Path;

use parquedb::config::{validate_path, CompressionCodec, ParqueDbConfig};
use tempfile::TempDir;

#[test]
fn test_default_config_is_valid() {
    let config = ParqueDbConfig::default();
    config.validate().unwrap();
    assert_eq!(config.query.default_concurrency, 4);
    assert_eq!(config.event_log.max_buffered_events, 100);
    assert_eq!(config.snapshot.auto_snapshot_threshold, 100);
    assert_eq!(config.storage.compression, CompressionCodec::Lz4);
    assert_eq!(config.storage.raw_events_prefix, "raw-events");
    assert_eq!(config.storage.parquet_prefix, "logs/workers");
    assert_eq!(config.compaction.max_retries, 3);
    assert_eq!(config.event_log.flush_threshold, 1000);
}

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parquedb.toml");

    let mut config = ParqueDbConfig::default();
    config.storage.compression = CompressionCodec::Snappy;
    config.cache.max_entries = 1234;
    config.fts.k1 = 1.6;
    config.save(&path).unwrap();

    let loaded = ParqueDbConfig::from_file(&path).unwrap();
    assert_eq!(loaded.storage.compression, CompressionCodec::Snappy);
    assert_eq!(loaded.cache.max_entries, 1234);
    assert!((loaded.fts.k1 - 1.6).abs() < f64::EPSILON);
}

#[test]
fn test_partial_config_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.toml");
    std::fs::write(&path, "[cache]\nmax_entries = 7\n").unwrap();

    let loaded = ParqueDbConfig::from_file(&path).unwrap();
    assert_eq!(loaded.cache.max_entries, 7);
    // Everything else falls back to defaults.
    assert_eq!(loaded.query.default_concurrency, 4);
    assert_eq!(loaded.storage.compression, CompressionCodec::Lz4);
}

#[test]
fn test_invalid_config_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");

    std::fs::write(&path, "not valid toml [[").unwrap();
    assert!(ParqueDbConfig::from_file(&path).is_err());

    std::fs::write(&path, "[cache]\nmax_entries = 0\n").unwrap();
    assert!(ParqueDbConfig::from_file(&path).is_err());

    assert!(ParqueDbConfig::from_file(dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_codec_names_case_insensitive() {
    for (name, codec) in [
        ("UNCOMPRESSED", CompressionCodec::Uncompressed),
        ("Snappy", CompressionCodec::Snappy),
        ("zstd", CompressionCodec::Zstd),
        ("GZIP", CompressionCodec::Gzip),
        ("Lz4", CompressionCodec::Lz4),
    ] {
        assert_eq!(CompressionCodec::parse(name).unwrap(), codec);
    }
}

#[test]
fn test_path_validation_guard() {
    let base = Path::new("/srv/parquedb/data");

    // Traversal, control characters and escapes are rejected.
    for bad in [
        "../secrets",
        "a/../../b",
        "seg\0ment",
        "seg\nment",
        "/etc/shadow",
    ] {
        assert!(validate_path(base, bad).is_err(), "{bad:?} should be rejected");
    }

    // Relative paths resolve under the data directory.
    let ok = validate_path(base, "segments/posts/seg-1.parquet").unwrap();
    assert!(ok.starts_with(base));

    // Absolute paths inside the data directory are allowed.
    assert!(validate_path(base, "/srv/parquedb/data/refs/main").is_ok());
}
