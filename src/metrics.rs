use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::config::MetricsConfig;

/// Centralized Prometheus metrics registry for ParqueDB.
///
/// Label values flowing from user data (namespaces, task kinds) are bounded
/// by `max_label_cardinality`; overflow lands on the `_other` label.
pub struct MetricsRegistry {
    registry: Registry,

    // Mutation metrics
    pub mutations_total: IntCounterVec,
    pub mutation_duration_seconds: Histogram,
    pub mutation_errors_total: IntCounter,

    // Event log metrics
    pub events_appended_total: IntCounter,
    pub event_log_flushes_total: IntCounter,
    pub event_log_buffered: IntGauge,

    // Query metrics
    pub queries_total: IntCounterVec,
    pub query_duration_seconds: HistogramVec,
    pub query_rows_scanned: IntCounterVec,
    pub query_early_terminations: IntCounter,

    // Cache metrics
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub cache_evictions_total: IntCounter,
    pub cache_entries: IntGauge,

    // Segment / compaction metrics
    pub segments_written_total: IntCounter,
    pub compaction_windows_total: IntCounterVec,
    pub compaction_duration_seconds: Histogram,
    pub segment_bytes_written: IntCounter,

    // Snapshot metrics
    pub snapshots_created_total: IntCounter,

    // Relationship metrics
    pub relationship_links_total: IntCounter,
    pub relationship_unlinks_total: IntCounter,

    // Storage / breaker metrics
    pub storage_calls_total: IntCounterVec,
    pub storage_failures_total: IntCounterVec,
    pub circuit_open_total: IntCounterVec,

    // Background task metrics
    pub background_tasks_total: IntCounterVec,
    pub background_failures_total: IntCounterVec,

    /// Distinct user-derived label values seen so far
    label_guard: Mutex<HashSet<String>>,
    max_label_cardinality: usize,
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Arc<Self> {
        let registry = Registry::new();

        let mutations_total = IntCounterVec::new(
            Opts::new("parquedb_mutations_total", "Total mutations by operation"),
            &["op"],
        )
        .unwrap();

        let mutation_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "parquedb_mutation_duration_seconds",
            "Mutation duration in seconds",
        ))
        .unwrap();

        let mutation_errors_total = IntCounter::with_opts(Opts::new(
            "parquedb_mutation_errors_total",
            "Total mutation errors",
        ))
        .unwrap();

        let events_appended_total = IntCounter::with_opts(Opts::new(
            "parquedb_events_appended_total",
            "Total events appended to the log",
        ))
        .unwrap();

        let event_log_flushes_total = IntCounter::with_opts(Opts::new(
            "parquedb_event_log_flushes_total",
            "Event log batch flushes",
        ))
        .unwrap();

        let event_log_buffered = IntGauge::with_opts(Opts::new(
            "parquedb_event_log_buffered",
            "Events buffered awaiting flush",
        ))
        .unwrap();

        let queries_total = IntCounterVec::new(
            Opts::new("parquedb_queries_total", "Total queries by namespace"),
            &["namespace"],
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "parquedb_query_duration_seconds",
                "Query duration in seconds",
            ),
            &["namespace"],
        )
        .unwrap();

        let query_rows_scanned = IntCounterVec::new(
            Opts::new("parquedb_query_rows_scanned", "Rows scanned by queries"),
            &["namespace"],
        )
        .unwrap();

        let query_early_terminations = IntCounter::with_opts(Opts::new(
            "parquedb_query_early_terminations",
            "Queries that stopped before scanning every row group",
        ))
        .unwrap();

        let cache_hits_total =
            IntCounter::with_opts(Opts::new("parquedb_cache_hits_total", "Entity cache hits"))
                .unwrap();

        let cache_misses_total = IntCounter::with_opts(Opts::new(
            "parquedb_cache_misses_total",
            "Entity cache misses",
        ))
        .unwrap();

        let cache_evictions_total = IntCounter::with_opts(Opts::new(
            "parquedb_cache_evictions_total",
            "Entity cache evictions",
        ))
        .unwrap();

        let cache_entries = IntGauge::with_opts(Opts::new(
            "parquedb_cache_entries",
            "Entities currently cached",
        ))
        .unwrap();

        let segments_written_total = IntCounter::with_opts(Opts::new(
            "parquedb_segments_written_total",
            "Parquet segments written",
        ))
        .unwrap();

        let compaction_windows_total = IntCounterVec::new(
            Opts::new(
                "parquedb_compaction_windows_total",
                "Compaction windows by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let compaction_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "parquedb_compaction_duration_seconds",
            "Compaction window duration in seconds",
        ))
        .unwrap();

        let segment_bytes_written = IntCounter::with_opts(Opts::new(
            "parquedb_segment_bytes_written",
            "Bytes written to Parquet segments",
        ))
        .unwrap();

        let snapshots_created_total = IntCounter::with_opts(Opts::new(
            "parquedb_snapshots_created_total",
            "Entity snapshots created",
        ))
        .unwrap();

        let relationship_links_total = IntCounter::with_opts(Opts::new(
            "parquedb_relationship_links_total",
            "Relationship edges added",
        ))
        .unwrap();

        let relationship_unlinks_total = IntCounter::with_opts(Opts::new(
            "parquedb_relationship_unlinks_total",
            "Relationship edges removed",
        ))
        .unwrap();

        let storage_calls_total = IntCounterVec::new(
            Opts::new("parquedb_storage_calls_total", "Object store calls by op"),
            &["op"],
        )
        .unwrap();

        let storage_failures_total = IntCounterVec::new(
            Opts::new(
                "parquedb_storage_failures_total",
                "Object store failures by op",
            ),
            &["op"],
        )
        .unwrap();

        let circuit_open_total = IntCounterVec::new(
            Opts::new(
                "parquedb_circuit_open_total",
                "Circuit breaker open transitions by op",
            ),
            &["op"],
        )
        .unwrap();

        let background_tasks_total = IntCounterVec::new(
            Opts::new(
                "parquedb_background_tasks_total",
                "Background tasks started by kind",
            ),
            &["kind"],
        )
        .unwrap();

        let background_failures_total = IntCounterVec::new(
            Opts::new(
                "parquedb_background_failures_total",
                "Background task failures by kind",
            ),
            &["kind"],
        )
        .unwrap();

        for collector in [
            Box::new(mutations_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(mutation_duration_seconds.clone()),
            Box::new(mutation_errors_total.clone()),
            Box::new(events_appended_total.clone()),
            Box::new(event_log_flushes_total.clone()),
            Box::new(event_log_buffered.clone()),
            Box::new(queries_total.clone()),
            Box::new(query_duration_seconds.clone()),
            Box::new(query_rows_scanned.clone()),
            Box::new(query_early_terminations.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(cache_evictions_total.clone()),
            Box::new(cache_entries.clone()),
            Box::new(segments_written_total.clone()),
            Box::new(compaction_windows_total.clone()),
            Box::new(compaction_duration_seconds.clone()),
            Box::new(segment_bytes_written.clone()),
            Box::new(snapshots_created_total.clone()),
            Box::new(relationship_links_total.clone()),
            Box::new(relationship_unlinks_total.clone()),
            Box::new(storage_calls_total.clone()),
            Box::new(storage_failures_total.clone()),
            Box::new(circuit_open_total.clone()),
            Box::new(background_tasks_total.clone()),
            Box::new(background_failures_total.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Arc::new(Self {
            registry,
            mutations_total,
            mutation_duration_seconds,
            mutation_errors_total,
            events_appended_total,
            event_log_flushes_total,
            event_log_buffered,
            queries_total,
            query_duration_seconds,
            query_rows_scanned,
            query_early_terminations,
            cache_hits_total,
            cache_misses_total,
            cache_evictions_total,
            cache_entries,
            segments_written_total,
            compaction_windows_total,
            compaction_duration_seconds,
            segment_bytes_written,
            snapshots_created_total,
            relationship_links_total,
            relationship_unlinks_total,
            storage_calls_total,
            storage_failures_total,
            circuit_open_total,
            background_tasks_total,
            background_failures_total,
            label_guard: Mutex::new(HashSet::new()),
            max_label_cardinality: config.max_label_cardinality,
        })
    }

    /// Bound a user-derived label value. Values beyond the configured
    /// cardinality collapse to `_other`.
    pub fn bounded_label<'a>(&self, value: &'a str) -> &'a str {
        let mut seen = self.label_guard.lock();
        if seen.contains(value) {
            return value;
        }
        if seen.len() >= self.max_label_cardinality {
            return "_other";
        }
        seen.insert(value.to_string());
        value
    }

    /// Export all metrics in Prometheus text format.
    pub fn export_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
