use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::EventLogConfig;
use crate::entity::EntityId;
use crate::error::{EventErrorKind, ParqueError, Result};
use crate::event::Event;

/// Append-only event log: every mutation becomes a durable fact before it is
/// acknowledged. Events live in rotated JSON-line segments on disk and in a
/// per-namespace in-memory tail for reads.
pub struct EventLog {
    /// Directory where log segments are stored
    log_dir: PathBuf,

    /// Current active segment
    current_segment: Mutex<LogSegment>,

    /// Records buffered since the last flush
    buffer: Mutex<Vec<LogRecord>>,

    /// In-memory tail, per namespace, ordered by offset
    namespaces: RwLock<HashMap<String, Vec<Event>>>,

    /// Configuration
    config: EventLogConfig,

    /// Statistics
    stats: Arc<RwLock<EventLogStats>>,

    /// Rotation counter for segment filenames
    segment_seq: Mutex<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventLogStats {
    pub total_appended: u64,
    pub total_bytes_written: u64,
    pub segments_rotated: u64,
    pub buffered_events: usize,
    pub recovery_count: u64,
    pub corrupted_discarded: u64,
}

/// One durable log record: the event plus its namespace offset and a
/// checksum for recovery-time integrity verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    namespace: String,
    offset: u64,
    event: Event,
    checksum: u32,
}

impl LogRecord {
    fn new(namespace: String, offset: u64, event: Event) -> Self {
        let mut record = Self {
            namespace,
            offset,
            event,
            checksum: 0,
        };
        record.checksum = record.calculate_checksum();
        record
    }

    fn calculate_checksum(&self) -> u32 {
        let payload = serde_json::to_string(&self.event).unwrap_or_default();
        crc32fast::hash(format!("{}:{}:{}", self.namespace, self.offset, payload).as_bytes())
    }

    fn verify(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }
}

struct LogSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    size: usize,
}

impl LogSegment {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| write_failed(format!("failed to open log segment: {e}")))?;
        let size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size,
        })
    }

    fn write_records(&mut self, records: &[LogRecord], sync: bool) -> Result<usize> {
        let mut bytes = 0;
        for record in records {
            let line = serde_json::to_string(record)?;
            self.writer
                .write_all(line.as_bytes())
                .and_then(|_| self.writer.write_all(b"\n"))
                .map_err(|e| write_failed(format!("failed to write log record: {e}")))?;
            bytes += line.len() + 1;
        }
        self.writer
            .flush()
            .map_err(|e| write_failed(format!("failed to flush log: {e}")))?;
        if sync {
            self.writer
                .get_ref()
                .sync_all()
                .map_err(|e| write_failed(format!("failed to sync log: {e}")))?;
        }
        self.size += bytes;
        Ok(bytes)
    }
}

fn write_failed(detail: String) -> ParqueError {
    tracing::error!("{detail}");
    ParqueError::Event {
        operation: detail,
        entity_id: None,
        kind: EventErrorKind::WriteFailed,
    }
}

impl EventLog {
    /// Open (or create) the log, recovering the tail from disk.
    pub fn open(log_dir: impl Into<PathBuf>, config: EventLogConfig) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)
            .map_err(|e| write_failed(format!("failed to create log directory: {e}")))?;

        let segment_paths = Self::list_segments(&log_dir)?;
        let next_seq = segment_paths.len() as u64;

        let log = Self {
            current_segment: Mutex::new(LogSegment::open(Self::segment_path(
                &log_dir, next_seq,
            ))?),
            log_dir,
            buffer: Mutex::new(Vec::new()),
            namespaces: RwLock::new(HashMap::new()),
            config,
            stats: Arc::new(RwLock::new(EventLogStats::default())),
            segment_seq: Mutex::new(next_seq),
        };
        log.recover(&segment_paths)?;
        Ok(log)
    }

    fn segment_path(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("events-{seq:016x}.log"))
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| write_failed(format!("failed to read log directory: {e}")))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("events-") && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();
        segments.sort();
        Ok(segments)
    }

    /// Replay all on-disk segments into the in-memory tail. A corrupt record
    /// in the last segment discards everything after the last intact event;
    /// corruption in earlier segments skips the record.
    fn recover(&self, segment_paths: &[PathBuf]) -> Result<()> {
        let mut recovered = 0u64;
        let mut discarded = 0u64;

        for (idx, path) in segment_paths.iter().enumerate() {
            let is_last = idx + 1 == segment_paths.len();
            let file = File::open(path)
                .map_err(|e| write_failed(format!("failed to open segment for recovery: {e}")))?;

            for (line_num, line) in BufReader::new(file).lines().enumerate() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("unreadable log line at {path:?}:{}: {e}", line_num + 1);
                        discarded += 1;
                        if is_last {
                            break;
                        }
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(record) if record.verify() => {
                        self.namespaces
                            .write()
                            .entry(record.namespace)
                            .or_default()
                            .push(record.event);
                        recovered += 1;
                    }
                    _ => {
                        tracing::warn!(
                            "corrupt log record at {path:?}:{} (discarding{})",
                            line_num + 1,
                            if is_last { " tail" } else { "" }
                        );
                        discarded += 1;
                        if is_last {
                            break;
                        }
                    }
                }
            }
        }

        let mut stats = self.stats.write();
        stats.recovery_count += 1;
        stats.corrupted_discarded += discarded;
        stats.total_appended = recovered;
        drop(stats);

        if recovered > 0 || discarded > 0 {
            tracing::info!(
                "✅ event log recovery complete: {recovered} events, {discarded} discarded"
            );
        }
        Ok(())
    }

    /// Append an event. The event is immediately visible to readers; it is
    /// durable once its batch flushes, which happens here whenever the
    /// buffer reaches `max_buffered_events`.
    pub fn append(&self, event: Event) -> Result<u64> {
        let namespace = event.namespace().to_string();

        let offset = {
            let mut namespaces = self.namespaces.write();
            let tail = namespaces.entry(namespace.clone()).or_default();
            let offset = tail.len() as u64;
            tail.push(event.clone());
            offset
        };

        let flush_now = {
            let mut buffer = self.buffer.lock();
            buffer.push(LogRecord::new(namespace, offset, event));
            buffer.len() >= self.config.max_buffered_events
        };

        {
            let mut stats = self.stats.write();
            stats.total_appended += 1;
            stats.buffered_events = self.buffer.lock().len();
        }

        if flush_now {
            self.flush()?;
        }
        Ok(offset)
    }

    /// Flush the buffered batch to the active segment. Atomic per batch: the
    /// records are written and synced together.
    pub fn flush(&self) -> Result<()> {
        let records: Vec<LogRecord> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if records.is_empty() {
            return Ok(());
        }

        let bytes = {
            let mut segment = self.current_segment.lock();
            segment.write_records(&records, self.config.sync_on_write)?
        };

        let mut stats = self.stats.write();
        stats.total_bytes_written += bytes as u64;
        stats.buffered_events = 0;
        drop(stats);

        let should_rotate = self.current_segment.lock().size >= self.config.max_segment_size;
        if should_rotate {
            self.rotate()?;
        }

        tracing::debug!("flushed {} event(s) to the log", records.len());
        Ok(())
    }

    fn rotate(&self) -> Result<()> {
        let mut seq = self.segment_seq.lock();
        *seq += 1;
        let path = Self::segment_path(&self.log_dir, *seq);
        drop(seq);

        tracing::info!("🔄 rotating event log to {path:?}");
        let new_segment = LogSegment::open(path)?;
        *self.current_segment.lock() = new_segment;
        self.stats.write().segments_rotated += 1;
        Ok(())
    }

    /// Events for a namespace in `[from_offset, to_offset)`, ordered by
    /// offset. Finite and restartable: the same range yields the same slice.
    pub fn range(&self, namespace: &str, from_offset: u64, to_offset: u64) -> Vec<Event> {
        let namespaces = self.namespaces.read();
        let Some(tail) = namespaces.get(namespace) else {
            return Vec::new();
        };
        let from = (from_offset as usize).min(tail.len());
        let to = (to_offset as usize).min(tail.len());
        tail[from..to].to_vec()
    }

    /// Streaming variant of [`EventLog::range`] for callers that consume the
    /// sequence lazily. Restartable: the snapshot is taken at call time.
    pub fn range_stream(
        &self,
        namespace: &str,
        from_offset: u64,
        to_offset: u64,
    ) -> impl tokio_stream::Stream<Item = Event> {
        tokio_stream::iter(self.range(namespace, from_offset, to_offset))
    }

    /// All events for one entity, in append order.
    pub fn entity_events(&self, entity: &EntityId) -> Vec<Event> {
        let namespaces = self.namespaces.read();
        namespaces
            .get(&entity.namespace)
            .map(|tail| {
                tail.iter()
                    .filter(|event| event.touches(entity))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Offset of the first event strictly after `timestamp` — i.e. replaying
    /// `range(ns, 0, position_at(..))` reproduces the state at `timestamp`.
    pub fn position_at(&self, namespace: &str, timestamp: DateTime<Utc>) -> u64 {
        let namespaces = self.namespaces.read();
        let Some(tail) = namespaces.get(namespace) else {
            return 0;
        };
        // Events are in append order, which is non-decreasing ts order.
        tail.partition_point(|event| event.ts <= timestamp) as u64
    }

    /// Next offset (== number of events) for a namespace.
    pub fn head_offset(&self, namespace: &str) -> u64 {
        self.namespaces
            .read()
            .get(namespace)
            .map(|tail| tail.len() as u64)
            .unwrap_or(0)
    }

    /// All namespaces with at least one event.
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> EventLogStats {
        let mut stats = (*self.stats.read()).clone();
        stats.buffered_events = self.buffer.lock().len();
        stats
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush event log on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn post(n: u32) -> EntityId {
        EntityId::new("posts", format!("p{n}"))
    }

    fn log(dir: &TempDir) -> EventLog {
        EventLog::open(dir.path(), EventLogConfig::default()).unwrap()
    }

    #[test]
    fn test_append_returns_dense_offsets() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        for i in 0..5 {
            let offset = log
                .append(Event::create(&post(i), json!({"n": i}), None))
                .unwrap();
            assert_eq!(offset, i as u64);
        }
        let other = log
            .append(Event::create(&EntityId::new("users", "u1"), json!({}), None))
            .unwrap();
        assert_eq!(other, 0, "offsets are dense per namespace");
    }

    #[test]
    fn test_append_visible_to_range_and_entity_events() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        log.append(Event::create(&post(1), json!({"a": 1}), None))
            .unwrap();
        log.append(Event::update(&post(1), None, json!({"$set": {"a": 2}}), None))
            .unwrap();
        log.append(Event::create(&post(2), json!({}), None)).unwrap();

        assert_eq!(log.range("posts", 0, 10).len(), 3);
        assert_eq!(log.range("posts", 1, 2).len(), 1);
        assert_eq!(log.entity_events(&post(1)).len(), 2);
    }

    #[test]
    fn test_recovery_restores_tail() {
        let dir = TempDir::new().unwrap();
        {
            let log = log(&dir);
            for i in 0..10 {
                log.append(Event::create(&post(i), json!({"n": i}), None))
                    .unwrap();
            }
            log.flush().unwrap();
        }

        let reopened = log(&dir);
        assert_eq!(reopened.head_offset("posts"), 10);
        assert_eq!(reopened.range("posts", 0, 100).len(), 10);
    }

    #[test]
    fn test_recovery_discards_corrupt_tail() {
        let dir = TempDir::new().unwrap();
        {
            let log = log(&dir);
            for i in 0..3 {
                log.append(Event::create(&post(i), json!({"n": i}), None))
                    .unwrap();
            }
            log.flush().unwrap();
        }

        // Corrupt the tail of the newest segment.
        let mut segments = EventLog::list_segments(dir.path()).unwrap();
        let last = segments.pop().unwrap();
        let mut content = fs::read_to_string(&last).unwrap();
        content.push_str("{\"namespace\":\"posts\",garbage\n");
        fs::write(&last, content).unwrap();

        let reopened = log(&dir);
        assert_eq!(reopened.head_offset("posts"), 3);
        assert!(reopened.stats().corrupted_discarded > 0);
    }

    #[test]
    fn test_position_at_brackets_timestamps() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        let before = Utc::now();
        log.append(Event::create(&post(1), json!({}), None)).unwrap();
        log.append(Event::create(&post(2), json!({}), None)).unwrap();
        let after = Utc::now();

        assert_eq!(log.position_at("posts", before), 0);
        assert_eq!(log.position_at("posts", after), 2);
    }

    #[tokio::test]
    async fn test_range_stream_matches_range() {
        use tokio_stream::StreamExt;

        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        for i in 0..5 {
            log.append(Event::create(&post(i), json!({"n": i}), None))
                .unwrap();
        }

        let streamed: Vec<Event> = log.range_stream("posts", 1, 4).collect().await;
        let ranged = log.range("posts", 1, 4);
        assert_eq!(streamed.len(), 3);
        assert_eq!(
            streamed.iter().map(|e| &e.id).collect::<Vec<_>>(),
            ranged.iter().map(|e| &e.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rotation() {
        let dir = TempDir::new().unwrap();
        let config = EventLogConfig {
            max_segment_size: 256,
            max_buffered_events: 1,
            ..Default::default()
        };
        let log = EventLog::open(dir.path(), config).unwrap();
        for i in 0..20 {
            log.append(Event::create(&post(i), json!({"n": i}), None))
                .unwrap();
        }
        assert!(log.stats().segments_rotated > 0);
    }
}
