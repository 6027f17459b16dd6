//! Compaction scheduler: turns windows of events into published Parquet
//! segments.
//!
//! Windows move through `pending → processing → dispatched → succeeded`;
//! a processing window that stops heart-beating is marked `stuck` and
//! returned to the queue. Publication is atomic: the segment and its index
//! artifacts are fully written before the namespace manifest advances, so a
//! partial failure leaves only orphans for the vacuum to reclaim.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{CompactionConfig, StorageConfig};
use crate::error::{ParqueError, Result, StorageErrorKind};
use crate::event_log::EventLog;
use crate::manifest::SegmentCatalog;
use crate::object_store::ObjectStore;
use crate::query::SegmentHandle;
use crate::reconstruct;
use crate::segment::{SegmentBuild, SegmentWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Pending,
    Processing,
    Dispatched,
    Succeeded,
    Stuck,
}

/// One compaction work unit: a contiguous event range for a namespace.
#[derive(Debug, Clone)]
pub struct Window {
    pub id: u64,
    pub namespace: String,
    pub from_offset: u64,
    pub to_offset: u64,
    pub state: WindowState,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactorStats {
    pub windows_created: u64,
    pub windows_succeeded: u64,
    pub windows_stuck: u64,
    pub windows_requeued: u64,
    pub segments_written: u64,
    pub events_compacted: u64,
    pub retries: u64,
    pub last_window_duration_ms: u64,
}

pub struct Compactor {
    log: Arc<EventLog>,
    catalog: Arc<SegmentCatalog>,
    store: Arc<dyn ObjectStore>,
    writer: SegmentWriter,
    config: CompactionConfig,

    pending: Mutex<VecDeque<Window>>,
    processing: Mutex<Vec<Window>>,
    stuck_count: AtomicU64,
    next_window_id: AtomicU64,
    stats: Arc<RwLock<CompactorStats>>,
}

impl Compactor {
    pub fn new(
        log: Arc<EventLog>,
        catalog: Arc<SegmentCatalog>,
        store: Arc<dyn ObjectStore>,
        storage_config: StorageConfig,
        config: CompactionConfig,
    ) -> Self {
        Self {
            log,
            catalog,
            store,
            writer: SegmentWriter::new(storage_config),
            config,
            pending: Mutex::new(VecDeque::new()),
            processing: Mutex::new(Vec::new()),
            stuck_count: AtomicU64::new(0),
            next_window_id: AtomicU64::new(0),
            stats: Arc::new(RwLock::new(CompactorStats::default())),
        }
    }

    /// Partition the uncovered event tail of every namespace into windows.
    /// Admission is refused with typed backpressure while any window is
    /// stuck; readers are unaffected.
    pub fn plan_windows(&self) -> Result<usize> {
        let stuck = self.stuck_count.load(Ordering::SeqCst);
        if stuck > 0 {
            return Err(ParqueError::Storage {
                kind: StorageErrorKind::Timeout,
                detail: format!("window queue backpressure: {stuck} stuck window(s)"),
            });
        }

        let mut created = 0;
        for namespace in self.log.namespaces() {
            let covered = self.catalog.covered_offset(&namespace).max(self.queued_to(&namespace));
            let head = self.log.head_offset(&namespace);
            if head <= covered {
                continue;
            }

            let backlog = head - covered;
            let oldest = self
                .log
                .range(&namespace, covered, covered + 1)
                .first()
                .map(|e| e.ts);
            let age_triggered = oldest
                .map(|ts| (Utc::now() - ts).num_seconds() >= self.config.window_max_age_seconds)
                .unwrap_or(false);

            if backlog < self.config.window_size as u64 && !age_triggered {
                continue;
            }

            let mut from = covered;
            while from < head {
                let to = (from + self.config.window_size as u64).min(head);
                let window = Window {
                    id: self.next_window_id.fetch_add(1, Ordering::SeqCst),
                    namespace: namespace.clone(),
                    from_offset: from,
                    to_offset: to,
                    state: WindowState::Pending,
                    created_at: Utc::now(),
                    last_heartbeat: Utc::now(),
                    attempts: 0,
                };
                tracing::debug!(
                    "window {} planned: {namespace} [{from}, {to})",
                    window.id
                );
                self.pending.lock().push_back(window);
                created += 1;
                from = to;
            }
        }

        if created > 0 {
            self.stats.write().windows_created += created as u64;
        }
        Ok(created)
    }

    /// Highest offset already claimed by a queued or in-flight window.
    fn queued_to(&self, namespace: &str) -> u64 {
        let pending_max = self
            .pending
            .lock()
            .iter()
            .filter(|w| w.namespace == namespace)
            .map(|w| w.to_offset)
            .max()
            .unwrap_or(0);
        let processing_max = self
            .processing
            .lock()
            .iter()
            .filter(|w| w.namespace == namespace)
            .map(|w| w.to_offset)
            .max()
            .unwrap_or(0);
        pending_max.max(processing_max)
    }

    /// Run every queued window to completion. Returns how many succeeded.
    pub async fn drain(&self) -> usize {
        let mut succeeded = 0;
        loop {
            // Scope the lock: run_window requeues failed windows.
            let window = self.pending.lock().pop_front();
            let Some(window) = window else { break };
            if self.run_window(window).await.is_ok() {
                succeeded += 1;
            }
        }
        succeeded
    }

    async fn run_window(&self, mut window: Window) -> Result<()> {
        let started = std::time::Instant::now();
        window.state = WindowState::Processing;
        window.last_heartbeat = Utc::now();
        self.processing.lock().push(window.clone());

        let result = self.process(&mut window).await;
        self.processing.lock().retain(|w| w.id != window.id);

        let mut stats = self.stats.write();
        stats.last_window_duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(events) => {
                stats.windows_succeeded += 1;
                stats.segments_written += 1;
                stats.events_compacted += events;
                drop(stats);
                tracing::info!(
                    "✅ window {} compacted: {} [{}, {}) in {}ms",
                    window.id,
                    window.namespace,
                    window.from_offset,
                    window.to_offset,
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                drop(stats);
                window.attempts += 1;
                if window.attempts <= self.config.max_retries {
                    tracing::error!(
                        "window {} failed (attempt {}): {e}; requeueing",
                        window.id,
                        window.attempts
                    );
                    window.state = WindowState::Pending;
                    self.pending.lock().push_back(window);
                } else {
                    tracing::error!(
                        "window {} abandoned after {} attempts: {e}",
                        window.id,
                        window.attempts
                    );
                }
                Err(ParqueError::Internal(format!("window failed: {e}")))
            }
        }
    }

    /// Heartbeat while reconstructing and dispatching one window.
    async fn process(&self, window: &mut Window) -> std::result::Result<u64, ParqueError> {
        let events = self
            .log
            .range(&window.namespace, window.from_offset, window.to_offset);
        if events.is_empty() {
            return Ok(0);
        }
        let event_count = events.len() as u64;

        // Reconstruct the current state of every touched entity as of the
        // window boundary. One pass over the covered prefix groups each
        // entity's full history.
        let touched: BTreeSet<&str> = events.iter().map(|e| e.target.as_str()).collect();
        let mut histories: std::collections::HashMap<String, Vec<crate::event::Event>> =
            std::collections::HashMap::new();
        for event in self
            .log
            .range(&window.namespace, 0, window.to_offset)
        {
            if touched.contains(event.target.as_str()) {
                histories.entry(event.target.clone()).or_default().push(event);
            }
        }
        self.heartbeat(window);

        let mut entities = Vec::with_capacity(histories.len());
        let mut targets: Vec<&String> = histories.keys().collect();
        targets.sort();
        for target in targets {
            if let Some(entity) = reconstruct::fold(&histories[target])? {
                entities.push(entity);
            }
        }
        self.heartbeat(window);

        if entities.is_empty() {
            return Ok(event_count);
        }

        let build = self
            .writer
            .build(&window.namespace, entities, window.to_offset)?;
        window.state = WindowState::Dispatched;
        self.heartbeat(window);

        // Segment and index artifacts must all land before the manifest
        // advances; a failure here orphans them for vacuum.
        self.write_with_retry(&self.catalog.object_path(&build.name), &build.data)
            .await?;
        self.write_with_retry(
            &self.catalog.object_path(&build.bloom_name()),
            &build.bloom.to_bytes(),
        )
        .await?;
        self.write_with_retry(
            &self.catalog.object_path(&build.hash_name()),
            &build.hash.to_bytes(),
        )
        .await?;

        let handle = self.into_handle(&build);
        self.catalog
            .publish(&window.namespace, handle, window.to_offset)
            .await?;

        window.state = WindowState::Succeeded;
        Ok(event_count)
    }

    fn into_handle(&self, build: &SegmentBuild) -> SegmentHandle {
        SegmentHandle {
            name: build.name.clone(),
            object_path: self.catalog.object_path(&build.name),
            meta: build.meta.clone(),
            bloom: Some(Arc::new(build.bloom.clone())),
            hash: Some(Arc::new(build.hash.clone())),
        }
    }

    fn heartbeat(&self, window: &Window) {
        let mut processing = self.processing.lock();
        if let Some(w) = processing.iter_mut().find(|w| w.id == window.id) {
            w.last_heartbeat = Utc::now();
            w.state = window.state;
        }
    }

    /// Transient storage errors retry up to the configured budget.
    async fn write_with_retry(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.write(path, data).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    let backoff = Duration::from_millis(50 * 2u64.pow(attempt.min(6)));
                    tracing::warn!(
                        "retrying write of {path} (attempt {attempt}/{}) after {backoff:?}: {e}",
                        self.config.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark heartbeat-less processing windows as stuck and requeue them.
    pub fn reap_stuck(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stuck_after_seconds);
        let stuck: Vec<Window> = {
            let mut processing = self.processing.lock();
            let (stuck, alive): (Vec<Window>, Vec<Window>) = processing
                .drain(..)
                .partition(|w| w.last_heartbeat < cutoff);
            *processing = alive;
            stuck
        };

        let count = stuck.len();
        if count > 0 {
            let mut stats = self.stats.write();
            stats.windows_stuck += count as u64;
            stats.windows_requeued += count as u64;
            drop(stats);
            self.stuck_count.fetch_add(count as u64, Ordering::SeqCst);
            for mut window in stuck {
                tracing::warn!(
                    "window {} stuck (no heartbeat since {}); requeueing",
                    window.id,
                    window.last_heartbeat
                );
                window.state = WindowState::Pending;
                window.attempts += 1;
                self.pending.lock().push_back(window);
            }
        }
        count
    }

    /// Clear backpressure once stuck windows have been requeued and a pass
    /// completed.
    pub fn clear_backpressure(&self) {
        self.stuck_count.store(0, Ordering::SeqCst);
    }

    /// One scheduler pass: reap stuck windows, plan, drain.
    pub async fn tick(&self) -> Result<usize> {
        self.reap_stuck();
        self.clear_backpressure();
        self.plan_windows()?;
        Ok(self.drain().await)
    }

    pub fn stats(&self) -> CompactorStats {
        (*self.stats.read()).clone()
    }

    pub fn pending_windows(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Background compaction task, driven at a fixed interval until cancelled.
pub struct CompactionTask {
    compactor: Arc<Compactor>,
    interval: Duration,
    cancel: CancellationToken,
}

impl CompactionTask {
    pub fn new(compactor: Arc<Compactor>, interval_seconds: u64, cancel: CancellationToken) -> Self {
        Self {
            compactor,
            interval: Duration::from_secs(interval_seconds.max(1)),
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.cancel.cancelled() => {
                    tracing::debug!("compaction task cancelled");
                    return;
                }
            }
            match self.compactor.tick().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("auto-compaction pass: {n} window(s) compacted"),
                Err(e) => tracing::warn!("auto-compaction pass skipped: {e}"),
            }
        }
    }
}
