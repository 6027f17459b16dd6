use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ParqueError;

/// Background task types. Bounded on purpose: every fire-and-forget task in
/// the engine is one of these, so failure counters stay low-cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    AutoSnapshot,
    PeriodicFlush,
    CacheCleanup,
    IndexUpdate,
    BackgroundRevalidation,
    Compaction,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoSnapshot => "auto-snapshot",
            Self::PeriodicFlush => "periodic-flush",
            Self::CacheCleanup => "cache-cleanup",
            Self::IndexUpdate => "index-update",
            Self::BackgroundRevalidation => "background-revalidation",
            Self::Compaction => "compaction",
        }
    }
}

/// One captured background failure.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub kind: TaskKind,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounters {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundStats {
    pub counters: HashMap<String, TaskCounters>,
    pub queued_failures: usize,
}

/// Bounded error queue capacity; the oldest failure is dropped on overflow.
const FAILURE_QUEUE_SIZE: usize = 100;

/// Fire-and-forget task runner. Tasks are isolated: an error never reaches
/// the caller; it lands in the bounded failure queue and the counters.
pub struct BackgroundRunner {
    failures: Arc<ArrayQueue<TaskFailure>>,
    counters: Arc<RwLock<HashMap<TaskKind, TaskCounters>>>,
    cancel: CancellationToken,
}

impl BackgroundRunner {
    pub fn new() -> Self {
        Self {
            failures: Arc::new(ArrayQueue::new(FAILURE_QUEUE_SIZE)),
            counters: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Token handed to long-running tasks; cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a task. Pending work is dropped when the runner shuts down.
    pub fn spawn<F>(&self, kind: TaskKind, task: F)
    where
        F: std::future::Future<Output = Result<(), ParqueError>> + Send + 'static,
    {
        self.counters.write().entry(kind).or_default().started += 1;

        let failures = Arc::clone(&self.failures);
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = task => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            match outcome {
                Some(Ok(())) => {
                    counters.write().entry(kind).or_default().succeeded += 1;
                }
                Some(Err(error)) => {
                    tracing::warn!("background task {} failed: {error}", kind.as_str());
                    counters.write().entry(kind).or_default().failed += 1;
                    let _ = failures.force_push(TaskFailure {
                        kind,
                        error: error.to_string(),
                        at: Utc::now(),
                    });
                }
                None => {
                    tracing::debug!("background task {} cancelled", kind.as_str());
                }
            }
        });
    }

    /// Drain every queued failure, oldest first.
    pub fn drain_failures(&self) -> Vec<TaskFailure> {
        let mut drained = Vec::new();
        while let Some(failure) = self.failures.pop() {
            drained.push(failure);
        }
        drained
    }

    pub fn counters(&self, kind: TaskKind) -> TaskCounters {
        self.counters.read().get(&kind).copied().unwrap_or_default()
    }

    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(kind, counters)| (kind.as_str().to_string(), *counters))
                .collect(),
            queued_failures: self.failures.len(),
        }
    }

    /// Stop accepting progress from in-flight tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}
