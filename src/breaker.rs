use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::error::{ParqueError, Result, StorageErrorKind};
use crate::object_store::{ObjectMeta, ObjectStore};

/// Circuit state machine: `closed → open` after `failure_threshold`
/// consecutive errors, `open → half-open` after `reset_timeout_ms`,
/// `half-open → closed` on one success (back to `open` on failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Storage operations get independent breakers so a failing write path
/// cannot take down reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOp {
    Read,
    Write,
    List,
    Delete,
}

const ALL_OPS: [StoreOp; 4] = [StoreOp::Read, StoreOp::Write, StoreOp::List, StoreOp::Delete];

/// One recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub op: StoreOp,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub states: Vec<(StoreOp, BreakerState)>,
    pub total_failures: u64,
    pub total_fast_failures: u64,
    pub total_timeouts: u64,
    pub state_changes: usize,
}

struct OpBreaker {
    op: StoreOp,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl OpBreaker {
    fn new(op: StoreOp) -> Self {
        Self {
            op,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Gate a call. Returns the transition if `open` rolled over to
    /// `half-open`, or an error while the circuit stays open.
    fn admit(&mut self, reset_timeout: Duration) -> std::result::Result<Option<StateChange>, ParqueError> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(None),
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= reset_timeout {
                    Ok(Some(self.transition(BreakerState::HalfOpen)))
                } else {
                    Err(ParqueError::Storage {
                        kind: StorageErrorKind::CircuitOpen,
                        detail: format!("{:?} circuit is open", self.op),
                    })
                }
            }
        }
    }

    fn on_success(&mut self) -> Option<StateChange> {
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::HalfOpen => Some(self.transition(BreakerState::Closed)),
            _ => None,
        }
    }

    fn on_failure(&mut self, threshold: u32) -> Option<StateChange> {
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::HalfOpen => Some(self.transition(BreakerState::Open)),
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                Some(self.transition(BreakerState::Open))
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: BreakerState) -> StateChange {
        let change = StateChange {
            op: self.op,
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.opened_at = matches!(to, BreakerState::Open).then(Instant::now);
        change
    }
}

/// Aggregates breaker health: bounded state-change history plus subscribers
/// notified on every transition.
pub struct BreakerMonitor {
    history: RwLock<VecDeque<StateChange>>,
    subscribers: RwLock<Vec<Box<dyn Fn(&StateChange) + Send + Sync>>>,
    history_size: usize,
}

impl BreakerMonitor {
    fn new(history_size: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(history_size)),
            subscribers: RwLock::new(Vec::new()),
            history_size,
        }
    }

    pub fn subscribe(&self, subscriber: Box<dyn Fn(&StateChange) + Send + Sync>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn history(&self) -> Vec<StateChange> {
        self.history.read().iter().cloned().collect()
    }

    fn record(&self, change: StateChange) {
        tracing::info!(
            "circuit {:?}: {:?} → {:?}",
            change.op,
            change.from,
            change.to
        );
        {
            let mut history = self.history.write();
            if history.len() == self.history_size {
                history.pop_front();
            }
            history.push_back(change.clone());
        }
        for subscriber in self.subscribers.read().iter() {
            subscriber(&change);
        }
    }
}

/// Wraps any [`ObjectStore`] with per-operation circuit breakers and
/// per-call deadlines. Timeouts count as failures.
pub struct CircuitBreakerStore {
    inner: Arc<dyn ObjectStore>,
    breakers: [Mutex<OpBreaker>; 4],
    monitor: Arc<BreakerMonitor>,
    config: CircuitBreakerConfig,
    counters: Mutex<Counters>,
}

#[derive(Default)]
struct Counters {
    failures: u64,
    fast_failures: u64,
    timeouts: u64,
}

impl CircuitBreakerStore {
    pub fn new(inner: Arc<dyn ObjectStore>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breakers: [
                Mutex::new(OpBreaker::new(StoreOp::Read)),
                Mutex::new(OpBreaker::new(StoreOp::Write)),
                Mutex::new(OpBreaker::new(StoreOp::List)),
                Mutex::new(OpBreaker::new(StoreOp::Delete)),
            ],
            monitor: Arc::new(BreakerMonitor::new(config.history_size)),
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn monitor(&self) -> Arc<BreakerMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn state(&self, op: StoreOp) -> BreakerState {
        self.breaker(op).lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let counters = self.counters.lock();
        BreakerStats {
            states: ALL_OPS.iter().map(|&op| (op, self.state(op))).collect(),
            total_failures: counters.failures,
            total_fast_failures: counters.fast_failures,
            total_timeouts: counters.timeouts,
            state_changes: self.monitor.history.read().len(),
        }
    }

    fn breaker(&self, op: StoreOp) -> &Mutex<OpBreaker> {
        &self.breakers[match op {
            StoreOp::Read => 0,
            StoreOp::Write => 1,
            StoreOp::List => 2,
            StoreOp::Delete => 3,
        }]
    }

    async fn call<T, F>(&self, op: StoreOp, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let reset_timeout = Duration::from_millis(self.config.reset_timeout_ms);
        let admit = self.breaker(op).lock().admit(reset_timeout);
        match admit {
            Ok(Some(change)) => self.monitor.record(change),
            Ok(None) => {}
            Err(e) => {
                self.counters.lock().fast_failures += 1;
                return Err(e);
            }
        }

        let deadline = Duration::from_millis(self.config.call_timeout_ms);
        let outcome = match tokio::time::timeout(deadline, future).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.lock().timeouts += 1;
                Err(ParqueError::Storage {
                    kind: StorageErrorKind::Timeout,
                    detail: format!("{op:?} exceeded {}ms deadline", self.config.call_timeout_ms),
                })
            }
        };

        let change = {
            let mut breaker = self.breaker(op).lock();
            match &outcome {
                Ok(_) => breaker.on_success(),
                Err(_) => {
                    self.counters.lock().failures += 1;
                    breaker.on_failure(self.config.failure_threshold)
                }
            }
        };
        if let Some(change) = change {
            self.monitor.record(change);
        }
        outcome
    }
}

#[async_trait]
impl ObjectStore for CircuitBreakerStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.call(StoreOp::Read, self.inner.read(path)).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.call(StoreOp::Write, self.inner.write(path, data)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call(StoreOp::Delete, self.inner.delete(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.call(StoreOp::Read, self.inner.exists(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.call(StoreOp::List, self.inner.list(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose reads always fail; writes always succeed.
    struct FlakyStore;

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            Err(ParqueError::storage_io(format!("no such object: {path}")))
        }
        async fn write(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _path: &str) -> Result<bool> {
            Ok(true)
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectMeta>> {
            Ok(Vec::new())
        }
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 20,
            call_timeout_ms: 1000,
            history_size: 8,
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let store = CircuitBreakerStore::new(Arc::new(FlakyStore), config());

        for _ in 0..3 {
            assert!(store.read("k").await.is_err());
        }
        assert_eq!(store.state(StoreOp::Read), BreakerState::Open);

        let err = store.read("k").await.unwrap_err();
        assert!(matches!(
            err,
            ParqueError::Storage {
                kind: StorageErrorKind::CircuitOpen,
                ..
            }
        ));
        assert_eq!(store.stats().total_fast_failures, 1);
    }

    #[tokio::test]
    async fn test_per_operation_isolation() {
        let store = CircuitBreakerStore::new(Arc::new(FlakyStore), config());
        for _ in 0..3 {
            let _ = store.read("k").await;
        }
        assert_eq!(store.state(StoreOp::Read), BreakerState::Open);
        // Writes are unaffected by the open read circuit.
        assert!(store.write("k", b"v").await.is_ok());
        assert_eq!(store.state(StoreOp::Write), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_then_closed_on_success() {
        let store = CircuitBreakerStore::new(Arc::new(FlakyStore), config());
        for _ in 0..3 {
            let _ = store.write("k", b"v").await; // writes succeed, stays closed
            let _ = store.read("k").await;
        }
        assert_eq!(store.state(StoreOp::Read), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // exists() routes through the read breaker and succeeds.
        assert!(store.exists("k").await.is_ok());
        assert_eq!(store.state(StoreOp::Read), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_monitor_history_and_subscribers() {
        let store = CircuitBreakerStore::new(Arc::new(FlakyStore), config());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        store
            .monitor()
            .subscribe(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        for _ in 0..3 {
            let _ = store.read("k").await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let history = store.monitor().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        struct SlowStore;

        #[async_trait]
        impl ObjectStore for SlowStore {
            async fn read(&self, _path: &str) -> Result<Vec<u8>> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Vec::new())
            }
            async fn write(&self, _path: &str, _data: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn delete(&self, _path: &str) -> Result<()> {
                Ok(())
            }
            async fn exists(&self, _path: &str) -> Result<bool> {
                Ok(false)
            }
            async fn list(&self, _prefix: &str) -> Result<Vec<ObjectMeta>> {
                Ok(Vec::new())
            }
        }

        let store = CircuitBreakerStore::new(
            Arc::new(SlowStore),
            CircuitBreakerConfig {
                call_timeout_ms: 10,
                ..config()
            },
        );
        let err = store.read("k").await.unwrap_err();
        assert!(matches!(
            err,
            ParqueError::Storage {
                kind: StorageErrorKind::Timeout,
                ..
            }
        ));
        assert_eq!(store.stats().total_timeouts, 1);
    }
}
