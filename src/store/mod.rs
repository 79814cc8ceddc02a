//! Resilient Store (C1): a generic wrapper adding a failure-aware
//! transport to any [`DurableStore`] — circuit breaker, exponential
//! backoff retry for idempotent operations, and an in-memory shadow that
//! serves reads and queues writes while the durable path is degraded.
//! This is the only component in the system that talks to the durable
//! layer; every other component goes through here.

pub mod circuit_breaker;
pub mod durable;
pub mod retry;
pub mod shadow;

use crate::config::StoreConfig;
use crate::error::ArbiterError;
use crate::events::{Event, EventBus, Payload, Severity, Topic};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use durable::{DurableStore, TxOp};
use retry::RetryPolicy;
use shadow::Shadow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcedFrom {
    Durable,
    Memory,
}

#[derive(Debug, Clone)]
pub struct ReadResult<V> {
    pub value: V,
    pub version: u64,
    pub sourced_from: SourcedFrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    Queued,
}

struct PendingWrite<V> {
    key: String,
    value: V,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheck {
    pub healthy: bool,
    pub latency_ms: f64,
    pub shadow_size: usize,
    pub pending_writes: usize,
    pub breaker_state: CircuitState,
}

pub struct ResilientStore<V: Clone + Send + Sync, S: DurableStore<V>> {
    durable: Arc<S>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    shadow: Mutex<Shadow<V>>,
    pending: Mutex<VecDeque<PendingWrite<V>>>,
    pending_capacity: usize,
    reconciliation_failures: Mutex<Vec<String>>,
    events: Arc<EventBus>,
    component: String,
    cancellation: CancellationToken,
    dropped_pending: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static, S: DurableStore<V> + 'static> ResilientStore<V, S> {
    pub fn new(component: impl Into<String>, durable: Arc<S>, config: &StoreConfig, events: Arc<EventBus>) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            failure_window: config.failure_window,
        }));
        let retry_policy = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            multiplier: config.retry_multiplier,
            jitter: config.retry_jitter,
        };
        let store = Arc::new(Self {
            durable,
            breaker,
            retry_policy,
            shadow: Mutex::new(Shadow::new(config.shadow_capacity)),
            pending: Mutex::new(VecDeque::new()),
            pending_capacity: config.pending_write_log_capacity,
            reconciliation_failures: Mutex::new(Vec::new()),
            events,
            component: component.into(),
            cancellation: CancellationToken::new(),
            dropped_pending: AtomicU64::new(0),
        });
        store.clone().spawn_health_prober(config.health_probe_interval);
        store
    }

    fn spawn_health_prober(self: Arc<Self>, interval: Duration) {
        let token = self.cancellation.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        });
    }

    async fn probe_once(&self) {
        match self.durable.health_ping().await {
            Ok(()) => {
                let was_half_open = self.breaker.state().await == CircuitState::HalfOpen;
                self.record_outcome(true).await;
                if was_half_open && self.breaker.state().await == CircuitState::Closed {
                    self.drain_pending().await;
                }
            }
            Err(_) => {
                self.record_outcome(false).await;
            }
        }
    }

    /// Records a breaker outcome and publishes `SystemBreakerStateChanged`
    /// whenever it causes a state transition, so subscribers don't have to
    /// poll `breaker_state` to notice closed/open/half-open flips.
    async fn record_outcome(&self, success: bool) {
        let before = self.breaker.state().await;
        if success {
            self.breaker.record_success().await;
        } else {
            self.breaker.record_failure().await;
        }
        let after = self.breaker.state().await;
        if after != before {
            self.events.publish(Event::new(
                Topic::System,
                format!("{}-breaker", self.component),
                Severity::Warn,
                Payload::SystemBreakerStateChanged {
                    from: format!("{before:?}"),
                    to: format!("{after:?}"),
                },
            ));
        }
    }

    /// Cancels the background health prober. Call during shutdown, in
    /// reverse dependency order relative to whatever owns this store.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    pub async fn read(&self, key: &str) -> Result<ReadResult<V>, ArbiterError> {
        if self.breaker.should_allow_request().await {
            match self.durable.get(key).await {
                Ok(Some((value, version))) => {
                    self.record_outcome(true).await;
                    let evicted = self.shadow.lock().await.put(key.to_string(), value.clone(), version);
                    self.report_eviction(evicted).await;
                    return Ok(ReadResult {
                        value,
                        version,
                        sourced_from: SourcedFrom::Durable,
                    });
                }
                Ok(None) => {
                    self.record_outcome(true).await;
                    return Err(ArbiterError::NotFound(key.to_string()));
                }
                Err(err) => {
                    self.record_outcome(false).await;
                    if let Some(result) = self.serve_from_shadow(key).await {
                        return Ok(result);
                    }
                    return Err(err);
                }
            }
        }
        self.serve_from_shadow(key)
            .await
            .ok_or_else(|| ArbiterError::Unavailable(format!("{} unavailable and no shadow entry for {key}", self.component)))
    }

    /// Publishes resource pressure whenever a shadow write evicts a live
    /// key, the way `enqueue_pending` publishes pressure at the pending
    /// write log's capacity ceiling.
    async fn report_eviction(&self, evicted: Option<String>) {
        if let Some(evicted_key) = evicted {
            self.events.publish(Event::new(
                Topic::System,
                format!("{}-shadow", self.component),
                Severity::Warn,
                Payload::SystemResourceAlert {
                    resource: format!("{}.shadow", self.component),
                    detail: format!("evicted key {evicted_key} under write pressure"),
                },
            ));
        }
    }

    async fn serve_from_shadow(&self, key: &str) -> Option<ReadResult<V>> {
        self.shadow.lock().await.get(key).map(|(value, version)| ReadResult {
            value,
            version,
            sourced_from: SourcedFrom::Memory,
        })
    }

    pub async fn write(&self, key: &str, value: V, idempotent: bool) -> Result<WriteOutcome, ArbiterError> {
        if idempotent {
            retry::retry(&self.retry_policy, || self.write_once(key, value.clone())).await
        } else {
            self.write_once(key, value).await
        }
    }

    async fn write_once(&self, key: &str, value: V) -> Result<WriteOutcome, ArbiterError> {
        if !self.breaker.should_allow_request().await {
            self.enqueue_pending(key.to_string(), value.clone()).await;
            let evicted = self.shadow.lock().await.put(key.to_string(), value, u64::MAX);
            self.report_eviction(evicted).await;
            return Ok(WriteOutcome::Queued);
        }
        match self.durable.put(key, value.clone(), None).await {
            Ok(version) => {
                self.record_outcome(true).await;
                let evicted = self.shadow.lock().await.put(key.to_string(), value, version);
                self.report_eviction(evicted).await;
                Ok(WriteOutcome::Written { version })
            }
            Err(err) => {
                self.record_outcome(false).await;
                Err(err)
            }
        }
    }

    async fn enqueue_pending(&self, key: String, value: V) {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.pending_capacity {
            pending.pop_front();
            self.dropped_pending.fetch_add(1, Ordering::Relaxed);
            warn!(component = %self.component, "pending write log at capacity, dropped oldest entry");
            self.events.publish(Event::new(
                Topic::System,
                "store-degraded",
                Severity::Warn,
                Payload::SystemDegraded {
                    component: self.component.clone(),
                    detail: "pending write log full, dropped oldest entry".into(),
                },
            ));
        }
        pending.push_back(PendingWrite {
            key,
            value,
            enqueued_at: Instant::now(),
        });
    }

    /// Drains the pending-write log in order once the breaker returns to
    /// `closed`. A write the durable layer rejects is recorded as a
    /// reconciliation failure rather than silently discarded.
    async fn drain_pending(&self) {
        let mut pending = self.pending.lock().await;
        let mut drained = 0usize;
        while let Some(item) = pending.pop_front() {
            match self.durable.put(&item.key, item.value.clone(), None).await {
                Ok(_) => drained += 1,
                Err(err) => {
                    warn!(key = %item.key, error = %err, "reconciliation failure draining pending write");
                    self.reconciliation_failures
                        .lock()
                        .await
                        .push(format!("{}: {}", item.key, err));
                }
            }
        }
        if drained > 0 {
            info!(component = %self.component, drained, "drained pending write log after breaker closed");
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), ArbiterError> {
        if !self.breaker.should_allow_request().await {
            return Err(ArbiterError::Unavailable(format!("{} unavailable", self.component)));
        }
        match self.durable.delete(key).await {
            Ok(()) => {
                self.record_outcome(true).await;
                self.shadow.lock().await.remove(key);
                Ok(())
            }
            Err(err) => {
                self.record_outcome(false).await;
                Err(err)
            }
        }
    }

    /// Transactions are never retried and fail fast when the breaker is
    /// open, per contract.
    pub async fn transaction(&self, ops: Vec<TxOp<V>>) -> Result<(), ArbiterError> {
        if !self.breaker.should_allow_request().await {
            return Err(ArbiterError::Unavailable(format!("{} unavailable", self.component)));
        }
        match self.durable.tx(ops).await {
            Ok(()) => {
                self.record_outcome(true).await;
                Ok(())
            }
            Err(err) => {
                self.record_outcome(false).await;
                Err(err)
            }
        }
    }

    /// Prefix scan, used by components that need a full listing (the
    /// registry's `queryByCapability`). Not served from the shadow: the
    /// shadow has no prefix index, so a scan fails fast when the breaker
    /// is open rather than returning a partial view.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, V, u64)>, ArbiterError> {
        if !self.breaker.should_allow_request().await {
            return Err(ArbiterError::Unavailable(format!("{} unavailable", self.component)));
        }
        match self.durable.scan(prefix).await {
            Ok(rows) => {
                self.record_outcome(true).await;
                Ok(rows)
            }
            Err(err) => {
                self.record_outcome(false).await;
                Err(err)
            }
        }
    }

    pub async fn health_check(&self) -> HealthCheck {
        let start = Instant::now();
        let healthy = self.durable.health_ping().await.is_ok();
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        HealthCheck {
            healthy,
            latency_ms,
            shadow_size: self.shadow.lock().await.len(),
            pending_writes: self.pending.lock().await.len(),
            breaker_state: self.breaker.state().await,
        }
    }

    pub async fn breaker_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    pub async fn pending_write_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn dropped_pending_count(&self) -> u64 {
        self.dropped_pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable::InMemoryDurableStore;

    fn test_store() -> (Arc<ResilientStore<i32, InMemoryDurableStore<i32>>>, Arc<InMemoryDurableStore<i32>>) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let events = Arc::new(EventBus::new(64));
        let config = StoreConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(20),
            retry_max_attempts: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            health_probe_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        };
        let store = ResilientStore::new("test", durable.clone(), &config, events);
        (store, durable)
    }

    #[tokio::test]
    async fn successful_write_then_offline_read_serves_shadow() {
        let (store, durable) = test_store();
        store.write("k1", 42, false).await.unwrap();
        durable.set_offline(true);
        // trip the breaker
        let _ = store.read("k1").await;
        let _ = store.read("k1").await;
        let result = store.read("k1").await.unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.sourced_from, SourcedFrom::Memory);
    }

    #[tokio::test]
    async fn writes_while_open_are_queued_not_lost() {
        let (store, durable) = test_store();
        durable.set_offline(true);
        let _ = store.write("k1", 1, false).await;
        let _ = store.write("k1", 1, false).await;
        let outcome = store.write("k1", 2, false).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(store.pending_write_count().await, 1);
        let read = store.read("k1").await.unwrap();
        assert_eq!(read.value, 2);
    }

    #[tokio::test]
    async fn pending_log_drops_oldest_at_capacity() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let events = Arc::new(EventBus::new(64));
        let config = StoreConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(3600),
            pending_write_log_capacity: 1,
            health_probe_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        };
        let store = ResilientStore::new("test", durable.clone(), &config, events);
        durable.set_offline(true);
        let _ = store.write("k0", 0, false).await;
        let _ = store.write("k1", 1, false).await;
        let _ = store.write("k2", 2, false).await;
        assert_eq!(store.pending_write_count().await, 1);
        assert_eq!(store.dropped_pending_count(), 1);
    }

    #[tokio::test]
    async fn transaction_fails_fast_when_open_never_retried() {
        let (store, durable) = test_store();
        durable.set_offline(true);
        let _ = store.read("missing").await;
        let _ = store.read("missing").await;
        let err = store.transaction(vec![TxOp::Put { key: "a".into(), value: 1 }]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unavailable);
    }
}
