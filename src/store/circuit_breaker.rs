//! Three-state circuit breaker guarding the durable store. Adapted from
//! the single-dependency breaker pattern into a reusable primitive: the
//! half-open state now admits at most one in-flight probe (a bare bool
//! gate) rather than letting every caller through until enough successes
//! accumulate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            failure_window: Duration::from_secs(300),
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
    opened_at: RwLock<Option<Instant>>,
    probe_in_flight: AtomicBool,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            opened_at: RwLock::new(None),
            probe_in_flight: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Returns whether a request should be let through. In `Open` state
    /// this also performs the `open -> half-open` transition once the
    /// cooldown has elapsed. In `HalfOpen`, only the first caller to ask
    /// (the probe) is admitted; everyone else fails fast until the probe
    /// resolves.
    pub async fn should_allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.read().await;
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    self.transition_to_half_open().await;
                    self.try_claim_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.try_claim_probe(),
        }
    }

    fn try_claim_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn record_success(&self) {
        let state = *self.state.read().await;
        match state {
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::Release);
                self.transition_to_closed().await;
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                warn!("success recorded while breaker is open");
            }
        }
    }

    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => {
                let mut last_failure = self.last_failure_time.write().await;
                let now = Instant::now();
                let within_window = last_failure
                    .map(|t| now.duration_since(t) <= self.config.failure_window)
                    .unwrap_or(false);
                let count = if within_window {
                    self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                    1
                };
                *last_failure = Some(now);
                debug!(count, threshold = self.config.failure_threshold, "breaker failure recorded");
                if count >= self.config.failure_threshold {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::Release);
                self.transition_to_open().await;
            }
            CircuitState::Open => {
                let mut last_failure = self.last_failure_time.write().await;
                *last_failure = Some(Instant::now());
            }
        }
    }

    async fn transition_to_open(&self) {
        let mut state = self.state.write().await;
        let previous = *state;
        *state = CircuitState::Open;
        *self.opened_at.write().await = Some(Instant::now());
        self.failure_count.store(0, Ordering::Relaxed);
        warn!(?previous, "circuit breaker opened");
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            return;
        }
        *state = CircuitState::HalfOpen;
        self.probe_in_flight.store(false, Ordering::Release);
        info!("circuit breaker transitioned to half-open");
    }

    async fn transition_to_closed(&self) {
        let mut state = self.state.write().await;
        let previous = *state;
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
        *self.opened_at.write().await = None;
        info!(?previous, "circuit breaker closed, service recovered");
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub total_failures: u64,
}

pub type SharedCircuitBreaker = Arc<CircuitBreaker>;
