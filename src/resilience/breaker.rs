//! Per-dependency circuit breakers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, warn};

use crate::clock::{elapsed_secs, SharedClock};
use crate::config::BreakerConfig;
use crate::error::{classify, AgentError, ErrorKind, Result};
use crate::observability::{RuntimeEvent, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Why a call was or was not let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial call of a half-open breaker.
    Probe,
    Rejected { retry_in: Duration },
}

/// How an admitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Success,
    Failure,
    /// Cancelled calls say nothing about the dependency's health.
    Ignored,
}

impl CallResult {
    /// A permanent error proves the dependency answered; only transient ones count.
    pub fn from_error(err: &BoxError) -> Self {
        match classify(err) {
            ErrorKind::Transient => CallResult::Failure,
            ErrorKind::Permanent => CallResult::Success,
            ErrorKind::Cancelled => CallResult::Ignored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Breaker counters for one dependency.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Set while the half-open probe is outstanding.
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn cooldown_left(&self, config: &BreakerConfig, now: DateTime<Utc>) -> Duration {
        let since = self
            .last_failure_at
            .map(|at| elapsed_secs(at, now))
            .unwrap_or(f64::MAX);
        Duration::try_from_secs_f64(since)
            .map(|s| config.recovery_timeout.saturating_sub(s))
            .unwrap_or(Duration::ZERO)
    }

    fn probe_abandoned(&self, config: &BreakerConfig, now: DateTime<Utc>) -> bool {
        // a probe whose caller died never reports back
        self.probe_started_at
            .is_some_and(|at| elapsed_secs(at, now) >= config.recovery_timeout.as_secs_f64())
    }

    pub fn admit(
        &mut self,
        config: &BreakerConfig,
        now: DateTime<Utc>,
    ) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                let left = self.cooldown_left(config, now);
                if left.is_zero() {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    (
                        Admission::Probe,
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    )
                } else {
                    (Admission::Rejected { retry_in: left }, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_started_at.is_none() || self.probe_abandoned(config, now) {
                    self.probe_started_at = Some(now);
                    (Admission::Probe, None)
                } else {
                    (
                        Admission::Rejected {
                            retry_in: Duration::ZERO,
                        },
                        None,
                    )
                }
            }
        }
    }

    pub fn record(
        &mut self,
        config: &BreakerConfig,
        admission: Admission,
        result: CallResult,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let before = self.state;
        match (admission, result) {
            (Admission::Rejected { .. }, _) => return None,
            (Admission::Probe, CallResult::Success) => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.probe_started_at = None;
            }
            (Admission::Probe, CallResult::Failure) => {
                self.state = CircuitState::Open;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
                self.probe_started_at = None;
            }
            (Admission::Probe, CallResult::Ignored) => {
                self.probe_started_at = None;
            }
            (Admission::Allowed, CallResult::Success) => {
                if self.state == CircuitState::Closed {
                    self.consecutive_failures = 0;
                }
            }
            (Admission::Allowed, CallResult::Failure) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                // a straggler admitted before the trip must not push the cooldown out
                if self.state == CircuitState::Closed {
                    self.last_failure_at = Some(now);
                    if self.consecutive_failures >= config.failure_threshold {
                        self.state = CircuitState::Open;
                    }
                }
            }
            (Admission::Allowed, CallResult::Ignored) => {}
        }
        (before != self.state).then_some(Transition {
            from: before,
            to: self.state,
        })
    }
}

/// Atomic read-modify-write access to breaker state, keyed by dependency name.
#[async_trait]
pub trait BreakerStore: Send + Sync + 'static {
    /// Apply `f` to the named state (default if absent) and persist the result without
    /// interleaving with any other update of the same name.
    async fn update(
        &self,
        name: &str,
        f: &mut (dyn for<'s> FnMut(&'s mut BreakerState) + Send),
    ) -> Result<BreakerState>;

    async fn load(&self, name: &str) -> Result<Option<BreakerState>>;
}

#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn update(
        &self,
        name: &str,
        f: &mut (dyn for<'s> FnMut(&'s mut BreakerState) + Send),
    ) -> Result<BreakerState> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| AgentError::Storage("breaker lock poisoned".into()))?;
        let state = states.entry(name.to_string()).or_default();
        f(state);
        Ok(state.clone())
    }

    async fn load(&self, name: &str) -> Result<Option<BreakerState>> {
        let states = self
            .states
            .lock()
            .map_err(|_| AgentError::Storage("breaker lock poisoned".into()))?;
        Ok(states.get(name).cloned())
    }
}

/// Breaker for one named dependency. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    store: Arc<dyn BreakerStore>,
    clock: SharedClock,
    sink: SharedSink,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Arc<dyn BreakerStore>,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            config,
            store,
            clock,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn report(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            match t.to {
                CircuitState::Open => warn!(dependency = %self.name, from = ?t.from, "circuit opened"),
                _ => info!(dependency = %self.name, from = ?t.from, to = ?t.to, "circuit state changed"),
            }
            self.sink.record(RuntimeEvent::BreakerTransition {
                dependency: self.name.to_string(),
                from: t.from,
                to: t.to,
            });
        }
    }

    async fn admit(&self) -> std::result::Result<Admission, BoxError> {
        let now = self.clock.now();
        let config = self.config.clone();
        let mut outcome = (Admission::Allowed, None);
        self.store
            .update(&self.name, &mut |state: &mut BreakerState| {
                outcome = state.admit(&config, now)
            })
            .await?;
        self.report(outcome.1);
        Ok(outcome.0)
    }

    async fn settle(&self, admission: Admission, result: CallResult) {
        let now = self.clock.now();
        let config = self.config.clone();
        let mut transition = None;
        let updated = self
            .store
            .update(&self.name, &mut |state: &mut BreakerState| {
                transition = state.record(&config, admission, result, now)
            })
            .await;
        match updated {
            Ok(_) => self.report(transition),
            Err(error) => warn!(dependency = %self.name, %error, "failed to record breaker outcome"),
        }
    }

    /// Run `op` if the breaker admits it, and feed the outcome back.
    pub async fn call<T, F, Fut>(&self, op: F) -> std::result::Result<T, BoxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let admission = self.admit().await?;
        if let Admission::Rejected { retry_in } = admission {
            self.sink.record(RuntimeEvent::BreakerRejected {
                dependency: self.name.to_string(),
            });
            return Err(Box::new(AgentError::CircuitOpen {
                dependency: self.name.to_string(),
                retry_in,
            }));
        }

        // a probe dropped mid-flight must not pin the breaker half-open
        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            armed: true,
        };
        let result = op().await;
        guard.armed = false;

        let call_result = match &result {
            Ok(_) => CallResult::Success,
            Err(e) => CallResult::from_error(e),
        };
        self.settle(admission, call_result).await;
        result
    }

    pub async fn state(&self) -> Result<BreakerState> {
        Ok(self.store.load(&self.name).await?.unwrap_or_default())
    }

    /// Force the breaker closed.
    pub async fn reset(&self) -> Result<()> {
        let mut before = CircuitState::Closed;
        self.store
            .update(&self.name, &mut |state: &mut BreakerState| {
                before = state.state;
                *state = BreakerState::default();
            })
            .await?;
        if before != CircuitState::Closed {
            self.report(Some(Transition {
                from: before,
                to: CircuitState::Closed,
            }));
        }
        Ok(())
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || self.admission != Admission::Probe {
            return;
        }
        let breaker = self.breaker.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                breaker.settle(Admission::Probe, CallResult::Ignored).await;
            });
        }
    }
}

/// Breakers sharing one store, created on demand per dependency name.
#[derive(Clone)]
pub struct BreakerRegistry {
    store: Arc<dyn BreakerStore>,
    clock: SharedClock,
    sink: SharedSink,
    default_config: BreakerConfig,
    overrides: Arc<HashMap<String, BreakerConfig>>,
}

impl BreakerRegistry {
    pub fn new(
        store: Arc<dyn BreakerStore>,
        default_config: BreakerConfig,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            default_config,
            overrides: Arc::new(HashMap::new()),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        Arc::make_mut(&mut self.overrides).insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> CircuitBreaker {
        let config = self
            .overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone());
        CircuitBreaker::new(
            name,
            config,
            self.store.clone(),
            self.clock.clone(),
            self.sink.clone(),
        )
    }
}

#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

#[derive(Clone)]
pub struct Breaker<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = Breaker<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Breaker {
            inner,
            breaker: self.breaker.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Breaker<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let breaker = self.breaker.clone();
        Box::pin(async move { breaker.call(|| inner.oneshot(req)).await })
    }
}
