//! Token bucket rate limiting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::clock::{elapsed_secs, SharedClock};
use crate::config::BucketConfig;
use crate::error::{AgentError, Result};
use crate::observability::{RuntimeEvent, SharedSink};

/// Longest single sleep while blocked on a token.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Level of one bucket. `0 <= tokens <= capacity` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted,
    /// Not enough tokens; the deficit will be refilled after `retry_after`.
    Denied { retry_after: Duration },
}

impl BucketState {
    /// A bucket starts full.
    pub fn full(config: &BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            tokens: config.effective_capacity(),
            last_refill_at: now,
        }
    }

    pub fn refill(&mut self, config: &BucketConfig, now: DateTime<Utc>) {
        let capacity = config.effective_capacity();
        let added = elapsed_secs(self.last_refill_at, now) * config.rate;
        self.tokens = (self.tokens + added).clamp(0.0, capacity);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    pub fn try_consume(&mut self, config: &BucketConfig, n: f64, now: DateTime<Utc>) -> Acquire {
        self.refill(config, now);
        if self.tokens >= n {
            self.tokens -= n;
            Acquire::Granted
        } else {
            Acquire::Denied {
                retry_after: deficit_wait(config, n - self.tokens),
            }
        }
    }
}

pub(crate) fn deficit_wait(config: &BucketConfig, deficit: f64) -> Duration {
    Duration::try_from_secs_f64(deficit / config.rate).unwrap_or(Duration::MAX)
}

/// Shared storage for bucket levels, keyed by resource name.
#[async_trait]
pub trait BucketStore: Send + Sync + 'static {
    /// Refill, then take `n` tokens if available, as one atomic step.
    async fn try_acquire(
        &self,
        resource: &str,
        config: &BucketConfig,
        n: f64,
        now: DateTime<Utc>,
    ) -> Result<Acquire>;

    /// Current level after refill, without consuming.
    async fn level(&self, resource: &str, config: &BucketConfig, now: DateTime<Utc>) -> Result<f64>;
}

/// Mutex-protected buckets for single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn try_acquire(
        &self,
        resource: &str,
        config: &BucketConfig,
        n: f64,
        now: DateTime<Utc>,
    ) -> Result<Acquire> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| AgentError::Storage("bucket lock poisoned".into()))?;
        let state = buckets
            .entry(resource.to_string())
            .or_insert_with(|| BucketState::full(config, now));
        Ok(state.try_consume(config, n, now))
    }

    async fn level(&self, resource: &str, config: &BucketConfig, now: DateTime<Utc>) -> Result<f64> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| AgentError::Storage("bucket lock poisoned".into()))?;
        let state = buckets
            .entry(resource.to_string())
            .or_insert_with(|| BucketState::full(config, now));
        state.refill(config, now);
        Ok(state.tokens)
    }
}

/// Handle on one named bucket.
#[derive(Clone)]
pub struct TokenBucket {
    resource: Arc<str>,
    config: BucketConfig,
    store: Arc<dyn BucketStore>,
    clock: SharedClock,
    sink: SharedSink,
    max_wait: Option<Duration>,
}

impl TokenBucket {
    pub fn new(
        resource: impl Into<String>,
        config: BucketConfig,
        store: Arc<dyn BucketStore>,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Self {
        Self {
            resource: Arc::from(resource.into()),
            config,
            store,
            clock,
            sink,
            max_wait: None,
        }
    }

    /// Give up blocking after `max_wait`.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Take `n` tokens. With `block`, sleeps in short slices until the tokens are
    /// available or `max_wait` runs out. Never errors: a store failure is logged and
    /// the call is let through.
    pub async fn consume(&self, n: f64, block: bool) -> bool {
        if n > self.config.effective_capacity() {
            self.sink.record(RuntimeEvent::RateLimited {
                resource: self.resource.to_string(),
                waited: Duration::ZERO,
                granted: false,
            });
            return false;
        }

        let started = tokio::time::Instant::now();
        loop {
            let now = self.clock.now();
            let acquired = match self.store.try_acquire(&self.resource, &self.config, n, now).await {
                Ok(a) => a,
                Err(error) => {
                    warn!(resource = %self.resource, %error, "bucket store unavailable, admitting call");
                    return true;
                }
            };
            let waited = started.elapsed();
            match acquired {
                Acquire::Granted => {
                    if !waited.is_zero() {
                        self.sink.record(RuntimeEvent::RateLimited {
                            resource: self.resource.to_string(),
                            waited,
                            granted: true,
                        });
                    }
                    return true;
                }
                Acquire::Denied { retry_after } => {
                    let budget = self.max_wait.map(|m| m.saturating_sub(waited));
                    if !block || budget.is_some_and(|b| b.is_zero()) {
                        self.sink.record(RuntimeEvent::RateLimited {
                            resource: self.resource.to_string(),
                            waited,
                            granted: false,
                        });
                        return false;
                    }
                    let mut nap = retry_after.min(MAX_WAIT_SLICE).max(Duration::from_millis(1));
                    if let Some(b) = budget {
                        nap = nap.min(b);
                    }
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }

    pub async fn level(&self) -> Result<f64> {
        self.store
            .level(&self.resource, &self.config, self.clock.now())
            .await
    }
}

/// Layer spending one token per call.
#[derive(Clone)]
pub struct RateLimitLayer {
    bucket: TokenBucket,
}

impl RateLimitLayer {
    pub fn new(bucket: TokenBucket) -> Self {
        Self { bucket }
    }
}

#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    bucket: TokenBucket,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;
    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            bucket: self.bucket.clone(),
        }
    }
}

impl<S, Req> Service<Req> for RateLimit<S>
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
        let bucket = self.bucket.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            if !bucket.consume(1.0, true).await {
                return Err(Box::new(AgentError::RateLimited {
                    resource: bucket.resource().to_string(),
                }) as BoxError);
            }
            inner.oneshot(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::observability::{MemorySink, NoopSink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    fn bucket(rate: f64, capacity: f64, clock: &ManualClock) -> TokenBucket {
        TokenBucket::new(
            "llm-api",
            BucketConfig::new(rate).with_capacity(capacity),
            Arc::new(InMemoryBucketStore::new()),
            Arc::new(clock.clone()),
            Arc::new(NoopSink),
        )
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let config = BucketConfig::new(10.0).with_capacity(20.0);
        let start = Utc::now();
        let mut state = BucketState::full(&config, start);
        assert_eq!(state.try_consume(&config, 15.0, start), Acquire::Granted);
        assert!((state.tokens - 5.0).abs() < 1e-9);
        state.refill(&config, start + chrono::Duration::hours(1));
        assert_eq!(state.tokens, 20.0);
    }

    #[test]
    fn denial_reports_time_to_refill_deficit() {
        let config = BucketConfig::new(2.0);
        let now = Utc::now();
        let mut state = BucketState {
            tokens: 0.5,
            last_refill_at: now,
        };
        match state.try_consume(&config, 1.0, now) {
            Acquire::Denied { retry_after } => assert_eq!(retry_after, Duration::from_millis(250)),
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(state.tokens, 0.5);
    }

    #[tokio::test]
    async fn non_blocking_consume_returns_false_when_empty() {
        let clock = ManualClock::default();
        let bucket = bucket(1.0, 2.0, &clock);
        assert!(bucket.consume(1.0, false).await);
        assert!(bucket.consume(1.0, false).await);
        assert!(!bucket.consume(1.0, false).await);

        clock.advance(Duration::from_secs(1));
        assert!(bucket.consume(1.0, false).await);
    }

    #[tokio::test]
    async fn request_larger_than_capacity_is_never_granted() {
        let clock = ManualClock::default();
        let bucket = bucket(5.0, 5.0, &clock);
        assert!(!bucket.consume(6.0, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_consume_gives_up_after_max_wait() {
        let clock = ManualClock::default();
        let bucket = bucket(1.0, 1.0, &clock).max_wait(Duration::from_millis(350));
        assert!(bucket.consume(1.0, true).await);
        // the manual clock never advances, so no refill arrives
        assert!(!bucket.consume(1.0, true).await);
    }

    #[tokio::test]
    async fn blocking_consume_waits_for_refill() {
        let bucket = TokenBucket::new(
            "tool:search",
            BucketConfig::new(50.0).with_capacity(1.0),
            Arc::new(InMemoryBucketStore::new()),
            crate::clock::system_clock(),
            Arc::new(NoopSink),
        )
        .max_wait(Duration::from_secs(2));
        assert!(bucket.consume(1.0, true).await);
        let started = std::time::Instant::now();
        assert!(bucket.consume(1.0, true).await);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn layer_rejects_when_tokens_run_out() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let clock = ManualClock::default();
        let sink = MemorySink::new();
        let bucket = TokenBucket::new(
            "llm-api",
            BucketConfig::new(1.0),
            Arc::new(InMemoryBucketStore::new()),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        )
        .max_wait(Duration::ZERO);
        let mut svc = RateLimitLayer::new(bucket).layer(service_fn(|_: ()| async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(())
        }));

        svc.ready().await.unwrap().call(()).await.unwrap();
        let err = svc.ready().await.unwrap().call(()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::RateLimited { resource }) if resource == "llm-api"
        ));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.count(|e| matches!(e, RuntimeEvent::RateLimited { granted: false, .. })),
            1
        );
    }
}
