//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{classify, AgentError};
use crate::observability::{RuntimeEvent, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub base: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            base: 1.0,
            max: delay,
            jitter: false,
        }
    }

    pub fn exponential(initial: Duration, base: f64, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            base,
            max,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `min(initial * base^attempt, max)`, attempt counted from zero.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = self.initial.as_secs_f64() * self.base.powi(exp);
                match Duration::try_from_secs_f64(secs) {
                    Ok(d) if d < self.max => d,
                    _ => self.max,
                }
            }
        }
    }

    /// Jittered delay using the supplied generator; factor is drawn from [0.5, 1.5).
    pub fn jittered_with<R: Rng + ?Sized>(&self, attempt: usize, rng: &mut R) -> Duration {
        let d = self.delay_for_attempt(attempt);
        if !self.jitter {
            return d;
        }
        d.mul_f64(rng.gen_range(0.5..1.5))
    }

    pub fn jittered(&self, attempt: usize) -> Duration {
        self.jittered_with(attempt, &mut rand::thread_rng())
    }
}

/// Decides whether an error is worth another attempt.
pub trait RetryPredicate: Send + Sync + 'static {
    fn retryable(&self, err: &BoxError) -> bool;
}

/// Retry exactly the errors classified as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl RetryPredicate for TransientOnly {
    fn retryable(&self, err: &BoxError) -> bool {
        classify(err).is_retryable()
    }
}

impl<F> RetryPredicate for F
where
    F: Fn(&BoxError) -> bool + Send + Sync + 'static,
{
    fn retryable(&self, err: &BoxError) -> bool {
        (self)(err)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub backoff: Backoff,
    predicate: Arc<dyn RetryPredicate>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            predicate: Arc::new(TransientOnly),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let backoff = Backoff::exponential(config.initial_delay, config.base, config.max_delay)
            .with_jitter(config.jitter);
        Self::new(config.max_retries, backoff)
    }

    pub fn with_predicate(mut self, predicate: impl RetryPredicate) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, err: &BoxError) -> bool {
        self.predicate.retryable(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the budget is
    /// spent. `op` receives the zero-based attempt number. Exhaustion wraps the last
    /// error in [`AgentError::RetryExhausted`].
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        sink: &SharedSink,
        mut op: F,
    ) -> Result<T, BoxError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let mut attempt = 0usize;
        loop {
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !self.is_retryable(&err) {
                debug!(%dependency, attempt, error = %err, "non-retryable error");
                return Err(err);
            }
            if attempt >= self.max_retries {
                sink.record(RuntimeEvent::RetryExhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt + 1,
                });
                return Err(Box::new(AgentError::RetryExhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt + 1,
                    source: err,
                }));
            }
            let delay = self.backoff.jittered(attempt);
            sink.record(RuntimeEvent::RetryScheduled {
                dependency: dependency.to_string(),
                attempt: attempt + 1,
                delay,
                error: err.to_string(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[derive(Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
    dependency: Arc<str>,
    sink: SharedSink,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy, dependency: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            policy,
            dependency: Arc::from(dependency.into()),
            sink,
        }
    }
}

#[derive(Clone)]
pub struct Retry<S> {
    inner: S,
    policy: RetryPolicy,
    dependency: Arc<str>,
    sink: SharedSink,
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy.clone(),
            dependency: self.dependency.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Retry<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        let dependency = self.dependency.clone();
        let sink = self.sink.clone();
        Box::pin(async move {
            policy
                .execute(&dependency, &sink, move |_| inner.clone().oneshot(req.clone()))
                .await
        })
    }
}
