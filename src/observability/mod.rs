//! Observability hooks
//!
//! What this module provides
//! - A typed event for every instrumentation point of the runtime (call timings, retry
//!   counts, breaker transitions, rate-limit waits, degradations, loop and job lifecycle)
//! - An [`EventSink`] seam so a metrics or alerting backend can be attached without the
//!   core depending on one
//!
//! Exports
//! - Models
//!   - `RuntimeEvent`, `CallOutcome`
//! - Sinks
//!   - `TracingSink` (structured `tracing` logs), `MemorySink` (tests), `NoopSink`
//! - Layers
//!   - `InstrumentLayer<S>`: span + `RuntimeEvent::Call` timing around any service
//!
//! Composition
//! - `Resilience` hands its sink to every layer it builds; workers and the loop
//!   controller receive the same `Arc<dyn EventSink>`
//!
//! Testing strategy
//! - Components under test get a `MemorySink`; assertions inspect the recorded events

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::LoopState;
use crate::error::{classify, ErrorKind};
use crate::jobs::JobStatus;
use crate::resilience::breaker::CircuitState;

/// How a guarded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Failed(ErrorKind),
}

/// Everything the runtime reports to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// A call through an instrumented dependency finished.
    Call {
        dependency: String,
        latency: Duration,
        outcome: CallOutcome,
    },
    /// An attempt failed and another one is scheduled.
    RetryScheduled {
        dependency: String,
        attempt: usize,
        delay: Duration,
        error: String,
    },
    /// The retry budget ran out.
    RetryExhausted { dependency: String, attempts: usize },
    BreakerTransition {
        dependency: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A call was refused because the breaker is open.
    BreakerRejected { dependency: String },
    /// A caller had to wait for, or was denied, a token.
    RateLimited {
        resource: String,
        waited: Duration,
        granted: bool,
    },
    /// A previously stored result was returned instead of re-executing.
    IdempotentReplay { key: String },
    /// An optional tool failed and was replaced by an error result.
    ToolDegraded { tool: String, reason: String },
    /// The loop controller entered a new state.
    LoopPhase { scope: String, state: LoopState },
    JobTransition {
        job_id: String,
        from: Option<JobStatus>,
        to: JobStatus,
    },
    /// Expired leases were reclaimed.
    LeasesReaped { requeued: usize, failed: usize },
}

/// Receiver of runtime events. Must not block.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: RuntimeEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: RuntimeEvent) {}
}

/// Logs every event through `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Call {
                dependency,
                latency,
                outcome,
            } => debug!(%dependency, latency_ms = latency.as_millis() as u64, ?outcome, "call finished"),
            RuntimeEvent::RetryScheduled {
                dependency,
                attempt,
                delay,
                error,
            } => warn!(%dependency, attempt, delay_ms = delay.as_millis() as u64, %error, "retrying"),
            RuntimeEvent::RetryExhausted {
                dependency,
                attempts,
            } => warn!(%dependency, attempts, "retries exhausted"),
            RuntimeEvent::BreakerTransition {
                dependency,
                from,
                to,
            } => warn!(%dependency, ?from, ?to, "circuit breaker transition"),
            RuntimeEvent::BreakerRejected { dependency } => {
                debug!(%dependency, "circuit open, call rejected")
            }
            RuntimeEvent::RateLimited {
                resource,
                waited,
                granted,
            } => debug!(%resource, waited_ms = waited.as_millis() as u64, granted, "rate limited"),
            RuntimeEvent::IdempotentReplay { key } => debug!(%key, "idempotent replay"),
            RuntimeEvent::ToolDegraded { tool, reason } => {
                warn!(%tool, %reason, "optional tool degraded")
            }
            RuntimeEvent::LoopPhase { scope, state } => debug!(%scope, ?state, "loop state"),
            RuntimeEvent::JobTransition { job_id, from, to } => {
                info!(%job_id, ?from, ?to, "job transition")
            }
            RuntimeEvent::LeasesReaped { requeued, failed } => {
                info!(requeued, failed, "expired leases reaped")
            }
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RuntimeEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn count(&self, pred: impl Fn(&RuntimeEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: RuntimeEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

/// Fan an event out to several sinks.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<SharedSink>,
}

impl MultiSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiSink {
    fn record(&self, event: RuntimeEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

/// Layer that times calls and wraps them in a span named after the dependency.
#[derive(Clone)]
pub struct InstrumentLayer {
    dependency: Arc<str>,
    sink: SharedSink,
}

impl InstrumentLayer {
    pub fn new(dependency: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            dependency: Arc::from(dependency.into()),
            sink,
        }
    }
}

#[derive(Clone)]
pub struct Instrumented<S> {
    inner: S,
    dependency: Arc<str>,
    sink: SharedSink,
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = Instrumented<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Instrumented {
            inner,
            dependency: self.dependency.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Instrumented<S>
where
    Req: Send + 'static,
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
        let mut inner = self.inner.clone();
        let dependency = self.dependency.clone();
        let sink = self.sink.clone();
        let span = info_span!("dependency_call", dependency = %dependency);
        Box::pin(
            async move {
                let started = Instant::now();
                let result = ServiceExt::ready(&mut inner).await?.call(req).await;
                let outcome = match &result {
                    Ok(_) => CallOutcome::Ok,
                    Err(e) => CallOutcome::Failed(classify(e)),
                };
                sink.record(RuntimeEvent::Call {
                    dependency: dependency.to_string(),
                    latency: started.elapsed(),
                    outcome,
                });
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::service_fn;

    #[tokio::test]
    async fn instrument_layer_records_timings_and_outcomes() {
        let sink = MemorySink::new();
        let layer = InstrumentLayer::new("tool:echo", Arc::new(sink.clone()));
        let mut svc = layer.layer(service_fn(|x: u32| async move {
            if x == 0 {
                Err::<u32, BoxError>("zero".into())
            } else {
                Ok(x)
            }
        }));

        assert_eq!(svc.ready().await.unwrap().call(7).await.unwrap(), 7);
        assert!(svc.ready().await.unwrap().call(0).await.is_err());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RuntimeEvent::Call { dependency, outcome: CallOutcome::Ok, .. } if dependency == "tool:echo"
        ));
        assert!(matches!(
            &events[1],
            RuntimeEvent::Call { outcome: CallOutcome::Failed(ErrorKind::Transient), .. }
        ));
    }

    #[test]
    fn multi_sink_fans_out() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let multi = MultiSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        multi.record(RuntimeEvent::LeasesReaped {
            requeued: 1,
            failed: 0,
        });
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
