//! Canonical composition of the resilience layers around one dependency.
//!
//! Outermost first: breaker, retry, idempotency (side-effecting tools only), rate
//! limit, instrumentation, timeout, call. The breaker sees one outcome per retry
//! sequence, and every attempt spends its own token.

use std::sync::Arc;
use std::time::Duration;

use tower::{util::BoxCloneSyncService, BoxError, Layer, Service};

use crate::clock::{system_clock, SharedClock};
use crate::config::{BucketConfig, RuntimeConfig};
use crate::error::TimeoutScope;
use crate::items::{ModelRequest, ModelResponse};
use crate::observability::{InstrumentLayer, SharedSink, TracingSink};
use crate::tools::{ToolDef, ToolSvc};

use super::breaker::{BreakerRegistry, BreakerStore, CircuitBreakerLayer, InMemoryBreakerStore};
use super::idempotency::{IdempotencyGuard, IdempotencyLayer, IdempotencyStore, InMemoryIdempotencyStore};
use super::rate_limit::{BucketStore, InMemoryBucketStore, RateLimitLayer, TokenBucket};
use super::retry::{RetryLayer, RetryPolicy};
use super::timeout::TimeoutLayer;

/// Dependency name of the model API.
pub const MODEL_DEPENDENCY: &str = "llm-api";
/// Bucket resource shared by all tool calls.
pub const TOOLS_RESOURCE: &str = "tools";

type Boxed<Req, Resp> = BoxCloneSyncService<Req, Resp, BoxError>;

/// Backing stores for state shared across workers.
#[derive(Clone)]
pub struct SharedStores {
    pub breakers: Arc<dyn BreakerStore>,
    pub buckets: Arc<dyn BucketStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl SharedStores {
    pub fn in_memory() -> Self {
        Self {
            breakers: Arc::new(InMemoryBreakerStore::new()),
            buckets: Arc::new(InMemoryBucketStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    /// Use one store for all three concerns.
    pub fn from_store<T>(store: Arc<T>) -> Self
    where
        T: BreakerStore + BucketStore + IdempotencyStore,
    {
        Self {
            breakers: store.clone(),
            buckets: store.clone(),
            idempotency: store,
        }
    }
}

/// Everything needed to guard calls to one named dependency.
#[derive(Clone)]
pub struct DependencyPolicy {
    /// Breaker and instrumentation key, e.g. `llm-api` or `tool:weather`
    pub name: String,
    pub retry: RetryPolicy,
    pub bucket: Option<TokenBucket>,
    pub timeout_scope: TimeoutScope,
    pub timeout: Duration,
}

/// Factory for guarded model and tool services. Cheap to clone.
#[derive(Clone)]
pub struct Resilience {
    config: Arc<RuntimeConfig>,
    breakers: BreakerRegistry,
    buckets: Arc<dyn BucketStore>,
    idempotency: IdempotencyGuard,
    clock: SharedClock,
    sink: SharedSink,
}

impl Resilience {
    pub fn new(config: &RuntimeConfig, stores: SharedStores, clock: SharedClock, sink: SharedSink) -> Self {
        Self {
            config: Arc::new(config.clone()),
            breakers: BreakerRegistry::new(
                stores.breakers,
                config.breaker.clone(),
                clock.clone(),
                sink.clone(),
            ),
            buckets: stores.buckets,
            idempotency: IdempotencyGuard::new(
                stores.idempotency,
                config.idempotency.ttl,
                clock.clone(),
                sink.clone(),
            ),
            clock,
            sink,
        }
    }

    /// Single-process setup: in-memory stores, wall clock, events logged through tracing.
    pub fn in_memory(config: &RuntimeConfig) -> Self {
        Self::new(
            config,
            SharedStores::in_memory(),
            system_clock(),
            Arc::new(TracingSink),
        )
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle on a bucket in the shared store.
    pub fn bucket(&self, resource: &str, config: BucketConfig) -> TokenBucket {
        TokenBucket::new(
            resource,
            config,
            self.buckets.clone(),
            self.clock.clone(),
            self.sink.clone(),
        )
        .max_wait(self.config.rate_limit.max_wait)
    }

    pub fn model_bucket(&self) -> Option<TokenBucket> {
        self.config
            .rate_limit
            .model
            .clone()
            .map(|cfg| self.bucket(MODEL_DEPENDENCY, cfg))
    }

    pub fn tools_bucket(&self) -> Option<TokenBucket> {
        self.config
            .rate_limit
            .tools
            .clone()
            .map(|cfg| self.bucket(TOOLS_RESOURCE, cfg))
    }

    pub fn model_policy(&self) -> DependencyPolicy {
        DependencyPolicy {
            name: MODEL_DEPENDENCY.to_string(),
            retry: RetryPolicy::from_config(&self.config.retry),
            bucket: self.model_bucket(),
            timeout_scope: TimeoutScope::ModelCall,
            timeout: self.config.timeouts.model_call,
        }
    }

    pub fn tool_policy(&self, tool: &ToolDef) -> DependencyPolicy {
        DependencyPolicy {
            name: format!("tool:{}", tool.name),
            retry: RetryPolicy::from_config(&self.config.retry),
            bucket: self.tools_bucket(),
            timeout_scope: TimeoutScope::Tool,
            timeout: tool.timeout.unwrap_or(self.config.timeouts.tool),
        }
    }

    fn guard_attempt<Req, Resp>(&self, policy: &DependencyPolicy, svc: Boxed<Req, Resp>) -> Boxed<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let svc = TimeoutLayer::new(policy.timeout_scope, policy.timeout).layer(svc);
        let svc = InstrumentLayer::new(policy.name.clone(), self.sink.clone()).layer(svc);
        match &policy.bucket {
            Some(bucket) => BoxCloneSyncService::new(RateLimitLayer::new(bucket.clone()).layer(svc)),
            None => BoxCloneSyncService::new(svc),
        }
    }

    fn guard_sequence<Req, Resp>(&self, policy: &DependencyPolicy, svc: Boxed<Req, Resp>) -> Boxed<Req, Resp>
    where
        Req: Clone + Send + 'static,
        Resp: Send + 'static,
    {
        let svc = RetryLayer::new(policy.retry.clone(), policy.name.clone(), self.sink.clone()).layer(svc);
        let breaker = self.breakers.get(&policy.name);
        BoxCloneSyncService::new(CircuitBreakerLayer::new(breaker).layer(svc))
    }

    /// Wrap any service in the full stack for `policy`.
    pub fn wrap<S, Req>(&self, policy: &DependencyPolicy, svc: S) -> Boxed<Req, S::Response>
    where
        Req: Clone + Send + 'static,
        S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
        S::Response: Send + 'static,
        S::Future: Send + 'static,
    {
        let attempt = self.guard_attempt(policy, BoxCloneSyncService::new(svc));
        self.guard_sequence(policy, attempt)
    }

    /// The model client as the loop sees it.
    pub fn model_service<S>(&self, raw: S) -> Boxed<ModelRequest, ModelResponse>
    where
        S: Service<ModelRequest, Response = ModelResponse, Error = BoxError> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        self.wrap(&self.model_policy(), raw)
    }

    /// A tool service as the router sees it. Side-effecting tools are deduplicated
    /// per (request scope, tool, arguments) inside the retry loop.
    pub fn tool_service(&self, tool: &ToolDef) -> ToolSvc {
        let policy = self.tool_policy(tool);
        let attempt = self.guard_attempt(&policy, tool.service.clone());
        let attempt = if tool.side_effecting {
            BoxCloneSyncService::new(IdempotencyLayer::new(self.idempotency.clone()).layer(attempt))
        } else {
            attempt
        };
        self.guard_sequence(&policy, attempt)
    }
}
