//! Resilience layers: breaker, retry, idempotency, rate-limit, timeout
//!
//! What this module provides
//! - Reusable Tower middleware that keeps one agent request alive through rate limits,
//!   transient failures and slow dependencies, plus the shared state behind it
//!
//! Exports
//! - Models
//!   - `Backoff { kind, initial, base, max, jitter }`, `RetryPolicy { max_retries, backoff }`
//!   - `BreakerState`, `CircuitState`, `BucketState`, `IdempotencyKey`
//! - Stores (in-memory here, SQLite in `crate::sqlite`)
//!   - `BreakerStore`, `BucketStore`, `IdempotencyStore`
//! - Layers
//!   - `CircuitBreakerLayer`, `RetryLayer`, `IdempotencyLayer`, `RateLimitLayer`, `TimeoutLayer`
//! - Composition
//!   - `Resilience`: builds the canonical stack for the model and for each tool
//!
//! Implementation strategy
//! - Counters live in explicit state structs (`BreakerState`, `BucketState`) whose
//!   transitions are pure functions of (state, config, now). Stores only provide an
//!   atomic read-modify-write around them: a mutex in-process, a transaction or a single
//!   UPDATE statement when shared between processes.
//! - Errors travel as `BoxError`; `crate::error::classify` decides retryability.
//!
//! Composition
//! - Outermost to innermost: `CircuitBreaker -> Retry -> Idempotency -> RateLimit -> Timeout -> call`.
//!   A breaker trip short-circuits the whole retry sequence, and every retry attempt pays
//!   for its own token.
//!
//! Testing strategy
//! - Scripted fake services (fail, fail, succeed) with atomic call counters
//! - Breaker and bucket transitions driven by `ManualClock`
//! - Backoff timing under paused tokio time; bounds via proptest in `tests/`

pub mod breaker;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;
pub mod stack;
pub mod timeout;

pub use breaker::{
    BreakerRegistry, BreakerState, BreakerStore, CircuitBreaker, CircuitBreakerLayer,
    CircuitState, InMemoryBreakerStore,
};
pub use idempotency::{
    IdempotencyGuard, IdempotencyKey, IdempotencyLayer, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use rate_limit::{BucketState, BucketStore, InMemoryBucketStore, RateLimitLayer, TokenBucket};
pub use retry::{Backoff, BackoffKind, RetryLayer, RetryPolicy, RetryPredicate, TransientOnly};
pub use stack::{DependencyPolicy, Resilience, SharedStores};
pub use timeout::{with_timeout, TimeoutLayer};
