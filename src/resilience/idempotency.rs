//! Deduplication of side-effecting operations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::clock::{add, SharedClock};
use crate::error::{AgentError, Result};
use crate::observability::{RuntimeEvent, SharedSink};
use crate::tools::{ToolInvocation, ToolOutput};

/// Deterministic identifier of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Use a caller-supplied key as is.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// SHA-256 over the parts, separated so that ("ab", "c") and ("a", "bc") differ.
    pub fn from_parts(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Key for a tool call within one request scope. Arguments are hashed in their
    /// canonical (sorted-key) JSON form, so key order in the model's output is irrelevant.
    pub fn for_tool_call(scope: &str, tool: &str, arguments: &Value) -> Self {
        let canonical = canonical_json(arguments);
        Self::from_parts(&["tool", scope, tool, &canonical])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable map from key to serialized result, with expiry.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()>;
    /// Drop expired entries; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AgentError::Storage("idempotency lock poisoned".into()))?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(v, _)| v.clone()))
    }

    async fn put(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AgentError::Storage("idempotency lock poisoned".into()))?
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AgentError::Storage("idempotency lock poisoned".into()))?;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}

type InFlight = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// One caller's claim on a key. Dropping it, also on cancellation, forgets the key
/// once no other caller holds it.
struct InFlightEntry {
    map: InFlight,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        // the map holds one reference and this entry the other
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Executes an operation at most once per key within the TTL.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    clock: SharedClock,
    sink: SharedSink,
    in_flight: InFlight,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        ttl: Duration,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Self {
        Self {
            store,
            ttl,
            clock,
            sink,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn enter(&self, key: &str) -> InFlightEntry {
        let lock = {
            let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        InFlightEntry {
            map: self.in_flight.clone(),
            key: key.to_string(),
            lock,
        }
    }

    /// Return the stored result for `key`, or run `op`, store its success and return it.
    /// Concurrent callers with the same key in this process wait for the first one.
    /// Failures are not stored.
    pub async fn ensure_idempotent<T, F, Fut>(
        &self,
        key: &IdempotencyKey,
        op: F,
    ) -> std::result::Result<T, BoxError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let entry = self.enter(key.as_str());
        let _held = entry.lock.lock().await;
        self.run_once(key, op).await
    }

    async fn run_once<T, F, Fut>(&self, key: &IdempotencyKey, op: F) -> std::result::Result<T, BoxError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        if let Some(stored) = self.store.get(key.as_str(), self.clock.now()).await? {
            debug!(key = %key, "returning stored result");
            self.sink.record(RuntimeEvent::IdempotentReplay {
                key: key.to_string(),
            });
            return Ok(serde_json::from_str(&stored)?);
        }
        let value = op().await?;
        // the side effect already happened; a lost record must not turn it into a retry
        let stored = match serde_json::to_string(&value) {
            Ok(encoded) => {
                let expires_at = add(self.clock.now(), self.ttl);
                self.store.put(key.as_str(), &encoded, expires_at).await
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            warn!(key = %key, error = %err, "could not record idempotent result");
        }
        Ok(value)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(self.clock.now()).await
    }
}

/// Layer deduplicating tool invocations by (scope, tool, arguments).
#[derive(Clone)]
pub struct IdempotencyLayer {
    guard: IdempotencyGuard,
}

impl IdempotencyLayer {
    pub fn new(guard: IdempotencyGuard) -> Self {
        Self { guard }
    }
}

#[derive(Clone)]
pub struct Idempotent<S> {
    inner: S,
    guard: IdempotencyGuard,
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = Idempotent<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Idempotent {
            inner,
            guard: self.guard.clone(),
        }
    }
}

impl<S> Service<ToolInvocation> for Idempotent<S>
where
    S: Service<ToolInvocation, Response = ToolOutput, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<ToolOutput, BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: ToolInvocation) -> Self::Future {
        let inner = self.inner.clone();
        let guard = self.guard.clone();
        Box::pin(async move {
            let key = IdempotencyKey::for_tool_call(&inv.scope, &inv.name, &inv.arguments);
            let id = inv.id.clone();
            let content: String = guard
                .ensure_idempotent(&key, || async move {
                    inner.oneshot(inv).await.map(|out| out.content)
                })
                .await?;
            Ok(ToolOutput { id, content })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::observability::{MemorySink, NoopSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(clock: &ManualClock, ttl: Duration) -> IdempotencyGuard {
        IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            ttl,
            Arc::new(clock.clone()),
            Arc::new(NoopSink),
        )
    }

    #[test]
    fn keys_ignore_argument_order_but_not_scope() {
        let a = IdempotencyKey::for_tool_call("job-1", "save_note", &json!({"title": "t", "body": "b"}));
        let b = IdempotencyKey::for_tool_call("job-1", "save_note", &json!({"body": "b", "title": "t"}));
        let c = IdempotencyKey::for_tool_call("job-2", "save_note", &json!({"title": "t", "body": "b"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(
            IdempotencyKey::from_parts(&["ab", "c"]),
            IdempotencyKey::from_parts(&["a", "bc"])
        );
    }

    #[tokio::test]
    async fn second_call_returns_stored_result_without_side_effect() {
        let clock = ManualClock::default();
        let g = guard(&clock, Duration::from_secs(60));
        let writes = Arc::new(AtomicUsize::new(0));
        let key = IdempotencyKey::new("charge-42");

        for _ in 0..2 {
            let w = writes.clone();
            let out: String = g
                .ensure_idempotent(&key, || async move {
                    let n = w.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("receipt-{n}"))
                })
                .await
                .unwrap();
            assert_eq!(out, "receipt-0");
        }
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_remembered() {
        let clock = ManualClock::default();
        let g = guard(&clock, Duration::from_secs(60));
        let key = IdempotencyKey::new("k");
        let first: std::result::Result<u32, BoxError> =
            g.ensure_idempotent(&key, || async { Err("boom".into()) }).await;
        assert!(first.is_err());
        let second: u32 = g.ensure_idempotent(&key, || async { Ok(7) }).await.unwrap();
        assert_eq!(second, 7);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::default();
        let g = guard(&clock, Duration::from_secs(10));
        let key = IdempotencyKey::new("k");
        let _: u32 = g.ensure_idempotent(&key, || async { Ok(1) }).await.unwrap();
        clock.advance(Duration::from_secs(11));
        let again: u32 = g.ensure_idempotent(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(again, 2);
        clock.advance(Duration::from_secs(11));
        assert_eq!(g.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_execute_once() {
        let clock = ManualClock::default();
        let g = guard(&clock, Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));
        let key = IdempotencyKey::new("dup");
        let mut handles = Vec::new();
        for _ in 0..5 {
            let g = g.clone();
            let key = key.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                g.ensure_idempotent(&key, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok::<_, BoxError>("done".to_string())
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "done");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(g.in_flight.lock().unwrap().is_empty());
    }

    /// Accepts reads, refuses every write.
    struct ReadOnlyStore;

    #[async_trait]
    impl IdempotencyStore for ReadOnlyStore {
        async fn get(&self, _key: &str, _now: DateTime<Utc>) -> Result<Option<String>> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: &str, _expires_at: DateTime<Utc>) -> Result<()> {
            Err(AgentError::Storage("disk full".into()))
        }
        async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failed_record_still_returns_the_value_under_retry() {
        let clock = ManualClock::default();
        let g = IdempotencyGuard::new(
            Arc::new(ReadOnlyStore),
            Duration::from_secs(60),
            Arc::new(clock),
            Arc::new(NoopSink),
        );
        let charges = Arc::new(AtomicUsize::new(0));
        let key = IdempotencyKey::new("charge-9");
        let policy = crate::resilience::RetryPolicy::new(
            3,
            crate::resilience::Backoff::fixed(Duration::from_millis(1)),
        );
        let sink: SharedSink = Arc::new(NoopSink);
        let receipt: String = policy
            .execute("tool:charge", &sink, |_| {
                let (g, key, charges) = (g.clone(), key.clone(), charges.clone());
                async move {
                    g.ensure_idempotent(&key, move || async move {
                        charges.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>("receipt".to_string())
                    })
                    .await
                }
            })
            .await
            .unwrap();
        assert_eq!(receipt, "receipt");
        assert_eq!(charges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_caller_releases_its_key() {
        let clock = ManualClock::default();
        let g = guard(&clock, Duration::from_secs(60));
        let key = IdempotencyKey::new("slow");
        let started = Arc::new(tokio::sync::Notify::new());
        let s = started.clone();
        let pending = g.ensure_idempotent(&key, move || async move {
            s.notify_one();
            std::future::pending::<std::result::Result<String, BoxError>>().await
        });
        tokio::select! {
            _ = pending => panic!("operation never finishes"),
            _ = started.notified() => {}
        }
        assert!(g.in_flight.lock().unwrap().is_empty());

        // the key is usable again
        let out: String = g
            .ensure_idempotent(&key, || async { Ok("done".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "done");
    }

    #[tokio::test]
    async fn layer_replays_tool_output_under_the_new_call_id() {
        let clock = ManualClock::default();
        let sink = MemorySink::new();
        let guard = IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Duration::from_secs(60),
            Arc::new(clock),
            Arc::new(sink.clone()),
        );
        let saves = Arc::new(AtomicUsize::new(0));
        let s = saves.clone();
        let mut svc = IdempotencyLayer::new(guard).layer(tower::service_fn(move |inv: ToolInvocation| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(ToolOutput {
                    id: inv.id,
                    content: "saved".into(),
                })
            }
        }));
        let inv = |id: &str| ToolInvocation {
            id: id.into(),
            name: "save_note".into(),
            arguments: json!({"text": "buy milk"}),
            scope: "job-7".into(),
        };
        let first = svc.ready().await.unwrap().call(inv("call_a")).await.unwrap();
        let second = svc.ready().await.unwrap().call(inv("call_b")).await.unwrap();
        assert_eq!(first.content, "saved");
        assert_eq!(second.id, "call_b");
        assert_eq!(second.content, "saved");
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.count(|e| matches!(e, RuntimeEvent::IdempotentReplay { .. })),
            1
        );
    }
}
