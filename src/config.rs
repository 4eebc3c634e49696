//! Configuration for the agent runtime
//!
//! One [`RuntimeConfig`] carries every tunable: retry and breaker policy, rate limits,
//! the three timeout scopes, loop bounds, queue/lease behaviour and worker pool sizing.
//! Durations are written as (fractional) seconds in TOML and environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub conversation: ConversationConfig,
    pub idempotency: IdempotencyConfig,
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    /// sqlx connection string for the shared store
    pub database_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            conversation: ConversationConfig::default(),
            idempotency: IdempotencyConfig::default(),
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            database_url: "sqlite:agent-runtime.db?mode=rwc".to_string(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,

    #[serde(with = "secs")]
    pub initial_delay: Duration,

    #[serde(with = "secs")]
    pub max_delay: Duration,

    /// Exponential base
    pub base: f64,

    /// Scale each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            base: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker configuration, applied per dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,

    #[serde(with = "secs")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// A single token bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Burst size; defaults to `rate`
    #[serde(default)]
    pub capacity: Option<f64>,
}

impl BucketConfig {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn effective_capacity(&self) -> f64 {
        self.capacity.unwrap_or(self.rate)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket guarding model calls; `None` disables throttling
    pub model: Option<BucketConfig>,

    /// Bucket shared by all tool calls
    pub tools: Option<BucketConfig>,

    /// Longest a caller waits for a token before failing with `RateLimited`
    #[serde(with = "secs")]
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            model: Some(BucketConfig::new(10.0).with_capacity(20.0)),
            tools: None,
            max_wait: Duration::from_secs(30),
        }
    }
}

/// The three nested time bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "secs")]
    pub tool: Duration,

    #[serde(with = "secs")]
    pub model_call: Duration,

    #[serde(with = "secs")]
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool: Duration::from_secs(30),
            model_call: Duration::from_secs(30),
            request: Duration::from_secs(120),
        }
    }
}

/// Agent loop options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Run the tool calls of one turn concurrently
    pub parallel_tools: bool,
    /// Upper bound on concurrently running tool calls within a turn
    pub tool_concurrency: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            system_prompt: Some("You are a helpful assistant. Use the available tools when they help answer the user.".to_string()),
            max_tokens: Some(1024),
            temperature: None,
            parallel_tools: true,
            tool_concurrency: None,
        }
    }
}

/// Job queue and lease options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a worker owns a job before the reaper may reclaim it
    #[serde(with = "secs")]
    pub lease_ttl: Duration,

    /// Total deliveries allowed per job, first one included
    pub max_attempts: u32,

    /// How long terminal jobs stay readable
    #[serde(with = "secs")]
    pub retention: Duration,

    /// Queued jobs above which submissions are refused
    pub max_queue_depth: usize,

    /// Never lease two jobs of one user at the same time
    pub serialize_per_user: bool,

    #[serde(with = "secs")]
    pub reaper_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(150),
            max_attempts: 2,
            retention: Duration::from_secs(3600),
            max_queue_depth: 10_000,
            serialize_per_user: true,
            reaper_interval: Duration::from_secs(15),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,

    /// Priority levels to poll, most urgent first; empty polls every level
    pub priorities: Vec<u8>,

    #[serde(with = "secs")]
    pub idle_backoff_min: Duration,

    #[serde(with = "secs")]
    pub idle_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            priorities: Vec::new(),
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(2),
        }
    }
}

/// Conversation state retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    #[serde(with = "secs")]
    pub ttl: Duration,
    pub max_messages: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_messages: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    #[serde(with = "secs")]
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

/// OpenAI-compatible endpoint used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub model: String,
    pub api_base: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_base: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RuntimeConfig =
            toml::from_str(&contents).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `AGENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = RuntimeConfig::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Layer variables from `lookup` over the current values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| AgentError::Config(format!("{key}: cannot parse {raw:?}")))
        }
        fn seconds(key: &str, raw: String) -> Result<Duration> {
            let v: f64 = parse(key, raw)?;
            Duration::try_from_secs_f64(v)
                .map_err(|_| AgentError::Config(format!("{key}: invalid duration {v}")))
        }

        if let Some(v) = lookup("AGENT_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("AGENT_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("AGENT_MODEL") {
            self.provider.model = v;
        }
        if let Some(v) = lookup("AGENT_API_BASE") {
            self.provider.api_base = Some(v);
        }
        if let Some(v) = lookup("AGENT_MAX_ITERATIONS") {
            self.agent.max_iterations = parse("AGENT_MAX_ITERATIONS", v)?;
        }
        if let Some(v) = lookup("AGENT_MAX_RETRIES") {
            self.retry.max_retries = parse("AGENT_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("AGENT_TOOL_TIMEOUT") {
            self.timeouts.tool = seconds("AGENT_TOOL_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("AGENT_LLM_TIMEOUT") {
            self.timeouts.model_call = seconds("AGENT_LLM_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("AGENT_TOTAL_TIMEOUT") {
            self.timeouts.request = seconds("AGENT_TOTAL_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("AGENT_WORKERS") {
            self.worker.concurrency = parse("AGENT_WORKERS", v)?;
        }
        if let Some(v) = lookup("AGENT_MAX_QUEUE_DEPTH") {
            self.queue.max_queue_depth = parse("AGENT_MAX_QUEUE_DEPTH", v)?;
        }
        if let Some(v) = lookup("AGENT_LEASE_TTL") {
            self.queue.lease_ttl = seconds("AGENT_LEASE_TTL", v)?;
        }
        if let Some(v) = lookup("AGENT_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = parse("AGENT_BREAKER_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("AGENT_BREAKER_RECOVERY") {
            self.breaker.recovery_timeout = seconds("AGENT_BREAKER_RECOVERY", v)?;
        }
        if let Some(v) = lookup("AGENT_LLM_RATE") {
            let rate: f64 = parse("AGENT_LLM_RATE", v)?;
            let capacity = self.rate_limit.model.as_ref().and_then(|b| b.capacity);
            self.rate_limit.model = Some(BucketConfig { rate, capacity });
        }
        Ok(())
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(AgentError::Config("agent.max_iterations must be at least 1".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(AgentError::Config("breaker.failure_threshold must be at least 1".into()));
        }
        if self.retry.base < 1.0 {
            return Err(AgentError::Config("retry.base must be >= 1.0".into()));
        }
        for (name, bucket) in [("model", &self.rate_limit.model), ("tools", &self.rate_limit.tools)] {
            if let Some(b) = bucket {
                if b.rate <= 0.0 || b.effective_capacity() <= 0.0 {
                    return Err(AgentError::Config(format!(
                        "rate_limit.{name}: rate and capacity must be positive"
                    )));
                }
            }
        }
        if self.queue.max_attempts == 0 {
            return Err(AgentError::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.lease_ttl <= self.timeouts.request {
            return Err(AgentError::Config(format!(
                "queue.lease_ttl ({:?}) must exceed timeouts.request ({:?})",
                self.queue.lease_ttl, self.timeouts.request
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(AgentError::Config("worker.concurrency must be at least 1".into()));
        }
        if self.worker.priorities.iter().any(|p| *p > crate::jobs::Priority::MAX.get()) {
            return Err(AgentError::Config("worker.priorities must be within 0..=9".into()));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: RuntimeConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.config.agent.max_iterations = n;
        self
    }

    pub fn max_retries(mut self, n: usize) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry.initial_delay = initial;
        self.config.retry.max_delay = max;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    pub fn breaker(mut self, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        self.config.breaker = BreakerConfig {
            failure_threshold,
            recovery_timeout,
        };
        self
    }

    pub fn model_rate_limit(mut self, bucket: Option<BucketConfig>) -> Self {
        self.config.rate_limit.model = bucket;
        self
    }

    pub fn tool_rate_limit(mut self, bucket: Option<BucketConfig>) -> Self {
        self.config.rate_limit.tools = bucket;
        self
    }

    pub fn timeouts(mut self, tool: Duration, model_call: Duration, request: Duration) -> Self {
        self.config.timeouts = TimeoutConfig {
            tool,
            model_call,
            request,
        };
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.config.queue.lease_ttl = ttl;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.worker.concurrency = n;
        self
    }

    pub fn idle_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.worker.idle_backoff_min = min;
        self.config.worker.idle_backoff_max = max;
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serialize durations as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base, 2.0);
        assert!(config.retry.jitter);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.timeouts.request, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bucket_capacity_defaults_to_rate() {
        assert_eq!(BucketConfig::new(4.0).effective_capacity(), 4.0);
        assert_eq!(BucketConfig::new(4.0).with_capacity(8.0).effective_capacity(), 8.0);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_iterations(3)
            .max_retries(1)
            .breaker(2, Duration::from_secs(5))
            .workers(8)
            .build()
            .unwrap();
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.worker.concurrency, 8);
    }

    #[test]
    fn builder_rejects_lease_shorter_than_request_timeout() {
        let err = ConfigBuilder::new()
            .lease_ttl(Duration::from_secs(60))
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn toml_uses_seconds() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            database_url = "sqlite::memory:"

            [timeouts]
            tool = 5
            model_call = 12.5

            [agent]
            max_iterations = 4

            [rate_limit.model]
            rate = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.tool, Duration::from_secs(5));
        assert_eq!(config.timeouts.model_call, Duration::from_millis(12_500));
        assert_eq!(config.timeouts.request, Duration::from_secs(120));
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.rate_limit.model, Some(BucketConfig::new(2.0)));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "[worker]\nconcurrency = 2\n").unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.worker.concurrency, 2);
    }

    #[test]
    fn env_overrides_layer_over_defaults() {
        let vars: HashMap<&str, &str> = [
            ("AGENT_MAX_ITERATIONS", "6"),
            ("AGENT_TOOL_TIMEOUT", "2.5"),
            ("AGENT_LLM_RATE", "3"),
        ]
        .into_iter()
        .collect();
        let mut config = RuntimeConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.agent.max_iterations, 6);
        assert_eq!(config.timeouts.tool, Duration::from_millis(2500));
        assert_eq!(config.rate_limit.model, Some(BucketConfig::new(3.0).with_capacity(20.0)));
    }

    #[test]
    fn env_rejects_garbage() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env(|k| (k == "AGENT_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AGENT_WORKERS"));
    }
}
