//! # Tower Agent Runtime
//!
//! A resilient execution core for tool-calling LLM agents, built from Tower services
//! and layers.
//!
//! ## Core Concepts
//!
//! - **Agent loop**: alternates model turns and tool fan-out until the model ends its
//!   turn or the iteration cap is reached, all under a total-request deadline
//! - **Resilience stack**: every model and tool call passes through a circuit breaker,
//!   retry with jittered backoff, a token bucket and a per-call timeout; side-effecting
//!   tools are additionally guarded against duplicate execution
//! - **Graceful degradation**: optional tools that fail are reported to the model and the
//!   user instead of failing the run
//! - **Queue and workers**: jobs are submitted with a priority, leased by stateless
//!   workers, and reclaimed by a reaper if a worker dies
//! - **Shared state**: breaker counters, bucket levels, idempotency records, jobs and
//!   conversations live behind store traits with in-memory and SQLite backends
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_agent_runtime::{
//!     tool_typed, AgentBuilder, ModelResponse, RunRequest, RuntimeConfig, ScriptedProvider,
//! };
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: f64,
//!     b: f64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let add = tool_typed("add", "Add two numbers", |args: AddArgs| async move {
//!     Ok(args.a + args.b)
//! });
//!
//! let agent = AgentBuilder::new(RuntimeConfig::default())
//!     .tool(add)
//!     .provider(ScriptedProvider::new().respond(ModelResponse::end_turn("4")))
//!     .build()?;
//!
//! let run = agent.run(RunRequest::new("What is 2 + 2?")).await?;
//! println!("{}", run.response);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod items;
pub mod jobs;
pub mod observability;
pub mod provider;
pub mod resilience;
pub mod sqlite;
pub mod state;
pub mod tools;
pub mod worker;

pub use agent::{
    Agent, AgentBuilder, AgentLoop, AgentLoopLayer, AgentRun, LoopState, RunOutcome, RunRequest,
    Step, StepOutcome, StepRequest,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigBuilder, RuntimeConfig};
pub use error::{AgentError, ErrorKind, Result, ToolError, ToolErrorClass};
pub use items::{Message, ModelRequest, ModelResponse, Role, StopReason, ToolCall, ToolResult, Usage};
pub use jobs::{InMemoryJobQueue, Job, JobQueue, JobStatus, NewJob, Priority};
pub use observability::{EventSink, MemorySink, RuntimeEvent, SharedSink, TracingSink};
pub use provider::{ModelService, OpenAiProvider, ScriptedProvider};
pub use resilience::{CircuitBreaker, IdempotencyGuard, Resilience, RetryPolicy, SharedStores, TokenBucket};
pub use sqlite::SqliteStore;
pub use state::{ConversationState, ConversationStore, InMemoryConversationStore};
pub use tools::{tool_typed, Criticality, ToolDef, ToolInvocation, ToolOutput, ToolRegistry, ToolRouter};
pub use worker::{Reaper, Worker, WorkerPool};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
