//! Agentic loop controller
//!
//! What this module provides
//! - [`Step`]: one model call plus the ordered fan-out of the tool calls it requested,
//!   with criticality-aware handling of tool failures
//! - [`AgentLoop`] / [`AgentLoopLayer`]: repeats `Step` until the model ends its turn
//!   or the iteration cap is hit, under the total-request timeout
//! - [`AgentBuilder`]: wires a provider and tools through the resilience stack
//!
//! State machine
//! - `Running(i)` → model call; `tool_use` → `AwaitingTool` → `Running(i + 1)`
//! - `end_turn` → `Done`; unrecoverable error → `Failed`
//! - `max_iterations` turns without an end → `IterationLimitReached` (not an error)
//!
//! Degradation
//! - Validation errors and unknown tool names go back to the model as error results
//! - An optional tool that fails becomes `"<tool> unavailable: <reason>"`
//! - A critical tool that fails ends the run with [`AgentError::CriticalTool`]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AgentConfig, RuntimeConfig};
use crate::error::{AgentError, Result, TimeoutScope, ToolError, ToolErrorClass};
use crate::items::{Message, ModelRequest, ModelResponse, StopReason, ToolCall, ToolResult, Usage};
use crate::observability::{RuntimeEvent, SharedSink};
use crate::provider::{ModelService, ModelSvc};
use crate::resilience::stack::MODEL_DEPENDENCY;
use crate::resilience::{with_timeout, Resilience};
use crate::tools::{Criticality, ToolDef, ToolInvocation, ToolRegistry, ToolRouter};

/// Text returned when the iteration cap ends a run.
pub const ITERATION_LIMIT_RESPONSE: &str =
    "I could not finish this request within the allowed number of steps.";

/// Observable state of the loop controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running { iteration: usize },
    AwaitingTool { iteration: usize, pending: usize },
    Done,
    Failed { code: &'static str },
    IterationLimitReached,
}

/// Input to one [`Step`].
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Full conversation so far, user message included
    pub messages: Vec<Message>,
    /// Request the step belongs to; scopes idempotency keys
    pub scope: String,
    pub iteration: usize,
}

/// Outcome of a single agent step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Tools ran; the model needs another turn.
    Next {
        appended: Vec<Message>,
        usage: Usage,
        invoked_tools: Vec<String>,
        degraded: Vec<String>,
    },
    /// The model ended its turn.
    Done {
        text: String,
        appended: Vec<Message>,
        usage: Usage,
    },
}

/// One-step agent service over a model service `M`.
#[derive(Clone)]
pub struct Step<M> {
    model: M,
    tools: ToolRouter,
    system: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    parallel_tools: bool,
    tool_concurrency_limit: Option<usize>,
    sink: SharedSink,
}

impl<M> Step<M> {
    pub fn new(model: M, tools: ToolRouter, sink: SharedSink) -> Self {
        Self {
            model,
            tools,
            system: None,
            max_tokens: None,
            temperature: None,
            parallel_tools: true,
            tool_concurrency_limit: None,
            sink,
        }
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.system = config.system_prompt.clone();
        self.max_tokens = config.max_tokens;
        self.temperature = config.temperature;
        self.parallel_tools = config.parallel_tools;
        self.tool_concurrency_limit = config.tool_concurrency;
        self
    }

    pub fn system(mut self, prompt: impl Into<String>) -> Self {
        self.system = Some(prompt.into());
        self
    }

    pub fn parallel_tools(mut self, enabled: bool) -> Self {
        self.parallel_tools = enabled;
        self
    }

    pub fn tool_concurrency_limit(mut self, limit: usize) -> Self {
        self.tool_concurrency_limit = Some(limit);
        self
    }
}

/// Short, model-facing reason for a failed tool.
fn failure_reason(err: &BoxError) -> String {
    if let Some(e) = err.downcast_ref::<AgentError>() {
        return match e {
            AgentError::CircuitOpen { .. } => "circuit open".to_string(),
            AgentError::Timeout { .. } => "timed out".to_string(),
            AgentError::RateLimited { .. } => "rate limited".to_string(),
            AgentError::RetryExhausted { source, .. } => failure_reason(source),
            other => other.to_string(),
        };
    }
    if let Some(e) = err.downcast_ref::<ToolError>() {
        return match e.class {
            ToolErrorClass::Timeout => "timed out".to_string(),
            _ => e.message.clone(),
        };
    }
    err.to_string()
}

fn is_validation(err: &BoxError) -> bool {
    matches!(
        err.downcast_ref::<ToolError>(),
        Some(ToolError {
            class: ToolErrorClass::Validation,
            ..
        })
    )
}

/// What became of one tool call.
struct Dispatched {
    result: ToolResult,
    degraded: Option<String>,
}

async fn dispatch(
    tools: ToolRouter,
    call: ToolCall,
    scope: String,
    sink: SharedSink,
) -> Result<Dispatched> {
    let criticality = tools.criticality(&call.name);
    let inv = ToolInvocation {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.input,
        scope,
    };
    match tools.oneshot(inv).await {
        Ok(out) => Ok(Dispatched {
            result: ToolResult::ok(out.id, out.content),
            degraded: None,
        }),
        Err(err) if is_validation(&err) => {
            debug!(tool = %call.name, error = %err, "returning validation error to the model");
            Ok(Dispatched {
                result: ToolResult::error(call.id, err.to_string()),
                degraded: None,
            })
        }
        Err(err) => match criticality {
            Criticality::Optional => {
                let reason = failure_reason(&err);
                warn!(tool = %call.name, %reason, "optional tool unavailable, continuing");
                sink.record(RuntimeEvent::ToolDegraded {
                    tool: call.name.clone(),
                    reason: reason.clone(),
                });
                Ok(Dispatched {
                    result: ToolResult::error(call.id, format!("{} unavailable: {}", call.name, reason)),
                    degraded: Some(call.name),
                })
            }
            Criticality::Critical => Err(AgentError::CriticalTool {
                tool: call.name,
                source: err,
            }),
        },
    }
}

impl<M> Service<StepRequest> for Step<M>
where
    M: ModelService,
    M::Future: Send + 'static,
{
    type Response = StepOutcome;
    type Error = AgentError;
    type Future = Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        // tool and model readiness is awaited inside `call`
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StepRequest) -> Self::Future {
        let model = self.model.clone();
        let tools = self.tools.clone();
        let sink = self.sink.clone();
        let parallel_tools = self.parallel_tools;
        let limit = self.tool_concurrency_limit;
        let model_req = ModelRequest {
            system: self.system.clone(),
            messages: req.messages,
            tools: self.tools.specs().to_vec(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let StepRequest {
            scope, iteration, ..
        } = req;

        Box::pin(async move {
            let response: ModelResponse = model
                .oneshot(model_req)
                .await
                .map_err(|e| AgentError::from_boxed(e, MODEL_DEPENDENCY))?;
            let usage = response.usage;

            match response.stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens => {
                    let text = response.content.unwrap_or_default();
                    return Ok(StepOutcome::Done {
                        appended: vec![Message::assistant(text.clone())],
                        text,
                        usage,
                    });
                }
                StopReason::ToolUse if response.tool_calls.is_empty() => {
                    return Err(AgentError::ModelBehavior(
                        "tool_use stop reason without tool calls".into(),
                    ));
                }
                StopReason::ToolUse => {}
            }

            let mut appended = vec![response.to_message()];
            let calls = response.tool_calls;
            let invoked_tools: Vec<String> = calls.iter().map(|c| c.name.clone()).collect();
            sink.record(RuntimeEvent::LoopPhase {
                scope: scope.clone(),
                state: LoopState::AwaitingTool {
                    iteration,
                    pending: calls.len(),
                },
            });

            let dispatched: Vec<Dispatched> = if calls.len() > 1 && parallel_tools {
                // fire concurrently, results come back in request order
                let sem = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
                let futures: Vec<_> = calls
                    .into_iter()
                    .map(|call| {
                        let tools = tools.clone();
                        let scope = scope.clone();
                        let sink = sink.clone();
                        let sem = sem.clone();
                        async move {
                            let _permit = match sem {
                                Some(s) => s.acquire_owned().await.ok(),
                                None => None,
                            };
                            dispatch(tools, call, scope, sink).await
                        }
                    })
                    .collect();
                futures::future::try_join_all(futures).await?
            } else {
                let mut out = Vec::with_capacity(calls.len());
                for call in calls {
                    out.push(dispatch(tools.clone(), call, scope.clone(), sink.clone()).await?);
                }
                out
            };

            let mut degraded = Vec::new();
            for d in dispatched {
                appended.push(Message::tool_result(&d.result));
                degraded.extend(d.degraded);
            }

            Ok(StepOutcome::Next {
                appended,
                usage,
                invoked_tools,
                degraded,
            })
        })
    }
}

/// Why a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    IterationLimitReached,
}

/// One user message to run through the loop.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub history: Vec<Message>,
    pub message: String,
    pub scope: String,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            history: Vec::new(),
            message: message.into(),
            scope: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Idempotency scope; redeliveries of one job should reuse it.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Final run summary from the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub outcome: RunOutcome,
    /// Final text, including the degradation note when one applies
    pub response: String,
    /// Messages this run added to the conversation, starting with the user message
    pub messages: Vec<Message>,
    /// Model turns taken
    pub iterations: usize,
    pub usage: Usage,
    pub degraded_tools: Vec<String>,
}

fn degradation_note(tools: &[String]) -> String {
    format!(
        "Note: some information may be incomplete because these tools were unavailable: {}.",
        tools.join(", ")
    )
}

/// Layer to wrap a step service with the bounded loop.
#[derive(Clone)]
pub struct AgentLoopLayer {
    max_iterations: usize,
    request_timeout: Duration,
    sink: SharedSink,
}

impl AgentLoopLayer {
    pub fn new(max_iterations: usize, request_timeout: Duration, sink: SharedSink) -> Self {
        Self {
            max_iterations,
            request_timeout,
            sink,
        }
    }
}

#[derive(Clone)]
pub struct AgentLoop<S> {
    inner: S,
    max_iterations: usize,
    request_timeout: Duration,
    sink: SharedSink,
}

impl<S> Layer<S> for AgentLoopLayer {
    type Service = AgentLoop<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AgentLoop {
            inner,
            max_iterations: self.max_iterations,
            request_timeout: self.request_timeout,
            sink: self.sink.clone(),
        }
    }
}

impl<S> AgentLoop<S>
where
    S: Service<StepRequest, Response = StepOutcome, Error = AgentError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    /// Run one request to completion.
    pub async fn run(&self, req: RunRequest) -> Result<AgentRun> {
        self.clone().oneshot(req).await
    }
}

async fn drive<S>(
    step: S,
    req: RunRequest,
    max_iterations: usize,
    sink: SharedSink,
) -> Result<AgentRun>
where
    S: Service<StepRequest, Response = StepOutcome, Error = AgentError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    let RunRequest {
        history,
        message,
        scope,
        cancel,
    } = req;
    let user = Message::user(message);
    let mut conversation = history;
    conversation.push(user.clone());
    let mut added = vec![user];
    let mut usage = Usage::default();
    let mut degraded: Vec<String> = Vec::new();

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        sink.record(RuntimeEvent::LoopPhase {
            scope: scope.clone(),
            state: LoopState::Running { iteration },
        });
        let outcome = step
            .clone()
            .oneshot(StepRequest {
                messages: conversation.clone(),
                scope: scope.clone(),
                iteration,
            })
            .await?;

        match outcome {
            StepOutcome::Done {
                text,
                appended,
                usage: u,
            } => {
                usage.add(u);
                added.extend(appended);
                let response = if degraded.is_empty() {
                    text
                } else {
                    format!("{}\n\n{}", text, degradation_note(&degraded))
                };
                return Ok(AgentRun {
                    outcome: RunOutcome::Done,
                    response,
                    messages: added,
                    iterations: iteration + 1,
                    usage,
                    degraded_tools: degraded,
                });
            }
            StepOutcome::Next {
                appended,
                usage: u,
                invoked_tools,
                degraded: d,
            } => {
                debug!(iteration, tools = ?invoked_tools, "tool turn finished");
                usage.add(u);
                conversation.extend(appended.iter().cloned());
                added.extend(appended);
                for name in d {
                    if !degraded.contains(&name) {
                        degraded.push(name);
                    }
                }
            }
        }
    }

    info!(%scope, max_iterations, "iteration limit reached");
    added.push(Message::assistant(ITERATION_LIMIT_RESPONSE));
    Ok(AgentRun {
        outcome: RunOutcome::IterationLimitReached,
        response: ITERATION_LIMIT_RESPONSE.to_string(),
        messages: added,
        iterations: max_iterations,
        usage,
        degraded_tools: degraded,
    })
}

impl<S> Service<RunRequest> for AgentLoop<S>
where
    S: Service<StepRequest, Response = StepOutcome, Error = AgentError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = AgentRun;
    type Error = AgentError;
    type Future = Pin<Box<dyn Future<Output = Result<AgentRun>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        let step = self.inner.clone();
        let max_iterations = self.max_iterations;
        let request_timeout = self.request_timeout;
        let sink = self.sink.clone();
        Box::pin(async move {
            let scope = req.scope.clone();
            let cancel = req.cancel.clone();
            let bounded = with_timeout(
                TimeoutScope::Request,
                request_timeout,
                drive(step, req, max_iterations, sink.clone()),
            );
            // dropping the loop future cancels in-flight model and tool calls
            let result = tokio::select! {
                r = bounded => r,
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
            };
            let state = match &result {
                Ok(run) if run.outcome == RunOutcome::IterationLimitReached => {
                    LoopState::IterationLimitReached
                }
                Ok(_) => LoopState::Done,
                Err(e) => {
                    warn!(%scope, error = %e, "agent run failed");
                    LoopState::Failed { code: e.code() }
                }
            };
            sink.record(RuntimeEvent::LoopPhase { scope, state });
            result
        })
    }
}

/// The agent as assembled by [`AgentBuilder`].
pub type Agent = AgentLoop<Step<ModelSvc>>;

/// Wires a model provider and tools through the resilience stack.
pub struct AgentBuilder {
    config: RuntimeConfig,
    tools: Vec<ToolDef>,
    provider: Option<ModelSvc>,
    resilience: Option<Resilience>,
}

impl AgentBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            provider: None,
            resilience: None,
        }
    }

    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Raw model client; the builder wraps it in the `llm-api` stack.
    pub fn provider<P>(mut self, provider: P) -> Self
    where
        P: ModelService,
        P::Future: Send + 'static,
    {
        self.provider = Some(ModelSvc::new(provider));
        self
    }

    /// Share breaker, bucket and idempotency state with other agents or processes.
    pub fn resilience(mut self, resilience: Resilience) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Validates tool registrations and assembles the loop.
    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("no model provider configured".into()))?;
        let resilience = self
            .resilience
            .unwrap_or_else(|| Resilience::in_memory(&self.config));
        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool)?;
        }
        let router = registry.into_router(&resilience);
        let model = resilience.model_service(provider);
        let sink = resilience.sink().clone();
        let step = Step::new(model, router, sink.clone()).with_config(&self.config.agent);
        Ok(AgentLoopLayer::new(self.config.agent.max_iterations, self.config.timeouts.request, sink)
            .layer(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use crate::provider::ScriptedProvider;
    use crate::tools::{ToolOutput, ToolSvc};
    use serde_json::json;
    use tower::util::BoxCloneSyncService;

    fn echo_tool(name: &str) -> ToolDef {
        let svc: ToolSvc = BoxCloneSyncService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Ok::<_, BoxError>(ToolOutput {
                id: inv.id,
                content: format!("{}:{}", inv.name, inv.arguments),
            })
        }));
        ToolDef::from_service(name, "echo", json!({"type": "object"}), svc)
    }

    fn step_with(provider: ScriptedProvider, tools: Vec<ToolDef>, sink: &MemorySink) -> Step<ScriptedProvider> {
        Step::new(provider, ToolRouter::new(tools), Arc::new(sink.clone()))
    }

    fn request(messages: Vec<Message>) -> StepRequest {
        StepRequest {
            messages,
            scope: "s".into(),
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn end_turn_is_done_with_plain_assistant_message() {
        let sink = MemorySink::new();
        let provider = ScriptedProvider::new().respond(ModelResponse::end_turn("hello"));
        let out = step_with(provider, vec![], &sink)
            .oneshot(request(vec![Message::user("hi")]))
            .await
            .unwrap();
        match out {
            StepOutcome::Done { text, appended, .. } => {
                assert_eq!(text, "hello");
                assert_eq!(appended.len(), 1);
                assert!(appended[0].tool_calls.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_results_keep_request_order() {
        let sink = MemorySink::new();
        let calls = vec![
            ToolCall::new("a", json!({"n": 1})),
            ToolCall::new("b", json!({"n": 2})),
            ToolCall::new("a", json!({"n": 3})),
        ];
        let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
        let provider = ScriptedProvider::new().respond(ModelResponse::tool_use(calls));
        let step = step_with(provider, vec![echo_tool("a"), echo_tool("b")], &sink).tool_concurrency_limit(2);
        let out = step.oneshot(request(vec![Message::user("go")])).await.unwrap();
        match out {
            StepOutcome::Next {
                appended,
                invoked_tools,
                ..
            } => {
                assert_eq!(appended.len(), 4);
                let result_ids: Vec<_> = appended[1..]
                    .iter()
                    .map(|m| m.tool_call_id.clone().unwrap())
                    .collect();
                assert_eq!(result_ids, ids);
                assert_eq!(appended[2].content, r#"b:{"n":2}"#);
                assert_eq!(invoked_tools, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_goes_back_to_the_model() {
        let sink = MemorySink::new();
        let provider =
            ScriptedProvider::new().respond(ModelResponse::tool_use(vec![ToolCall::new("nope", json!({}))]));
        let out = step_with(provider, vec![], &sink)
            .oneshot(request(vec![Message::user("go")]))
            .await
            .unwrap();
        match out {
            StepOutcome::Next { appended, degraded, .. } => {
                assert!(appended[1].is_error);
                assert!(appended[1].content.contains("unknown tool"));
                assert!(degraded.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_use_without_calls_is_a_model_error() {
        let sink = MemorySink::new();
        let provider = ScriptedProvider::new().respond(ModelResponse::tool_use(vec![]));
        let err = step_with(provider, vec![], &sink)
            .oneshot(request(vec![Message::user("go")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ModelBehavior(_)));
    }

    #[test]
    fn failure_reasons_unwrap_retry_exhaustion() {
        let err: BoxError = Box::new(AgentError::RetryExhausted {
            dependency: "tool:weather".into(),
            attempts: 4,
            source: Box::new(AgentError::Timeout {
                scope: TimeoutScope::Tool,
                after: Duration::from_secs(30),
            }),
        });
        assert_eq!(failure_reason(&err), "timed out");
        let err: BoxError = Box::new(AgentError::CircuitOpen {
            dependency: "tool:weather".into(),
            retry_in: Duration::from_secs(10),
        });
        assert_eq!(failure_reason(&err), "circuit open");
    }

    #[tokio::test]
    async fn loop_accumulates_usage_and_messages() {
        let sink = MemorySink::new();
        let provider = ScriptedProvider::new()
            .respond(
                ModelResponse::tool_use(vec![ToolCall::new("a", json!({}))]).with_usage(Usage::new(10, 5)),
            )
            .respond(ModelResponse::end_turn("done").with_usage(Usage::new(20, 3)));
        let step = step_with(provider, vec![echo_tool("a")], &sink);
        let agent = AgentLoopLayer::new(5, Duration::from_secs(10), Arc::new(sink.clone())).layer(step);
        let run = agent
            .run(RunRequest::new("go").history(vec![Message::user("earlier"), Message::assistant("ok")]))
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Done);
        assert_eq!(run.iterations, 2);
        assert_eq!(run.usage, Usage::new(30, 8));
        // user, assistant(tool call), tool result, final assistant
        assert_eq!(run.messages.len(), 4);
        assert_eq!(run.messages[0].content, "go");
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RuntimeEvent::LoopPhase { state: LoopState::Done, .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let sink = MemorySink::new();
        let provider = ScriptedProvider::new()
            .repeat(ModelResponse::end_turn("late"))
            .with_latency(Duration::from_secs(60));
        let step = step_with(provider, vec![], &sink);
        let agent = AgentLoopLayer::new(5, Duration::from_secs(120), Arc::new(sink.clone())).layer(step);
        let token = CancellationToken::new();
        let handle = {
            let agent = agent.clone();
            let token = token.clone();
            tokio::spawn(async move { agent.run(RunRequest::new("go").cancel(token)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[test]
    fn builder_requires_a_provider_and_valid_tools() {
        let err = AgentBuilder::new(RuntimeConfig::default()).build().err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));

        let err = AgentBuilder::new(RuntimeConfig::default())
            .provider(ScriptedProvider::new())
            .tool(echo_tool("dup"))
            .tool(echo_tool("dup"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Registration(_)));
    }
}
