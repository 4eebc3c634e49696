//! Model provider abstraction
//!
//! The loop talks to the model through any
//! `Service<ModelRequest, Response = ModelResponse, Error = BoxError>`.
//! Two implementations ship with the crate:
//! - [`OpenAiProvider`]: OpenAI-compatible chat completions via `async-openai`, with
//!   API failures classified into transient and permanent errors at the adapter
//! - [`ScriptedProvider`]: replays canned responses, for tests and local runs

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
        FinishReason, FunctionCall, FunctionObjectArgs,
    },
    Client,
};
use serde_json::Value;
use tower::{util::BoxCloneSyncService, BoxError, Service};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{AgentError, ErrorKind};
use crate::items::{Message, ModelRequest, ModelResponse, Role, StopReason, ToolCall, ToolSpec, Usage};
use crate::resilience::stack::MODEL_DEPENDENCY;

/// Anything the loop can use as a model client.
pub trait ModelService:
    Service<ModelRequest, Response = ModelResponse, Error = BoxError> + Clone + Send + Sync + 'static
{
}

impl<T> ModelService for T where
    T: Service<ModelRequest, Response = ModelResponse, Error = BoxError> + Clone + Send + Sync + 'static
{
}

/// Boxed model service type alias.
pub type ModelSvc = BoxCloneSyncService<ModelRequest, ModelResponse, BoxError>;

// =============================
// OpenAI-compatible adapter
// =============================

/// OpenAI chat completions provider using async-openai
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    /// Create a provider reading `OPENAI_API_KEY` from the environment
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
        }
    }

    /// Create with a custom client
    pub fn with_client(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut openai = OpenAIConfig::new();
        if let Some(base) = &config.api_base {
            openai = openai.with_api_base(base);
        }
        Self::with_client(Client::with_config(openai), config.model.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, req: &ModelRequest) -> Result<CreateChatCompletionRequest, AgentError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &req.system {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(invalid)?
                    .into(),
            );
        }
        for msg in &req.messages {
            messages.push(convert_message(msg)?);
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages);
        if !req.tools.is_empty() {
            let tools = req
                .tools
                .iter()
                .map(convert_tool)
                .collect::<Result<Vec<_>, _>>()?;
            args.tools(tools);
        }
        if let Some(t) = req.temperature {
            args.temperature(t);
        }
        if let Some(max) = req.max_tokens {
            args.max_tokens(max);
        }
        args.build().map_err(invalid)
    }
}

fn invalid(err: OpenAIError) -> AgentError {
    AgentError::permanent(MODEL_DEPENDENCY, err.to_string())
}

/// Convert our Message to OpenAI's format
fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage, AgentError> {
    let converted: ChatCompletionRequestMessage = match msg.role {
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(msg.content.clone())
            .build()
            .map_err(invalid)?
            .into(),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if !msg.content.is_empty() {
                builder.content(msg.content.clone());
            }
            if !msg.tool_calls.is_empty() {
                let calls: Vec<ChatCompletionMessageToolCall> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.input.to_string(),
                        },
                    })
                    .collect();
                builder.tool_calls(calls);
            }
            builder.build().map_err(invalid)?.into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .content(msg.content.clone())
            .tool_call_id(msg.tool_call_id.clone().unwrap_or_default())
            .build()
            .map_err(invalid)?
            .into(),
    };
    Ok(converted)
}

fn convert_tool(spec: &ToolSpec) -> Result<ChatCompletionTool, AgentError> {
    let function = FunctionObjectArgs::default()
        .name(spec.name.clone())
        .description(spec.description.clone())
        .parameters(spec.parameters.clone())
        .build()
        .map_err(invalid)?;
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(function)
        .build()
        .map_err(invalid)
}

fn convert_response(response: CreateChatCompletionResponse) -> Result<ModelResponse, AgentError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::ModelBehavior("no choices in response".into()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            // unparsable arguments reach the tool as a string and fail validation there
            input: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments)),
        })
        .collect();

    let stop_reason = match choice.finish_reason {
        Some(FinishReason::ToolCalls) | Some(FinishReason::FunctionCall) => StopReason::ToolUse,
        Some(FinishReason::Length) => StopReason::MaxTokens,
        _ if !tool_calls.is_empty() => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = response
        .usage
        .map(|u| Usage::new(u64::from(u.prompt_tokens), u64::from(u.completion_tokens)))
        .unwrap_or_default();

    Ok(ModelResponse {
        content: choice.message.content,
        tool_calls,
        stop_reason,
        usage,
    })
}

/// Rate limits, overload and transport failures are transient; anything the API
/// rejected on its merits is permanent.
pub fn classify_openai_error(err: OpenAIError) -> AgentError {
    let kind = match &err {
        OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => ErrorKind::Transient,
        OpenAIError::ApiError(api) => {
            let tag = api
                .code
                .as_deref()
                .or(api.r#type.as_deref())
                .unwrap_or_default();
            match tag {
                "insufficient_quota" => ErrorKind::Permanent,
                t if t.contains("rate_limit") || t.contains("server_error") || t.contains("overloaded") => {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Permanent,
            }
        }
        OpenAIError::JSONDeserialize(_) => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    };
    match kind {
        ErrorKind::Transient => AgentError::transient(MODEL_DEPENDENCY, err.to_string()),
        _ => AgentError::permanent(MODEL_DEPENDENCY, err.to_string()),
    }
}

impl Service<ModelRequest> for OpenAiProvider {
    type Response = ModelResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ModelResponse, BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let client = self.client.clone();
        let built = self.build_request(&req);
        Box::pin(async move {
            let request = built?;
            debug!(model = %request.model, messages = request.messages.len(), "chat completion");
            let response = client
                .chat()
                .create(request)
                .await
                .map_err(classify_openai_error)?;
            Ok(convert_response(response)?)
        })
    }
}

// =============================
// Scripted provider
// =============================

enum Scripted {
    Respond(ModelResponse),
    Fail { kind: ErrorKind, message: String },
}

type Responder = Arc<dyn Fn(&ModelRequest) -> Result<ModelResponse, BoxError> + Send + Sync>;

/// Replays queued responses in order, then falls back to a responder if one is set.
/// Clones share the script and the request log.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    fallback: Option<Responder>,
    latency: Option<Duration>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request with `f` once the script is exhausted.
    pub fn from_fn(
        f: impl Fn(&ModelRequest) -> Result<ModelResponse, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            fallback: Some(Arc::new(f)),
            ..Self::default()
        }
    }

    fn push(self, step: Scripted) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    pub fn respond(self, response: ModelResponse) -> Self {
        self.push(Scripted::Respond(response))
    }

    pub fn fail_transient(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail {
            kind: ErrorKind::Transient,
            message: message.into(),
        })
    }

    pub fn fail_permanent(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail {
            kind: ErrorKind::Permanent,
            message: message.into(),
        })
    }

    /// Return `response` forever once the script is exhausted.
    pub fn repeat(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(Arc::new(move |_| Ok(response.clone())));
        self
    }

    /// Sleep before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next(&self, req: &ModelRequest) -> Result<ModelResponse, BoxError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req.clone());
        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail { kind, message }) => Err(Box::new(match kind {
                ErrorKind::Permanent => AgentError::permanent(MODEL_DEPENDENCY, message),
                _ => AgentError::transient(MODEL_DEPENDENCY, message),
            })),
            None => match &self.fallback {
                Some(f) => f(req),
                None => Err(Box::new(AgentError::permanent(
                    MODEL_DEPENDENCY,
                    "script exhausted",
                ))),
            },
        }
    }
}

impl Service<ModelRequest> for ScriptedProvider {
    type Response = ModelResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ModelResponse, BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let latency = self.latency;
        let result = self.next(&req);
        Box::pin(async move {
            if let Some(d) = latency {
                tokio::time::sleep(d).await;
            }
            result
        })
    }
}
