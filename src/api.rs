//! HTTP surface: job submission, result polling and health probes.
//!
//! - `POST /chat {user_id, message, priority?}` → `202 {job_id, status}`
//! - `GET /chat/{job_id}` → `{job_id, status, response?, error?}` or 404
//! - `GET /health/live` → 200 while the process runs
//! - `GET /health/ready` → 200 when every [`HealthCheck`] passes, 503 otherwise

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::{add, SharedClock};
use crate::error::{AgentError, Result};
use crate::jobs::{Job, JobQueue, JobStatus, NewJob, Priority};
use crate::observability::{RuntimeEvent, SharedSink};
use crate::resilience::stack::MODEL_DEPENDENCY;
use crate::resilience::{BreakerRegistry, CircuitState};
use crate::sqlite::SqliteStore;

/// A dependency probed by `/health/ready`.
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<()>;
}

#[async_trait]
impl HealthCheck for SqliteStore {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Queue reachability via a depth query.
pub struct QueueCheck(pub Arc<dyn JobQueue>);

#[async_trait]
impl HealthCheck for QueueCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> Result<()> {
        self.0.depth().await.map(|_| ())
    }
}

/// Not ready while the model circuit is open and still cooling down.
pub struct ModelCircuitCheck {
    breakers: BreakerRegistry,
    recovery_timeout: Duration,
    clock: SharedClock,
}

impl ModelCircuitCheck {
    pub fn new(breakers: BreakerRegistry, recovery_timeout: Duration, clock: SharedClock) -> Self {
        Self {
            breakers,
            recovery_timeout,
            clock,
        }
    }
}

#[async_trait]
impl HealthCheck for ModelCircuitCheck {
    fn name(&self) -> &str {
        MODEL_DEPENDENCY
    }

    async fn check(&self) -> Result<()> {
        let state = self.breakers.get(MODEL_DEPENDENCY).state().await?;
        if state.state != CircuitState::Open {
            return Ok(());
        }
        let now = self.clock.now();
        match state.last_failure_at.map(|at| add(at, self.recovery_timeout)) {
            Some(until) if until > now => Err(AgentError::CircuitOpen {
                dependency: MODEL_DEPENDENCY.to_string(),
                retry_in: (until - now).to_std().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    queue: Arc<dyn JobQueue>,
    checks: Vec<Arc<dyn HealthCheck>>,
    sink: SharedSink,
}

impl ApiState {
    pub fn new(queue: Arc<dyn JobQueue>, sink: SharedSink) -> Self {
        Self {
            queue,
            checks: Vec::new(),
            sink,
        }
    }

    pub fn check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/chat", post(submit))
        .route("/chat/{job_id}", get(poll))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub priority: u8,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let (response, degraded_tools) = match job.result {
            Some(r) => (Some(r.response), r.degraded_tools),
            None => (None, Vec::new()),
        };
        let (error, error_code) = match job.error {
            Some(e) => (Some(e.message), Some(e.code)),
            None => (None, None),
        };
        Self {
            job_id: job.job_id,
            status: job.status,
            priority: job.priority.get(),
            attempts: job.attempts,
            submitted_at: job.submitted_at,
            completed_at: job.completed_at,
            response,
            degraded_tools,
            error,
            error_code,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing: Vec<String>,
}

/// Error rendered as `{code, message}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request",
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::InvalidRequest(msg) => Self::bad_request(msg.clone()),
            AgentError::JobNotFound(id) => Self::not_found(format!("job {id} not found")),
            AgentError::QueueFull { .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: err.code(),
                message: err.user_message().to_string(),
                retry_after: Some(5),
            },
            _ => {
                error!(error = %err, "request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: err.user_message().to_string(),
                    retry_after: None,
                }
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        });
        match self.retry_after {
            Some(secs) => (self.status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
            None => (self.status, body).into_response(),
        }
    }
}

async fn submit(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<Accepted>), ApiError> {
    let Json(req) = payload?;
    let priority = match req.priority {
        Some(p) => Priority::new(p)?,
        None => Priority::default(),
    };
    let job = state
        .queue
        .enqueue(NewJob::new(req.user_id, req.message).priority(priority))
        .await
        .inspect_err(|err| warn!(error = %err, "submission refused"))?;
    info!(job_id = %job.job_id, user_id = %job.user_id, priority = priority.get(), "job submitted");
    state.sink.record(RuntimeEvent::JobTransition {
        job_id: job.job_id.clone(),
        from: None,
        to: JobStatus::Queued,
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            job_id: job.job_id,
            status: job.status,
        }),
    ))
}

async fn poll(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> std::result::Result<Json<JobView>, ApiError> {
    match state.queue.get(&job_id).await? {
        Some(job) => Ok(Json(JobView::from(job))),
        None => Err(AgentError::JobNotFound(job_id).into()),
    }
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<ApiState>) -> (StatusCode, Json<Readiness>) {
    let mut failing = Vec::new();
    for check in &state.checks {
        if let Err(err) = check.check().await {
            warn!(check = check.name(), error = %err, "readiness check failed");
            failing.push(check.name().to_string());
        }
    }
    let ready = failing.is_empty();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(Readiness { ready, failing }))
}
