//! Stateless workers, the pool that runs them, and the lease reaper.
//!
//! A worker loops: dequeue → load conversation → run the agent loop → save the
//! conversation → complete or fail the job. Everything it needs lives in the shared
//! queue and conversation store, so any number of workers in any number of processes
//! can serve any user.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::agent::{Agent, RunRequest};
use crate::config::RuntimeConfig;
use crate::error::{AgentError, Result};
use crate::jobs::{Job, JobFailure, JobQueue, JobResult, JobStatus, Lease, Priority, ReapReport};
use crate::observability::{RuntimeEvent, SharedSink};
use crate::resilience::IdempotencyGuard;
use crate::state::ConversationStore;

/// Doubling sleep between empty polls.
#[derive(Debug, Clone)]
struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// One poll loop.
#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    conversations: Arc<dyn ConversationStore>,
    agent: Agent,
    priorities: Vec<Priority>,
    idle_min: Duration,
    idle_max: Duration,
    sink: SharedSink,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        config: &RuntimeConfig,
        queue: Arc<dyn JobQueue>,
        conversations: Arc<dyn ConversationStore>,
        agent: Agent,
        sink: SharedSink,
    ) -> Result<Self> {
        let priorities = config
            .worker
            .priorities
            .iter()
            .map(|p| Priority::new(*p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: id.into(),
            queue,
            conversations,
            agent,
            priorities,
            idle_min: config.worker.idle_backoff_min,
            idle_max: config.worker.idle_backoff_max,
            sink,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take and process at most one job. Returns the job in its final state.
    pub async fn poll_once(&self) -> Result<Option<Job>> {
        let Some((job, lease)) = self.queue.dequeue(&self.priorities, &self.id).await? else {
            return Ok(None);
        };
        self.sink.record(RuntimeEvent::JobTransition {
            job_id: job.job_id.clone(),
            from: Some(JobStatus::Queued),
            to: JobStatus::Processing,
        });
        let span = tracing::info_span!("job", job_id = %job.job_id, user_id = %job.user_id, worker = %self.id);
        self.process(job, lease).instrument(span).await.map(Some)
    }

    /// Poll until `shutdown` fires. An in-flight job always runs to completion.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = IdleBackoff::new(self.idle_min, self.idle_max);
        info!(worker = %self.id, "worker started");
        while !shutdown.is_cancelled() {
            let delay = match self.poll_once().await {
                Ok(Some(_)) => {
                    backoff.reset();
                    continue;
                }
                Ok(None) => backoff.next(),
                Err(err) => {
                    warn!(worker = %self.id, error = %err, "poll failed");
                    backoff.next()
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    async fn process(&self, job: Job, lease: Lease) -> Result<Job> {
        let mut state = self.conversations.load(&job.user_id).await?;
        let cancel = CancellationToken::new();
        let request = RunRequest::new(job.message.clone())
            .history(state.messages.clone())
            .scope(job.job_id.clone())
            .cancel(cancel.clone());

        let (outcome, lease) = self.run_with_heartbeat(request, lease, &cancel).await;

        let settled = match outcome {
            Ok(run) => {
                state.messages.extend(run.messages.iter().cloned());
                match self.conversations.save(state).await {
                    Ok(_) => self.queue.complete(&lease, JobResult::from(&run)).await,
                    Err(err) => self.queue.fail(&lease, JobFailure::from_error(&err)).await,
                }
            }
            Err(err) => {
                warn!(code = err.code(), error = %err, "job failed");
                self.queue.fail(&lease, JobFailure::from_error(&err)).await
            }
        };

        match settled {
            Ok(job) => {
                self.sink.record(RuntimeEvent::JobTransition {
                    job_id: job.job_id.clone(),
                    from: Some(JobStatus::Processing),
                    to: job.status,
                });
                Ok(job)
            }
            Err(err) => {
                warn!(error = %err, "could not record job outcome");
                Err(err)
            }
        }
    }

    /// Run the agent while renewing the lease every third of its TTL.
    async fn run_with_heartbeat(
        &self,
        request: RunRequest,
        mut lease: Lease,
        cancel: &CancellationToken,
    ) -> (Result<crate::agent::AgentRun>, Lease) {
        let run: std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<crate::agent::AgentRun>> + Send + '_>,
        > = Box::pin(self.agent.run(request));
        tokio::pin!(run);
        let period = (lease.ttl / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                outcome = &mut run => return (outcome, lease),
                _ = heartbeat.tick() => match self.queue.renew(&lease).await {
                    Ok(renewed) => {
                        debug!(expires_at = %renewed.expires_at, "lease renewed");
                        lease = renewed;
                    }
                    Err(err @ (AgentError::LeaseLost { .. } | AgentError::JobNotFound(_))) => {
                        warn!(error = %err, "lease lost, abandoning run");
                        cancel.cancel();
                    }
                    Err(err) => warn!(error = %err, "lease renewal failed"),
                },
            }
        }
    }
}

/// Periodically reclaims expired leases and purges expired records.
#[derive(Clone)]
pub struct Reaper {
    queue: Arc<dyn JobQueue>,
    conversations: Arc<dyn ConversationStore>,
    idempotency: Option<IdempotencyGuard>,
    interval: Duration,
    sink: SharedSink,
}

impl Reaper {
    pub fn new(
        config: &RuntimeConfig,
        queue: Arc<dyn JobQueue>,
        conversations: Arc<dyn ConversationStore>,
        sink: SharedSink,
    ) -> Self {
        Self {
            queue,
            conversations,
            idempotency: None,
            interval: config.queue.reaper_interval,
            sink,
        }
    }

    /// Also purge expired idempotency records.
    pub fn with_idempotency(mut self, guard: IdempotencyGuard) -> Self {
        self.idempotency = Some(guard);
        self
    }

    pub async fn run_once(&self) -> Result<ReapReport> {
        let report = self.queue.reap_expired().await?;
        if !report.is_empty() {
            for job_id in &report.requeued {
                self.sink.record(RuntimeEvent::JobTransition {
                    job_id: job_id.clone(),
                    from: Some(JobStatus::Processing),
                    to: JobStatus::Queued,
                });
            }
            for job_id in &report.failed {
                self.sink.record(RuntimeEvent::JobTransition {
                    job_id: job_id.clone(),
                    from: Some(JobStatus::Processing),
                    to: JobStatus::Failed,
                });
            }
            self.sink.record(RuntimeEvent::LeasesReaped {
                requeued: report.requeued.len(),
                failed: report.failed.len(),
            });
        }

        let jobs = self.queue.purge_expired().await?;
        let conversations = self.conversations.purge_expired().await?;
        let records = match &self.idempotency {
            Some(guard) => guard.purge_expired().await?,
            None => 0,
        };
        if jobs + conversations + records > 0 {
            debug!(jobs, conversations, records, "purged expired records");
        }
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!(error = %err, "reaper pass failed");
                    }
                }
            }
        }
        debug!("reaper stopped");
    }
}

/// A set of spawned workers, plus an optional reaper, sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: Vec<Worker>, reaper: Option<Reaper>) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = workers
            .into_iter()
            .map(|w| tokio::spawn(w.run(shutdown.child_token())))
            .collect();
        if let Some(reaper) = reaper {
            handles.push(tokio::spawn(reaper.run(shutdown.child_token())));
        }
        Self { shutdown, handles }
    }

    /// `config.worker.concurrency` identical workers over the same stores.
    pub fn start(
        config: &RuntimeConfig,
        queue: Arc<dyn JobQueue>,
        conversations: Arc<dyn ConversationStore>,
        agent: Agent,
        reaper: Option<Reaper>,
        sink: SharedSink,
    ) -> Result<Self> {
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let workers = (0..config.worker.concurrency)
            .map(|i| {
                Worker::new(
                    format!("worker-{}-{i}", &prefix[..8]),
                    config,
                    queue.clone(),
                    conversations.clone(),
                    agent.clone(),
                    sink.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        info!(workers = workers.len(), "starting worker pool");
        Ok(Self::spawn(workers, reaper))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop polling, let in-flight jobs finish, and join every task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task panicked");
            }
        }
    }
}
