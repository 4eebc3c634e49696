//! Job data model and the priority queue contract.
//!
//! A job moves `Queued → Processing → {Completed, Failed}`. The one way back is lease
//! expiry: the reaper returns an abandoned `Processing` job to `Queued` while it has
//! delivery attempts left, and fails it otherwise. Terminal jobs never change and are
//! purged after the retention window.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentRun, RunOutcome};
use crate::clock::{add, SharedClock};
use crate::config::QueueConfig;
use crate::error::{AgentError, Result};
use crate::items::Usage;

/// Urgency of a job, `0..=9`, higher first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX.0 {
            return Err(AgentError::InvalidRequest(format!(
                "priority must be between {} and {}",
                Self::MIN.0,
                Self::MAX.0
            )));
        }
        Ok(Priority(value))
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Every level, most urgent first.
    pub fn all_descending() -> Vec<Priority> {
        (Self::MIN.0..=Self::MAX.0).rev().map(Priority).collect()
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(1)
    }
}

impl TryFrom<u8> for Priority {
    type Error = AgentError;
    fn try_from(value: u8) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AgentError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AgentError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

/// What a completed job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub response: String,
    pub outcome: RunOutcome,
    pub iterations: usize,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_tools: Vec<String>,
}

impl From<&AgentRun> for JobResult {
    fn from(run: &AgentRun) -> Self {
        Self {
            response: run.response.clone(),
            outcome: run.outcome,
            iterations: run.iterations,
            usage: run.usage,
            degraded_tools: run.degraded_tools.clone(),
        }
    }
}

/// Why a job failed. `message` is safe to show users; `detail` stays internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub detail: String,
}

impl JobFailure {
    pub fn from_error(err: &AgentError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.user_message().to_string(),
            detail: err.to_string(),
        }
    }
}

/// A worker's time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: String,
    pub worker_id: String,
    /// Delivery number this lease belongs to
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
    /// Extension granted by each renewal
    #[serde(with = "crate::config::secs")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub message: String,
    pub priority: Priority,
    pub status: JobStatus,
    /// Deliveries so far
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<JobFailure>,
}

impl Job {
    fn holds(&self, lease: &Lease) -> bool {
        self.status == JobStatus::Processing
            && self.lease_owner.as_deref() == Some(lease.worker_id.as_str())
            && self.attempts == lease.attempt
    }
}

/// Submission accepted by [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
}

impl NewJob {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            priority: Priority::default(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(AgentError::InvalidRequest("user_id must not be empty".into()));
        }
        if self.message.trim().is_empty() {
            return Err(AgentError::InvalidRequest("message must not be empty".into()));
        }
        Ok(())
    }
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

pub(crate) fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn levels(priorities: &[Priority]) -> Vec<Priority> {
    if priorities.is_empty() {
        Priority::all_descending()
    } else {
        priorities.to_vec()
    }
}

/// Durable, priority-ordered queue with leases.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Store a new `Queued` job. Fails with `QueueFull` above the configured depth.
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Atomically lease the oldest job of the first non-empty level in `priorities`
    /// (every level, highest first, when empty).
    async fn dequeue(&self, priorities: &[Priority], worker_id: &str) -> Result<Option<(Job, Lease)>>;

    /// Lease a specific queued job for `ttl`.
    async fn lease(&self, job_id: &str, worker_id: &str, ttl: Duration) -> Result<Lease>;

    /// Push the lease expiry out by the lease's TTL.
    async fn renew(&self, lease: &Lease) -> Result<Lease>;

    async fn complete(&self, lease: &Lease, result: JobResult) -> Result<Job>;

    async fn fail(&self, lease: &Lease, failure: JobFailure) -> Result<Job>;

    /// Requeue or fail every job whose lease has expired.
    async fn reap_expired(&self) -> Result<ReapReport>;

    /// Delete terminal jobs older than the retention window.
    async fn purge_expired(&self) -> Result<usize>;

    /// Number of queued jobs.
    async fn depth(&self) -> Result<usize>;
}

struct Slot {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    jobs: HashMap<String, Slot>,
}

/// Mutex-protected queue for single-process deployments and tests.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    clock: SharedClock,
    config: QueueConfig,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            config,
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| AgentError::Storage("job queue lock poisoned".into()))
    }

    fn grant(&self, job: &mut Job, worker_id: &str, ttl: Duration, now: DateTime<Utc>) -> Lease {
        let expires_at = add(now, ttl);
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(expires_at);
        Lease {
            job_id: job.job_id.clone(),
            worker_id: worker_id.to_string(),
            attempt: job.attempts,
            expires_at,
            ttl,
        }
    }

    fn settle(&self, lease: &Lease, apply: impl FnOnce(&mut Job, DateTime<Utc>)) -> Result<Job> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let slot = state
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| AgentError::JobNotFound(lease.job_id.clone()))?;
        if !slot.job.holds(lease) {
            return Err(AgentError::LeaseLost {
                job_id: lease.job_id.clone(),
                worker_id: lease.worker_id.clone(),
            });
        }
        apply(&mut slot.job, now);
        slot.job.completed_at = Some(now);
        slot.job.lease_owner = None;
        slot.job.lease_expires_at = None;
        Ok(slot.job.clone())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let now = self.clock.now();
        let mut state = self.state()?;
        let depth = state
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Queued)
            .count();
        if depth >= self.config.max_queue_depth {
            return Err(AgentError::QueueFull { depth });
        }
        let job = Job {
            job_id: new_job_id(),
            user_id: new.user_id,
            message: new.message,
            priority: new.priority,
            status: JobStatus::Queued,
            attempts: 0,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            error: None,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.job_id.clone(),
            Slot {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state()?.jobs.get(job_id).map(|s| s.job.clone()))
    }

    async fn dequeue(&self, priorities: &[Priority], worker_id: &str) -> Result<Option<(Job, Lease)>> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let busy: HashSet<String> = if self.config.serialize_per_user {
            state
                .jobs
                .values()
                .filter(|s| s.job.status == JobStatus::Processing)
                .map(|s| s.job.user_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut chosen = None;
        for level in levels(priorities) {
            chosen = state
                .jobs
                .values()
                .filter(|s| {
                    s.job.status == JobStatus::Queued
                        && s.job.priority == level
                        && !busy.contains(&s.job.user_id)
                })
                .min_by_key(|s| s.seq)
                .map(|s| s.job.job_id.clone());
            if chosen.is_some() {
                break;
            }
        }

        let Some(job_id) = chosen else {
            return Ok(None);
        };
        let Some(slot) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let lease = self.grant(&mut slot.job, worker_id, self.config.lease_ttl, now);
        Ok(Some((slot.job.clone(), lease)))
    }

    async fn lease(&self, job_id: &str, worker_id: &str, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let mut state = self.state()?;
        if self.config.serialize_per_user {
            let user = state
                .jobs
                .get(job_id)
                .map(|s| s.job.user_id.clone())
                .ok_or_else(|| AgentError::JobNotFound(job_id.to_string()))?;
            if state
                .jobs
                .values()
                .any(|s| s.job.status == JobStatus::Processing && s.job.user_id == user)
            {
                return Err(AgentError::InvalidRequest(format!(
                    "user {user} already has a job in progress"
                )));
            }
        }
        let slot = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AgentError::JobNotFound(job_id.to_string()))?;
        if slot.job.status != JobStatus::Queued {
            return Err(AgentError::InvalidRequest(format!(
                "job {job_id} is {}, not queued",
                slot.job.status
            )));
        }
        Ok(self.grant(&mut slot.job, worker_id, ttl, now))
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let slot = state
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| AgentError::JobNotFound(lease.job_id.clone()))?;
        if !slot.job.holds(lease) {
            return Err(AgentError::LeaseLost {
                job_id: lease.job_id.clone(),
                worker_id: lease.worker_id.clone(),
            });
        }
        let expires_at = add(now, lease.ttl);
        slot.job.lease_expires_at = Some(expires_at);
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn complete(&self, lease: &Lease, result: JobResult) -> Result<Job> {
        self.settle(lease, |job, _| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
        })
    }

    async fn fail(&self, lease: &Lease, failure: JobFailure) -> Result<Job> {
        self.settle(lease, |job, _| {
            job.status = JobStatus::Failed;
            job.error = Some(failure);
        })
    }

    async fn reap_expired(&self) -> Result<ReapReport> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let mut report = ReapReport::default();
        for slot in state.jobs.values_mut() {
            let job = &mut slot.job;
            let expired = job.status == JobStatus::Processing
                && job.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }
            job.lease_owner = None;
            job.lease_expires_at = None;
            if job.attempts < self.config.max_attempts {
                job.status = JobStatus::Queued;
                report.requeued.push(job.job_id.clone());
            } else {
                let err = AgentError::LeaseExpired {
                    job_id: job.job_id.clone(),
                    attempts: job.attempts,
                };
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error = Some(JobFailure::from_error(&err));
                report.failed.push(job.job_id.clone());
            }
        }
        Ok(report)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let retention = self.config.retention;
        let mut state = self.state()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, s| {
            !(s.job.status.is_terminal()
                && s.job.completed_at.is_some_and(|at| add(at, retention) <= now))
        });
        Ok(before - state.jobs.len())
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self
            .state()?
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Queued)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn queue(clock: &ManualClock) -> InMemoryJobQueue {
        InMemoryJobQueue::new(QueueConfig::default(), Arc::new(clock.clone()))
    }

    fn p(v: u8) -> Priority {
        Priority::new(v).unwrap()
    }

    #[test]
    fn priority_bounds() {
        assert!(Priority::new(10).is_err());
        assert_eq!(Priority::default().get(), 1);
        let parsed: Priority = serde_json::from_str("5").unwrap();
        assert_eq!(parsed, p(5));
        assert!(serde_json::from_str::<Priority>("12").is_err());
        assert_eq!(Priority::all_descending().first(), Some(&Priority::MAX));
    }

    #[tokio::test]
    async fn strict_priority_then_fifo() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let mut ids = Vec::new();
        for (i, prio) in [1u8, 5, 1, 5].into_iter().enumerate() {
            let job = q
                .enqueue(NewJob::new(format!("user-{i}"), format!("m{i}")).priority(p(prio)))
                .await
                .unwrap();
            ids.push(job.job_id);
        }
        let mut order = Vec::new();
        while let Some((job, _)) = q.dequeue(&[], "w1").await.unwrap() {
            order.push(job.job_id);
        }
        assert_eq!(order, vec![ids[1].clone(), ids[3].clone(), ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn explicit_priority_list_restricts_levels() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        q.enqueue(NewJob::new("a", "hi").priority(p(5))).await.unwrap();
        let low = q.enqueue(NewJob::new("b", "hi").priority(p(1))).await.unwrap();
        let (job, _) = q.dequeue(&[p(1)], "w1").await.unwrap().unwrap();
        assert_eq!(job.job_id, low.job_id);
        assert!(q.dequeue(&[p(1)], "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_job_per_user_at_a_time() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let first = q.enqueue(NewJob::new("alice", "one")).await.unwrap();
        let second = q.enqueue(NewJob::new("alice", "two")).await.unwrap();
        let other = q.enqueue(NewJob::new("bob", "three")).await.unwrap();

        let (a, lease) = q.dequeue(&[], "w1").await.unwrap().unwrap();
        assert_eq!(a.job_id, first.job_id);
        let (b, _) = q.dequeue(&[], "w2").await.unwrap().unwrap();
        assert_eq!(b.job_id, other.job_id);
        assert!(q.dequeue(&[], "w3").await.unwrap().is_none());

        q.complete(&lease, JobResult {
            response: "ok".into(),
            outcome: RunOutcome::Done,
            iterations: 1,
            usage: Usage::default(),
            degraded_tools: vec![],
        })
        .await
        .unwrap();
        let (c, _) = q.dequeue(&[], "w3").await.unwrap().unwrap();
        assert_eq!(c.job_id, second.job_id);
    }

    #[tokio::test]
    async fn expired_lease_is_requeued_once_then_failed() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let job = q.enqueue(NewJob::new("u", "poison")).await.unwrap();

        let (_, first) = q.dequeue(&[], "w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(151));
        let report = q.reap_expired().await.unwrap();
        assert_eq!(report.requeued, vec![job.job_id.clone()]);
        assert_eq!(q.get(&job.job_id).await.unwrap().unwrap().status, JobStatus::Queued);

        // the first worker comes back too late
        let late = q.fail(&first, JobFailure::from_error(&AgentError::Cancelled)).await;
        assert!(matches!(late, Err(AgentError::LeaseLost { .. })));

        let (again, _) = q.dequeue(&[], "w2").await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        clock.advance(Duration::from_secs(151));
        let report = q.reap_expired().await.unwrap();
        assert_eq!(report.failed, vec![job.job_id.clone()]);
        let stored = q.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.unwrap().code, "lease_expired");
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        q.enqueue(NewJob::new("u", "slow")).await.unwrap();
        let (_, lease) = q.dequeue(&[], "w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(100));
        let renewed = q.renew(&lease).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);
        clock.advance(Duration::from_secs(100));
        assert!(q.reap_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_lease_ttl_governs_expiry_and_renewal() {
        let clock = ManualClock::default();
        let q = queue(&clock);
        let job = q.enqueue(NewJob::new("u", "short")).await.unwrap();
        let lease = q.lease(&job.job_id, "w1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(lease.ttl, Duration::from_secs(10));
        assert_eq!(lease.expires_at, add(clock.now(), Duration::from_secs(10)));

        clock.advance(Duration::from_secs(8));
        let renewed = q.renew(&lease).await.unwrap();
        assert_eq!(renewed.expires_at, add(clock.now(), Duration::from_secs(10)));

        clock.advance(Duration::from_secs(11));
        let report = q.reap_expired().await.unwrap();
        assert_eq!(report.requeued, vec![job.job_id.clone()]);
    }

    #[tokio::test]
    async fn backpressure_and_retention() {
        let clock = ManualClock::default();
        let config = QueueConfig {
            max_queue_depth: 1,
            ..QueueConfig::default()
        };
        let q = InMemoryJobQueue::new(config, Arc::new(clock.clone()));
        let job = q.enqueue(NewJob::new("u", "first")).await.unwrap();
        assert!(matches!(
            q.enqueue(NewJob::new("v", "second")).await,
            Err(AgentError::QueueFull { depth: 1 })
        ));
        assert!(q.enqueue(NewJob::new("", "x")).await.is_err());

        let lease = q.lease(&job.job_id, "w1", Duration::from_secs(150)).await.unwrap();
        let failed = q
            .fail(&lease, JobFailure::from_error(&AgentError::permanent("llm-api", "401")))
            .await
            .unwrap();
        assert_eq!(failed.error.as_ref().unwrap().message, "The request could not be completed.");
        assert!(failed.error.unwrap().detail.contains("401"));

        clock.advance(Duration::from_secs(3599));
        assert_eq!(q.purge_expired().await.unwrap(), 0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(q.purge_expired().await.unwrap(), 1);
        assert!(q.get(&job.job_id).await.unwrap().is_none());
    }
}
