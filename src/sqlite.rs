//! SQLite-backed shared state.
//!
//! One [`SqliteStore`] implements every durable contract in the crate: the job queue,
//! conversation history, idempotency records, token buckets and breaker counters.
//! Several processes pointed at the same database file share all of it.
//!
//! Timestamps are stored as epoch milliseconds. Every read-modify-write either runs as
//! a single statement or inside `BEGIN IMMEDIATE`, which takes the database write lock
//! up front so two writers never interleave.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{BucketConfig, ConversationConfig, QueueConfig, RuntimeConfig};
use crate::error::{AgentError, Result};
use crate::jobs::{
    levels, new_job_id, Job, JobFailure, JobQueue, JobResult, JobStatus, Lease, NewJob, Priority,
    ReapReport,
};
use crate::resilience::breaker::{BreakerState, BreakerStore};
use crate::resilience::idempotency::IdempotencyStore;
use crate::resilience::rate_limit::{Acquire, BucketState, BucketStore};
use crate::state::{ConversationState, ConversationStore};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        message TEXT NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        submitted_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        lease_owner TEXT,
        lease_expires_at INTEGER,
        result TEXT,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(status, priority, seq)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        user_id TEXT PRIMARY KEY,
        messages TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rate_buckets (
        resource TEXT PRIMARY KEY,
        tokens REAL NOT NULL,
        last_refill_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS breakers (
        name TEXT PRIMARY KEY,
        state TEXT NOT NULL
    )
    "#,
];

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| AgentError::Storage(format!("timestamp out of range: {ms}")))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn opt_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let priority: i64 = row.try_get("priority")?;
    let priority = u8::try_from(priority)
        .map_err(|_| AgentError::Storage(format!("bad priority {priority}")))
        .and_then(Priority::new)?;
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let result: Option<String> = row.try_get("result")?;
    let error: Option<String> = row.try_get("error")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        user_id: row.try_get("user_id")?,
        message: row.try_get("message")?,
        priority,
        status: JobStatus::from_str(&status)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        submitted_at: from_ms(row.try_get("submitted_at")?)?,
        started_at: opt_ms(row.try_get("started_at")?)?,
        completed_at: opt_ms(row.try_get("completed_at")?)?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: opt_ms(row.try_get("lease_expires_at")?)?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: error.as_deref().map(serde_json::from_str).transpose()?,
    })
}

fn lease_from_job(job: &Job, ttl: Duration) -> Result<Lease> {
    match (&job.lease_owner, job.lease_expires_at) {
        (Some(owner), Some(expires_at)) => Ok(Lease {
            job_id: job.job_id.clone(),
            worker_id: owner.clone(),
            attempt: job.attempts,
            expires_at,
            ttl,
        }),
        _ => Err(AgentError::Storage(format!("job {} has no lease", job.job_id))),
    }
}

/// Shared store over a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: SharedClock,
    queue: QueueConfig,
    conversation: ConversationConfig,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and migrate it.
    pub async fn connect(url: &str, config: &RuntimeConfig, clock: SharedClock) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, config, clock).await
    }

    /// Private in-memory database, useful for tests.
    pub async fn new_in_memory(config: &RuntimeConfig, clock: SharedClock) -> Result<Self> {
        // every connection to :memory: is a separate database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, config, clock).await
    }

    pub async fn with_pool(pool: SqlitePool, config: &RuntimeConfig, clock: SharedClock) -> Result<Self> {
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            clock,
            queue: config.queue.clone(),
            conversation: config.conversation.clone(),
        })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip to the database.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Now, truncated to what the database can represent.
    fn now(&self) -> Result<DateTime<Utc>> {
        from_ms(to_ms(self.clock.now()))
    }

    /// Takes the write lock up front. Dropping the transaction rolls it back.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn lease_lost_or_missing(&self, lease: &Lease) -> AgentError {
        match JobQueue::get(self, &lease.job_id).await {
            Ok(Some(_)) => AgentError::LeaseLost {
                job_id: lease.job_id.clone(),
                worker_id: lease.worker_id.clone(),
            },
            Ok(None) => AgentError::JobNotFound(lease.job_id.clone()),
            Err(err) => err,
        }
    }

    async fn settle(&self, lease: &Lease, status: JobStatus, result: Option<String>, error: Option<String>) -> Result<Job> {
        let now = self.now()?;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1, result = ?2, error = ?3, completed_at = ?4,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE job_id = ?5 AND status = 'processing' AND lease_owner = ?6 AND attempts = ?7
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(to_ms(now))
        .bind(&lease.job_id)
        .bind(&lease.worker_id)
        .bind(i64::from(lease.attempt))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.lease_lost_or_missing(lease).await),
        }
    }
}

#[async_trait]
impl JobQueue for SqliteStore {
    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let now = self.now()?;
        let job_id = new_job_id();
        let max_depth = i64::try_from(self.queue.max_queue_depth).unwrap_or(i64::MAX);
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, user_id, message, priority, status, attempts, submitted_at)
            SELECT ?1, ?2, ?3, ?4, 'queued', 0, ?5
            WHERE (SELECT COUNT(*) FROM jobs WHERE status = 'queued') < ?6
            RETURNING *
            "#,
        )
        .bind(&job_id)
        .bind(&new.user_id)
        .bind(&new.message)
        .bind(i64::from(new.priority.get()))
        .bind(to_ms(now))
        .bind(max_depth)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(AgentError::QueueFull {
                depth: self.depth().await?,
            }),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn dequeue(&self, priorities: &[Priority], worker_id: &str) -> Result<Option<(Job, Lease)>> {
        let now = self.now()?;
        let expires_at = to_ms(crate::clock::add(now, self.queue.lease_ttl));
        for level in levels(priorities) {
            let row = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'processing', attempts = attempts + 1, started_at = ?1,
                    lease_owner = ?2, lease_expires_at = ?3
                WHERE seq = (
                    SELECT seq FROM jobs
                    WHERE status = 'queued' AND priority = ?4
                      AND (?5 = 0 OR user_id NOT IN
                           (SELECT user_id FROM jobs WHERE status = 'processing'))
                    ORDER BY seq
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(to_ms(now))
            .bind(worker_id)
            .bind(expires_at)
            .bind(i64::from(level.get()))
            .bind(self.queue.serialize_per_user)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let job = job_from_row(&row)?;
                let lease = lease_from_job(&job, self.queue.lease_ttl)?;
                debug!(job_id = %job.job_id, worker_id, priority = level.get(), "job leased");
                return Ok(Some((job, lease)));
            }
        }
        Ok(None)
    }

    async fn lease(&self, job_id: &str, worker_id: &str, ttl: Duration) -> Result<Lease> {
        let now = self.now()?;
        let expires_at = to_ms(crate::clock::add(now, ttl));
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', attempts = attempts + 1, started_at = ?1,
                lease_owner = ?2, lease_expires_at = ?3
            WHERE job_id = ?4 AND status = 'queued'
              AND (?5 = 0 OR user_id NOT IN
                   (SELECT user_id FROM jobs WHERE status = 'processing'))
            RETURNING *
            "#,
        )
        .bind(to_ms(now))
        .bind(worker_id)
        .bind(expires_at)
        .bind(job_id)
        .bind(self.queue.serialize_per_user)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => lease_from_job(&job_from_row(&row)?, ttl),
            None => match JobQueue::get(self, job_id).await? {
                None => Err(AgentError::JobNotFound(job_id.to_string())),
                Some(job) if job.status != JobStatus::Queued => Err(AgentError::InvalidRequest(
                    format!("job {job_id} is {}, not queued", job.status),
                )),
                Some(job) => Err(AgentError::InvalidRequest(format!(
                    "user {} already has a job in progress",
                    job.user_id
                ))),
            },
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let now = self.now()?;
        let expires_at = crate::clock::add(now, lease.ttl);
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?1
            WHERE job_id = ?2 AND status = 'processing' AND lease_owner = ?3 AND attempts = ?4
            "#,
        )
        .bind(to_ms(expires_at))
        .bind(&lease.job_id)
        .bind(&lease.worker_id)
        .bind(i64::from(lease.attempt))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(self.lease_lost_or_missing(lease).await);
        }
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn complete(&self, lease: &Lease, result: JobResult) -> Result<Job> {
        let result = serde_json::to_string(&result)?;
        self.settle(lease, JobStatus::Completed, Some(result), None).await
    }

    async fn fail(&self, lease: &Lease, failure: JobFailure) -> Result<Job> {
        let error = serde_json::to_string(&failure)?;
        self.settle(lease, JobStatus::Failed, None, Some(error)).await
    }

    async fn reap_expired(&self) -> Result<ReapReport> {
        let now = self.now()?;
        let max_attempts = i64::from(self.queue.max_attempts);
        let mut tx = self.begin_immediate().await?;
        let expired = sqlx::query(
            r#"
            SELECT job_id, attempts FROM jobs
            WHERE status = 'processing' AND lease_expires_at <= ?1
            ORDER BY seq
            "#,
        )
        .bind(to_ms(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut report = ReapReport::default();
        for row in expired {
            let job_id: String = row.try_get("job_id")?;
            let attempts: i64 = row.try_get("attempts")?;
            if attempts < max_attempts {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL
                    WHERE job_id = ?1
                    "#,
                )
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
                report.requeued.push(job_id);
            } else {
                let failure = JobFailure::from_error(&AgentError::LeaseExpired {
                    job_id: job_id.clone(),
                    attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                });
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed', error = ?1, completed_at = ?2,
                        lease_owner = NULL, lease_expires_at = NULL
                    WHERE job_id = ?3
                    "#,
                )
                .bind(serde_json::to_string(&failure)?)
                .bind(to_ms(now))
                .bind(&job_id)
                .execute(&mut *tx)
                .await?;
                report.failed.push(job_id);
            }
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let cutoff = to_ms(self.now()?) - duration_ms(self.queue.retention);
        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at <= ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted as usize)
    }

    async fn depth(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, user_id: &str) -> Result<ConversationState> {
        let now = self.now()?;
        let row = sqlx::query("SELECT messages, updated_at FROM conversations WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(ConversationState::empty(user_id, now));
        };
        let messages: String = row.try_get("messages")?;
        let state = ConversationState {
            user_id: user_id.to_string(),
            messages: serde_json::from_str(&messages)?,
            updated_at: from_ms(row.try_get("updated_at")?)?,
        };
        if state.is_expired(self.conversation.ttl, now) {
            self.clear(user_id).await?;
            return Ok(ConversationState::empty(user_id, now));
        }
        Ok(state)
    }

    async fn save(&self, mut state: ConversationState) -> Result<ConversationState> {
        state.trim(self.conversation.max_messages);
        state.updated_at = self.now()?;
        sqlx::query(
            r#"
            INSERT INTO conversations (user_id, messages, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET messages = excluded.messages, updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.user_id)
        .bind(serde_json::to_string(&state.messages)?)
        .bind(to_ms(state.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(state)
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM conversations WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let cutoff = to_ms(self.now()?) - duration_ms(self.conversation.ttl);
        let deleted = sqlx::query("DELETE FROM conversations WHERE updated_at <= ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted as usize)
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM idempotency WHERE key = ?1 AND expires_at > ?2")
            .bind(key)
            .bind(to_ms(now))
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(to_ms(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = sqlx::query("DELETE FROM idempotency WHERE expires_at <= ?1")
            .bind(to_ms(now))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted as usize)
    }
}

impl SqliteStore {
    async fn load_bucket(
        conn: &mut SqliteConnection,
        resource: &str,
        config: &BucketConfig,
        now: DateTime<Utc>,
    ) -> Result<BucketState> {
        let row = sqlx::query("SELECT tokens, last_refill_at FROM rate_buckets WHERE resource = ?1")
            .bind(resource)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(BucketState {
                tokens: row.try_get("tokens")?,
                last_refill_at: from_ms(row.try_get("last_refill_at")?)?,
            }),
            None => Ok(BucketState::full(config, now)),
        }
    }

    async fn store_bucket(conn: &mut SqliteConnection, resource: &str, state: &BucketState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_buckets (resource, tokens, last_refill_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(resource) DO UPDATE SET tokens = excluded.tokens, last_refill_at = excluded.last_refill_at
            "#,
        )
        .bind(resource)
        .bind(state.tokens)
        .bind(to_ms(state.last_refill_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BucketStore for SqliteStore {
    async fn try_acquire(
        &self,
        resource: &str,
        config: &BucketConfig,
        n: f64,
        now: DateTime<Utc>,
    ) -> Result<Acquire> {
        let now = from_ms(to_ms(now))?;
        let mut tx = self.begin_immediate().await?;
        let mut state = Self::load_bucket(&mut *tx, resource, config, now).await?;
        let acquire = state.try_consume(config, n, now);
        Self::store_bucket(&mut *tx, resource, &state).await?;
        tx.commit().await?;
        Ok(acquire)
    }

    async fn level(&self, resource: &str, config: &BucketConfig, now: DateTime<Utc>) -> Result<f64> {
        let now = from_ms(to_ms(now))?;
        let mut conn = self.pool.acquire().await?;
        let mut state = Self::load_bucket(&mut *conn, resource, config, now).await?;
        state.refill(config, now);
        Ok(state.tokens)
    }
}

#[async_trait]
impl BreakerStore for SqliteStore {
    async fn update(
        &self,
        name: &str,
        f: &mut (dyn for<'s> FnMut(&'s mut BreakerState) + Send),
    ) -> Result<BreakerState> {
        let mut tx = self.begin_immediate().await?;
        let raw: Option<String> = sqlx::query_scalar("SELECT state FROM breakers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let mut state: BreakerState = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BreakerState::default(),
        };
        f(&mut state);
        sqlx::query(
            r#"
            INSERT INTO breakers (name, state) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(name)
        .bind(serde_json::to_string(&state)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn load(&self, name: &str) -> Result<Option<BreakerState>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT state FROM breakers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::items::Message;
    use std::sync::Arc;

    async fn store(clock: &ManualClock) -> SqliteStore {
        SqliteStore::new_in_memory(&RuntimeConfig::default(), Arc::new(clock.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn jobs_round_trip_through_rows() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        let job = db
            .enqueue(NewJob::new("alice", "hello").priority(Priority::new(7).unwrap()))
            .await
            .unwrap();
        assert_eq!(JobQueue::get(&db, &job.job_id).await.unwrap(), Some(job.clone()));
        assert_eq!(db.depth().await.unwrap(), 1);

        let (leased, lease) = db.dequeue(&[], "w1").await.unwrap().unwrap();
        assert_eq!(leased.status, JobStatus::Processing);
        assert_eq!(leased.attempts, 1);
        assert_eq!(lease.worker_id, "w1");

        let done = db
            .complete(
                &lease,
                JobResult {
                    response: "hi".into(),
                    outcome: crate::agent::RunOutcome::Done,
                    iterations: 1,
                    usage: crate::items::Usage::new(3, 4),
                    degraded_tools: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().usage.total(), 7);
        assert!(matches!(
            db.complete(&lease, JobResult {
                response: String::new(),
                outcome: crate::agent::RunOutcome::Done,
                iterations: 0,
                usage: Default::default(),
                degraded_tools: vec![],
            })
            .await,
            Err(AgentError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn conversations_persist_as_json() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        db.append("bob", vec![Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        let state = ConversationStore::load(&db, "bob").await.unwrap();
        assert_eq!(state.messages, vec![Message::user("hi"), Message::assistant("hello")]);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(ConversationStore::purge_expired(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn breaker_updates_are_persisted() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        let state = db
            .update("llm-api", &mut |s: &mut BreakerState| s.consecutive_failures += 2)
            .await
            .unwrap();
        assert_eq!(state.consecutive_failures, 2);
        let loaded = BreakerStore::load(&db, "llm-api").await.unwrap().unwrap();
        assert_eq!(loaded.consecutive_failures, 2);
        assert!(BreakerStore::load(&db, "tool:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_breaker_update_does_not_keep_the_write_lock() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        let ran = std::sync::atomic::AtomicBool::new(false);
        {
            let mut bump = |s: &mut BreakerState| {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                s.consecutive_failures += 1;
            };
            let update = db.update("llm-api", &mut bump);
            tokio::pin!(update);
            // drive it until the closure has run, then drop it mid-transaction
            while !ran.load(std::sync::atomic::Ordering::SeqCst) {
                if futures::poll!(update.as_mut()).is_ready() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        let state = tokio::time::timeout(
            Duration::from_secs(10),
            db.update("llm-api", &mut |s: &mut BreakerState| s.consecutive_failures += 10),
        )
        .await
        .expect("store stays writable")
        .unwrap();
        assert!(matches!(state.consecutive_failures, 10 | 11));
        assert_eq!(
            BreakerStore::load(&db, "llm-api").await.unwrap().unwrap().consecutive_failures,
            state.consecutive_failures
        );
    }

    #[tokio::test]
    async fn buckets_refill_from_stored_level() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        let config = BucketConfig::new(1.0).with_capacity(2.0);
        let now = clock.now();
        assert_eq!(db.try_acquire("r", &config, 2.0, now).await.unwrap(), Acquire::Granted);
        assert!(matches!(
            db.try_acquire("r", &config, 1.0, now).await.unwrap(),
            Acquire::Denied { .. }
        ));
        clock.advance(Duration::from_secs(1));
        assert!((db.level("r", &config, clock.now()).await.unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn idempotency_entries_expire() {
        let clock = ManualClock::default();
        let db = store(&clock).await;
        let now = clock.now();
        let later = crate::clock::add(now, Duration::from_secs(10));
        db.put("k", "\"v\"", later).await.unwrap();
        assert_eq!(IdempotencyStore::get(&db, "k", now).await.unwrap().as_deref(), Some("\"v\""));
        assert!(IdempotencyStore::get(&db, "k", later).await.unwrap().is_none());
        assert_eq!(IdempotencyStore::purge_expired(&db, later).await.unwrap(), 1);
    }
}
