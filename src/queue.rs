//! Durable job queue feeding the ingestion worker.
//!
//! One job carries one document. Delivery is at-least-once: a claimed job
//! stays `running` until it is completed or failed, and [`JobQueue::fail`]
//! re-queues it with linear backoff until `max_attempts` is reached.
//!
//! A claim holds a lease that the worker renews with
//! [`JobQueue::extend_lease`] while it works. Only jobs whose lease has run
//! out (their worker died) go back to the queue, so several worker processes
//! can share one database. The attempt number fences each delivery: once a
//! job has been reclaimed, acks and renewals from the earlier holder are
//! ignored.
//!
//! Two implementations share the [`JobQueue`] trait:
//! - [`SqliteQueue`]: the `jobs` table, claimed atomically with
//!   `UPDATE ... RETURNING`.
//! - [`InMemoryQueue`]: a mutex-guarded list for tests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{error, warn};

use crate::config::QueueConfig;

/// Name of the queue carrying document ingestion jobs.
pub const DOCUMENT_QUEUE: &str = "document-processing";

/// Payload of one ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub document_id: String,
    pub file_path: PathBuf,
}

/// A job handed to a worker by [`JobQueue::claim`].
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    pub job: IngestJob,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "dead" => Ok(JobState::Dead),
            other => Err(anyhow!("unknown job state: {}", other)),
        }
    }
}

/// What happened to a job after [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Dead,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; returns its queue id.
    async fn enqueue(&self, job: &IngestJob) -> Result<i64>;

    /// Take the oldest job whose run time has arrived, if any.
    async fn claim(&self) -> Result<Option<QueuedJob>>;

    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    /// Record a failed attempt, re-queueing with backoff or marking it dead.
    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome>;

    /// Jobs still queued (including delayed retries) or running.
    async fn outstanding(&self) -> Result<usize>;

    /// Push the lease of a job this worker still holds. Returns `false` when
    /// the job has since been reclaimed by someone else.
    async fn extend_lease(&self, job: &QueuedJob) -> Result<bool>;

    /// Return `running` jobs whose lease has expired to the queue.
    async fn recover_expired(&self) -> Result<usize>;
}

/// Retry delay after the given failed attempt.
fn backoff(backoff_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(backoff_secs.saturating_mul(attempt as u64))
}

// ============ SQLite ============

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub struct SqliteQueue {
    pool: SqlitePool,
    name: String,
    max_attempts: u32,
    backoff_secs: u64,
    lease: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Self {
        Self {
            pool,
            name: config.name.clone(),
            max_attempts: config.max_attempts,
            backoff_secs: config.backoff_secs,
            lease: Duration::from_secs(config.lease_secs),
        }
    }

    /// Override the claim lease, e.g. sub-second leases in tests.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn state(&self, id: i64) -> Result<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        state.as_deref().map(JobState::parse).transpose()
    }

    async fn mark_dead(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = ?, last_error = ?, lease_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(JobState::Dead.as_str())
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: &IngestJob) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::to_string(job)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (queue, payload, state, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&self.name)
        .bind(payload)
        .bind(JobState::Queued.as_str())
        .bind(self.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self) -> Result<Option<QueuedJob>> {
        loop {
            let now = Utc::now().timestamp_millis();
            let row = sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'running', attempts = attempts + 1, lease_until = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM jobs
                    WHERE queue = ? AND state = 'queued' AND run_at <= ?
                    ORDER BY run_at ASC, id ASC
                    LIMIT 1
                )
                RETURNING id, payload, attempts, max_attempts
                "#,
            )
            .bind(now + millis(self.lease))
            .bind(now)
            .bind(&self.name)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id: i64 = row.get("id");
            let payload: String = row.get("payload");
            match serde_json::from_str::<IngestJob>(&payload) {
                Ok(job) => {
                    let attempts: i64 = row.get("attempts");
                    let max_attempts: i64 = row.get("max_attempts");
                    return Ok(Some(QueuedJob {
                        id,
                        job,
                        attempt: attempts as u32,
                        max_attempts: max_attempts as u32,
                    }));
                }
                Err(e) => {
                    error!(job_id = id, error = %e, "discarding job with malformed payload");
                    self.mark_dead(id, &format!("malformed payload: {}", e))
                        .await?;
                }
            }
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = ?, lease_until = NULL, updated_at = ?
            WHERE id = ? AND state = 'running' AND attempts = ?
            "#,
        )
        .bind(JobState::Done.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(job.id)
        .bind(job.attempt as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(job_id = job.id, attempt = job.attempt, "ack ignored, job was reclaimed");
        }
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome> {
        let now = Utc::now().timestamp_millis();
        let dead = job.attempt >= job.max_attempts;
        let delay = backoff(self.backoff_secs, job.attempt);
        let (state, run_at) = if dead {
            (JobState::Dead, now)
        } else {
            (JobState::Queued, now + millis(delay))
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, last_error = ?, run_at = ?, lease_until = NULL, updated_at = ?
            WHERE id = ? AND state = 'running' AND attempts = ?
            "#,
        )
        .bind(state.as_str())
        .bind(error)
        .bind(run_at)
        .bind(now)
        .bind(job.id)
        .bind(job.attempt as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(job_id = job.id, attempt = job.attempt, "failure report ignored, job was reclaimed");
        }

        Ok(if dead {
            FailOutcome::Dead
        } else {
            FailOutcome::Retrying { delay }
        })
    }

    async fn outstanding(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND state IN ('queued', 'running')",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn extend_lease(&self, job: &QueuedJob) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_until = ?, updated_at = ?
            WHERE id = ? AND state = 'running' AND attempts = ?
            "#,
        )
        .bind(now + millis(self.lease))
        .bind(now)
        .bind(job.id)
        .bind(job.attempt as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recover_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'queued', lease_until = NULL, updated_at = ?
            WHERE queue = ? AND state = 'running'
              AND (lease_until IS NULL OR lease_until < ?)
            "#,
        )
        .bind(now)
        .bind(&self.name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected() as usize;
        if recovered > 0 {
            warn!(recovered, "re-queued jobs whose worker stopped renewing its lease");
        }
        Ok(recovered)
    }
}

// ============ In-memory ============

#[derive(Debug, Clone)]
struct MemoryJob {
    id: i64,
    job: IngestJob,
    state: JobState,
    attempts: u32,
    run_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl MemoryJob {
    /// Whether `job` is still the live delivery of this entry.
    fn held_by(&self, job: &QueuedJob) -> bool {
        self.state == JobState::Running && self.attempts == job.attempt
    }
}

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct InMemoryQueue {
    jobs: Mutex<Vec<MemoryJob>>,
    max_attempts: u32,
    backoff_secs: u64,
    lease: Duration,
}

impl InMemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            max_attempts: config.max_attempts,
            backoff_secs: config.backoff_secs,
            lease: Duration::from_secs(config.lease_secs),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn state(&self, id: i64) -> Option<JobState> {
        let jobs = self.jobs.lock().ok()?;
        jobs.iter().find(|j| j.id == id).map(|j| j.state)
    }

    pub fn last_error(&self, id: i64) -> Option<String> {
        let jobs = self.jobs.lock().ok()?;
        jobs.iter().find(|j| j.id == id).and_then(|j| j.last_error.clone())
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut Vec<MemoryJob>) -> T) -> Result<T> {
        let mut jobs = self.jobs.lock().map_err(|_| anyhow!("job list poisoned"))?;
        Ok(f(&mut jobs))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: &IngestJob) -> Result<i64> {
        self.with_jobs(|jobs| {
            let id = jobs.len() as i64 + 1;
            jobs.push(MemoryJob {
                id,
                job: job.clone(),
                state: JobState::Queued,
                attempts: 0,
                run_at: Utc::now(),
                lease_until: None,
                last_error: None,
            });
            id
        })
    }

    async fn claim(&self) -> Result<Option<QueuedJob>> {
        let max_attempts = self.max_attempts;
        let lease = self.lease;
        self.with_jobs(|jobs| {
            let now = Utc::now();
            let next = jobs
                .iter_mut()
                .filter(|j| j.state == JobState::Queued && j.run_at <= now)
                .min_by_key(|j| (j.run_at, j.id))?;
            next.state = JobState::Running;
            next.attempts += 1;
            next.lease_until = Some(after(now, lease));
            Some(QueuedJob {
                id: next.id,
                job: next.job.clone(),
                attempt: next.attempts,
                max_attempts,
            })
        })
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        self.with_jobs(|jobs| {
            match jobs.iter_mut().find(|j| j.id == job.id && j.held_by(job)) {
                Some(j) => {
                    j.state = JobState::Done;
                    j.lease_until = None;
                }
                None => warn!(job_id = job.id, attempt = job.attempt, "ack ignored, job was reclaimed"),
            }
        })
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<FailOutcome> {
        let delay = backoff(self.backoff_secs, job.attempt);
        let dead = job.attempt >= job.max_attempts;
        self.with_jobs(|jobs| {
            match jobs.iter_mut().find(|j| j.id == job.id && j.held_by(job)) {
                Some(j) => {
                    j.last_error = Some(error.to_string());
                    j.lease_until = None;
                    if dead {
                        j.state = JobState::Dead;
                    } else {
                        j.state = JobState::Queued;
                        j.run_at = after(Utc::now(), delay);
                    }
                }
                None => warn!(job_id = job.id, attempt = job.attempt, "failure report ignored, job was reclaimed"),
            }
        })?;

        Ok(if dead {
            FailOutcome::Dead
        } else {
            FailOutcome::Retrying { delay }
        })
    }

    async fn outstanding(&self) -> Result<usize> {
        self.with_jobs(|jobs| {
            jobs.iter()
                .filter(|j| matches!(j.state, JobState::Queued | JobState::Running))
                .count()
        })
    }

    async fn extend_lease(&self, job: &QueuedJob) -> Result<bool> {
        let lease = self.lease;
        self.with_jobs(|jobs| {
            match jobs.iter_mut().find(|j| j.id == job.id && j.held_by(job)) {
                Some(j) => {
                    j.lease_until = Some(after(Utc::now(), lease));
                    true
                }
                None => false,
            }
        })
    }

    async fn recover_expired(&self) -> Result<usize> {
        self.with_jobs(|jobs| {
            let now = Utc::now();
            let mut recovered = 0;
            for j in jobs.iter_mut().filter(|j| {
                j.state == JobState::Running && j.lease_until.map_or(true, |until| until < now)
            }) {
                j.state = JobState::Queued;
                j.lease_until = None;
                recovered += 1;
            }
            recovered
        })
    }
}
