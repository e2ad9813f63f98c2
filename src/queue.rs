//! Persisted job queue.
//!
//! One row per (stage, key) in the `jobs` table. Every transition is a
//! single conditional SQL write, so several orchestrator processes may share
//! the database file:
//!
//! - `enqueue` revives only finished rows; an unfinished row is left alone,
//!   so at most one instance per key is ever in flight. A request that
//!   arrives while the row is running sets `rerun`, and completion then puts
//!   the row back to `pending` instead of `succeeded`.
//! - `claim` moves the oldest due row to `running` with
//!   `UPDATE … WHERE id = (SELECT …) AND <predicate> RETURNING *`. A row
//!   whose lease expired after `max_attempts` claims is failed terminally
//!   instead of being handed out again.
//! - `complete` and `fail` apply only while the caller still
//!   holds the lease.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use energy_cost_core::models::{JobState, Stage};
use energy_cost_core::PipelineError;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::PipelineConfig;
use crate::db::{from_millis, now_ms};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub stage: Stage,
    pub key: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub warning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `min(max, base × 2^(attempts − 1))` in milliseconds.
pub fn backoff_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = attempts.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exp).min(max_ms)
}

/// Queue `stage` for `key`. Returns true when new work was created (a fresh
/// row, or a finished row revived to `pending`).
pub async fn enqueue(
    pool: &SqlitePool,
    stage: Stage,
    key: &str,
    payload: &serde_json::Value,
) -> Result<bool> {
    let now = now_ms();
    let affected = sqlx::query(
        r#"
        INSERT INTO jobs (stage, key, payload, state, attempts, rerun, next_run_at_ms, created_at_ms, updated_at_ms)
        VALUES (?, ?, ?, 'pending', 0, 0, ?, ?, ?)
        ON CONFLICT(stage, key) DO UPDATE SET
            payload = excluded.payload,
            state = 'pending',
            attempts = 0,
            rerun = 0,
            next_run_at_ms = excluded.next_run_at_ms,
            lease_owner = NULL,
            lease_until_ms = NULL,
            last_error = NULL,
            warning = NULL,
            updated_at_ms = excluded.updated_at_ms
        WHERE jobs.state IN ('succeeded', 'failed_terminal', 'cancelled')
        "#,
    )
    .bind(stage.as_str())
    .bind(key)
    .bind(payload.to_string())
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    if affected == 0 {
        sqlx::query(
            "UPDATE jobs SET rerun = 1, updated_at_ms = ? WHERE stage = ? AND key = ? AND state = 'running'",
        )
        .bind(now)
        .bind(stage.as_str())
        .bind(key)
        .execute(pool)
        .await?;
    }

    Ok(affected == 1)
}

/// Lease the oldest due job to `worker_id` for `lease_ms`.
pub async fn claim(
    pool: &SqlitePool,
    worker_id: &str,
    lease_ms: i64,
    max_attempts: u32,
) -> Result<Option<Job>> {
    let now = now_ms();
    let reaped = reap_exhausted(pool, now, max_attempts).await?;
    if reaped > 0 {
        tracing::warn!(reaped, max_attempts, "expired leases failed terminally");
    }

    let row = sqlx::query(
        r#"
        UPDATE jobs SET
            state = 'running',
            attempts = attempts + 1,
            lease_owner = ?1,
            lease_until_ms = ?2,
            updated_at_ms = ?3
        WHERE id = (
            SELECT id FROM jobs
            WHERE (state IN ('pending', 'failed_retryable') AND next_run_at_ms <= ?3)
               OR (state = 'running' AND lease_until_ms < ?3 AND attempts < ?4)
            ORDER BY next_run_at_ms, id
            LIMIT 1
        )
        AND (
            (state IN ('pending', 'failed_retryable') AND next_run_at_ms <= ?3)
            OR (state = 'running' AND lease_until_ms < ?3 AND attempts < ?4)
        )
        RETURNING *
        "#,
    )
    .bind(worker_id)
    .bind(now + lease_ms)
    .bind(now)
    .bind(max_attempts as i64)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Fail every running row whose lease expired with no attempts left.
async fn reap_exhausted(pool: &SqlitePool, now: i64, max_attempts: u32) -> Result<u64> {
    let reaped = sqlx::query(
        r#"
        UPDATE jobs SET
            state = 'failed_terminal',
            last_error = 'terminal: lease expired after ' || attempts || ' attempts',
            rerun = 0,
            lease_owner = NULL,
            lease_until_ms = NULL,
            next_run_at_ms = ?1,
            updated_at_ms = ?1
        WHERE state = 'running' AND lease_until_ms < ?1 AND attempts >= ?2
        "#,
    )
    .bind(now)
    .bind(max_attempts as i64)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(reaped)
}

/// Mark a leased job done. Returns the resulting state, or `None` when the
/// lease was lost.
pub async fn complete(
    pool: &SqlitePool,
    job_id: i64,
    worker_id: &str,
    warning: Option<&str>,
) -> Result<Option<JobState>> {
    let now = now_ms();
    let state: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE jobs SET
            state = CASE WHEN rerun = 1 THEN 'pending' ELSE 'succeeded' END,
            attempts = CASE WHEN rerun = 1 THEN 0 ELSE attempts END,
            rerun = 0,
            next_run_at_ms = ?1,
            warning = ?2,
            last_error = NULL,
            lease_owner = NULL,
            lease_until_ms = NULL,
            updated_at_ms = ?1
        WHERE id = ?3 AND state = 'running' AND lease_owner = ?4
        RETURNING state
        "#,
    )
    .bind(now)
    .bind(warning)
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    state
        .map(|s| s.parse::<JobState>().map_err(anyhow::Error::from))
        .transpose()
}

/// Record a failure for a leased job. Retryable errors back off until
/// `max_attempts`; everything else is terminal. Returns `None` when the
/// lease was lost.
pub async fn fail(
    pool: &SqlitePool,
    job: &Job,
    worker_id: &str,
    error: &PipelineError,
    config: &PipelineConfig,
) -> Result<Option<JobState>> {
    let now = now_ms();
    let (state, next_run) = if error.is_retryable() && job.attempts < config.max_attempts {
        let delay = backoff_ms(job.attempts, config.backoff_base_ms, config.backoff_max_ms);
        (JobState::FailedRetryable, now + delay as i64)
    } else {
        (JobState::FailedTerminal, now)
    };

    let updated = sqlx::query(
        r#"
        UPDATE jobs SET
            state = ?1,
            next_run_at_ms = ?2,
            last_error = ?3,
            rerun = 0,
            lease_owner = NULL,
            lease_until_ms = NULL,
            updated_at_ms = ?4
        WHERE id = ?5 AND state = 'running' AND lease_owner = ?6
        "#,
    )
    .bind(state.as_str())
    .bind(next_run)
    .bind(format!("{}: {}", error.kind(), error))
    .bind(now)
    .bind(job.id)
    .bind(worker_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok((updated == 1).then_some(state))
}

/// Cancel the unfinished job for (stage, key), whoever holds it.
pub async fn cancel(pool: &SqlitePool, stage: Stage, key: &str, reason: &str) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE jobs SET
            state = 'cancelled',
            last_error = ?,
            rerun = 0,
            lease_owner = NULL,
            lease_until_ms = NULL,
            updated_at_ms = ?
        WHERE stage = ? AND key = ? AND state IN ('pending', 'running', 'failed_retryable')
        "#,
    )
    .bind(reason)
    .bind(now_ms())
    .bind(stage.as_str())
    .bind(key)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

pub async fn get_job(pool: &SqlitePool, stage: Stage, key: &str) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE stage = ? AND key = ?")
        .bind(stage.as_str())
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn list_jobs(
    pool: &SqlitePool,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        "SELECT * FROM jobs WHERE (?1 IS NULL OR state = ?1) ORDER BY updated_at_ms DESC, id DESC LIMIT ?2",
    )
    .bind(state.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Job counts keyed by stage, then state.
pub async fn counts(pool: &SqlitePool) -> Result<BTreeMap<String, BTreeMap<String, i64>>> {
    let rows = sqlx::query("SELECT stage, state, COUNT(*) AS n FROM jobs GROUP BY stage, state")
        .fetch_all(pool)
        .await?;
    let mut out: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for row in rows {
        out.entry(row.get("stage"))
            .or_default()
            .insert(row.get("state"), row.get("n"));
    }
    Ok(out)
}

/// Number of jobs that still have work to do, due or not.
pub async fn outstanding(pool: &SqlitePool) -> Result<i64> {
    let n = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'running', 'failed_retryable')",
    )
    .fetch_one(pool)
    .await?;
    Ok(n)
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub counts: BTreeMap<String, BTreeMap<String, i64>>,
    pub jobs: Vec<Job>,
}

pub async fn summary(pool: &SqlitePool, state: Option<JobState>, limit: i64) -> Result<JobSummary> {
    Ok(JobSummary {
        counts: counts(pool).await?,
        jobs: list_jobs(pool, state, limit).await?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let stage: String = row.get("stage");
    let state: String = row.get("state");
    let payload: String = row.get("payload");
    let attempts: i64 = row.get("attempts");
    let next_run_at: i64 = row.get("next_run_at_ms");
    let lease_until: Option<i64> = row.get("lease_until_ms");
    let created_at: i64 = row.get("created_at_ms");
    let updated_at: i64 = row.get("updated_at_ms");
    Ok(Job {
        id: row.get("id"),
        stage: stage.parse()?,
        key: row.get("key"),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        state: state.parse()?,
        attempts: attempts.max(0) as u32,
        next_run_at: from_millis(next_run_at),
        lease_owner: row.get("lease_owner"),
        lease_until: lease_until.map(from_millis),
        last_error: row.get("last_error"),
        warning: row.get("warning"),
        created_at: from_millis(created_at),
        updated_at: from_millis(updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_ms(1, 1000, 60_000), 1000);
        assert_eq!(backoff_ms(2, 1000, 60_000), 2000);
        assert_eq!(backoff_ms(4, 1000, 60_000), 8000);
        assert_eq!(backoff_ms(10, 1000, 60_000), 60_000);
        assert_eq!(backoff_ms(0, 1000, 60_000), 1000);
        assert_eq!(backoff_ms(200, 1000, 60_000), 60_000);
    }
}
