//! Admin control plane.
//!
//! Mutating actions (`scale_worker`, `vacuum_analyze`, `backup_snapshot`)
//! append exactly one record to `ops_audit` per call, whatever the outcome.
//! A call whose audit record cannot be written fails with
//! `AuditWriteFailure` and leaves no effect behind.
//!
//! Coordination goes through the `admin_locks` table so it holds across
//! processes sharing the database:
//!
//! - `scale:<target>` serializes scale calls per target. A caller waits up to
//!   `admin.serialize_wait_ms` for the lock, then gets a conflict.
//! - `db:<action>` makes vacuum and backup single-flight. A second caller
//!   gets a conflict immediately.
//!
//! Locks carry a lease (`admin.lock_lease_secs`); an expired lock may be
//! taken over. Single-flight holders renew their lease while the action
//! runs, so only a holder that died lets its lock expire.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use energy_cost_core::models::AuditRecord;
use energy_cost_core::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{from_millis, now_ms};
use crate::migrate::TABLES;
use crate::pipeline::classify;
use crate::queue;

/// Replica target driving the in-process worker pool.
pub const WORKER_TARGET: &str = "worker";

const LOCK_POLL: Duration = Duration::from_millis(50);
const MAX_AUDIT_LIMIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleResult {
    pub target: String,
    pub previous: Option<u32>,
    pub replicas: u32,
    pub generation: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VacuumReport {
    pub pages_before: i64,
    pub pages_after: i64,
    pub freelist_before: i64,
    pub freelist_after: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub path: PathBuf,
    pub sqlite_version: String,
    pub file_size_bytes: u64,
    pub page_count: i64,
    pub page_size: i64,
    pub freelist_count: i64,
    pub journal_mode: String,
    pub quick_check: String,
    pub row_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldLock {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub workers: usize,
    pub replicas: BTreeMap<String, u32>,
    pub jobs: BTreeMap<String, BTreeMap<String, i64>>,
    pub outstanding_jobs: i64,
    pub locks: Vec<HeldLock>,
}

/// Body of `POST /api/admin/server/control`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerControl {
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub replicas: Option<i64>,
}

/// Body of `POST /api/admin/db/control`.
#[derive(Debug, Clone, Deserialize)]
pub struct DbControl {
    pub action: String,
}

/// Stored replica count for `target`, if ever set.
pub async fn current_replicas(pool: &SqlitePool, target: &str) -> Result<Option<u32>> {
    let replicas: Option<i64> =
        sqlx::query_scalar("SELECT replicas FROM worker_scale WHERE target = ?")
            .bind(target)
            .fetch_optional(pool)
            .await?;
    Ok(replicas.map(|r| r.max(0) as u32))
}

/// Append one audit record. Any failure is reported as `AuditWriteFailure`.
pub async fn append_audit<'e, E: SqliteExecutor<'e>>(
    executor: E,
    actor: &str,
    action: &str,
    target: &str,
    result: &Value,
) -> Result<i64, PipelineError> {
    sqlx::query(
        "INSERT INTO ops_audit (actor, action, target, result_json, ts_ms) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(actor)
    .bind(action)
    .bind(target)
    .bind(result.to_string())
    .bind(now_ms())
    .execute(executor)
    .await
    .map(|r| r.last_insert_rowid())
    .map_err(|e| {
        error!(action, target, "audit write failed: {}", e);
        PipelineError::AuditWriteFailure(e.to_string())
    })
}

fn ok_result<T: Serialize>(value: &T) -> Value {
    json!({ "status": "ok", "result": value })
}

fn error_result(err: &PipelineError) -> Value {
    json!({ "status": "error", "error": { "code": err.kind(), "message": err.to_string() } })
}

fn is_audit_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AuditWriteFailure(_))
    )
}

pub struct AdminPlane {
    pool: SqlitePool,
    config: Arc<Config>,
    started_at: Instant,
}

impl AdminPlane {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Self {
        Self {
            pool,
            config,
            started_at: Instant::now(),
        }
    }

    // ============ Locks ============

    async fn try_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let now = now_ms();
        let expires = now + self.lease_ms();
        let affected = sqlx::query(
            r#"
            INSERT INTO admin_locks (key, holder, acquired_at_ms, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                holder = excluded.holder,
                acquired_at_ms = excluded.acquired_at_ms,
                expires_at_ms = excluded.expires_at_ms
            WHERE admin_locks.expires_at_ms < ?3
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn lock_waiting(&self, key: &str, holder: &str, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_lock(key, holder).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    fn lease_ms(&self) -> i64 {
        (self.config.admin.lock_lease_secs * 1000) as i64
    }

    /// Push the lease of a held lock forward. Returns false when `holder`
    /// no longer holds `key`.
    async fn renew_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE admin_locks SET expires_at_ms = ? WHERE key = ? AND holder = ?",
        )
        .bind(now_ms() + self.lease_ms())
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Drive `body` to completion, renewing the lease on `key` every third
    /// of a lease.
    async fn run_renewing<T, F>(&self, key: &str, holder: &str, body: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(body);
        let period = Duration::from_millis((self.lease_ms() / 3).max(1) as u64);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                outcome = &mut body => return outcome,
                _ = renew.tick() => match self.renew_lock(key, holder).await {
                    Ok(true) => {}
                    Ok(false) => warn!(key, "admin lock lost while running"),
                    Err(e) => warn!(key, "failed to renew admin lock: {}", e),
                },
            }
        }
    }

    async fn unlock(&self, key: &str, holder: &str) {
        let released = sqlx::query("DELETE FROM admin_locks WHERE key = ? AND holder = ?")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await;
        if let Err(e) = released {
            warn!(key, "failed to release admin lock: {}", e);
        }
    }

    /// Audit a failed call and hand the error back. A failing audit write
    /// replaces the error with `AuditWriteFailure`.
    async fn audit_failure<T>(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        err: anyhow::Error,
    ) -> Result<T> {
        let classified = classify(&err);
        warn!(actor, action, target, kind = classified.kind(), "admin action failed: {}", classified);
        append_audit(&self.pool, actor, action, target, &error_result(&classified)).await?;
        Err(err)
    }

    fn conflict(action: &str, target: &str) -> anyhow::Error {
        PipelineError::ConflictingAdminAction {
            action: action.to_string(),
            target: target.to_string(),
        }
        .into()
    }

    // ============ Scale ============

    fn validate_scale(&self, target: &str, replicas: i64) -> Result<u32, PipelineError> {
        let admin = &self.config.admin;
        if !admin.scale_targets.iter().any(|t| t == target) {
            return Err(PipelineError::invalid(format!(
                "unknown scale target '{}' (allowed: {})",
                target,
                admin.scale_targets.join(", ")
            )));
        }
        if replicas < 0 || replicas > admin.max_replicas as i64 {
            return Err(PipelineError::invalid(format!(
                "replicas must be within 0..={}",
                admin.max_replicas
            )));
        }
        Ok(replicas as u32)
    }

    /// Set the replica count of `target`.
    pub async fn scale_worker(&self, actor: &str, target: &str, replicas: i64) -> Result<ScaleResult> {
        let action = "scale_worker";
        let replicas = match self.validate_scale(target, replicas) {
            Ok(r) => r,
            Err(e) => return self.audit_failure(actor, action, target, e.into()).await,
        };

        let key = format!("scale:{}", target);
        let holder = uuid::Uuid::new_v4().to_string();
        let wait = Duration::from_millis(self.config.admin.serialize_wait_ms);
        match self.lock_waiting(&key, &holder, wait).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .audit_failure(actor, action, target, Self::conflict(action, target))
                    .await
            }
            Err(e) => return self.audit_failure(actor, action, target, e).await,
        }

        let outcome = self.apply_scale(actor, target, replicas).await;
        self.unlock(&key, &holder).await;

        match outcome {
            Ok(result) => {
                info!(actor, target, replicas, generation = result.generation, "scaled");
                Ok(result)
            }
            Err(e) if is_audit_failure(&e) => Err(e),
            Err(e) => self.audit_failure(actor, action, target, e).await,
        }
    }

    async fn apply_scale(&self, actor: &str, target: &str, replicas: u32) -> Result<ScaleResult> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads.
        sqlx::query("UPDATE worker_scale SET replicas = replicas WHERE target = ?")
            .bind(target)
            .execute(&mut *tx)
            .await?;

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT replicas FROM worker_scale WHERE target = ?")
                .bind(target)
                .fetch_optional(&mut *tx)
                .await?;

        let generation: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO worker_scale (target, replicas, generation, updated_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(target) DO UPDATE SET
                replicas = excluded.replicas,
                generation = worker_scale.generation + 1,
                updated_at = excluded.updated_at
            RETURNING generation
            "#,
        )
        .bind(target)
        .bind(replicas as i64)
        .bind(Utc::now().timestamp())
        .fetch_one(&mut *tx)
        .await?;

        let result = ScaleResult {
            target: target.to_string(),
            previous: previous.map(|p| p.max(0) as u32),
            replicas,
            generation,
        };
        append_audit(&mut *tx, actor, "scale_worker", target, &ok_result(&result)).await?;
        tx.commit().await?;
        Ok(result)
    }

    // ============ Database maintenance ============

    async fn pragma(&self, name: &str) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(&format!("PRAGMA {}", name))
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    /// Run `body` holding the single-flight lock `db:<action>`. Every
    /// failure is audited here; the caller audits success.
    async fn single_flight<T, F>(&self, actor: &str, action: &str, body: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let key = format!("db:{}", action);
        let holder = uuid::Uuid::new_v4().to_string();
        match self.try_lock(&key, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .audit_failure(actor, action, "db", Self::conflict(action, "db"))
                    .await
            }
            Err(e) => return self.audit_failure(actor, action, "db", e).await,
        }
        let outcome = self.run_renewing(&key, &holder, body).await;
        self.unlock(&key, &holder).await;
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => self.audit_failure(actor, action, "db", e).await,
        }
    }

    /// `VACUUM` then `ANALYZE`, reporting page counts before and after.
    pub async fn vacuum_analyze(&self, actor: &str) -> Result<VacuumReport> {
        let action = "vacuum_analyze";
        let report = self
            .single_flight(actor, action, async {
                let pages_before = self.pragma("page_count").await?;
                let freelist_before = self.pragma("freelist_count").await?;
                sqlx::query("VACUUM").execute(&self.pool).await?;
                sqlx::query("ANALYZE").execute(&self.pool).await?;
                Ok(VacuumReport {
                    pages_before,
                    pages_after: self.pragma("page_count").await?,
                    freelist_before,
                    freelist_after: self.pragma("freelist_count").await?,
                })
            })
            .await?;

        append_audit(&self.pool, actor, action, "db", &ok_result(&report)).await?;
        info!(
            actor,
            pages_before = report.pages_before,
            pages_after = report.pages_after,
            "vacuumed"
        );
        Ok(report)
    }

    /// Write a consistent copy of the database into `admin.backup_dir`.
    pub async fn backup_snapshot(&self, actor: &str) -> Result<BackupReport> {
        let action = "backup_snapshot";
        let report = self
            .single_flight(actor, action, async {
                let dir = &self.config.admin.backup_dir;
                std::fs::create_dir_all(dir)?;
                let name = format!("backup_{}.sqlite", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
                let path = dir.join(name);
                sqlx::query("VACUUM INTO ?")
                    .bind(path.to_string_lossy().to_string())
                    .execute(&self.pool)
                    .await?;
                let size_bytes = std::fs::metadata(&path)?.len();
                Ok(BackupReport { path, size_bytes })
            })
            .await?;

        if let Err(e) = append_audit(&self.pool, actor, action, "db", &ok_result(&report)).await {
            if let Err(rm) = std::fs::remove_file(&report.path) {
                warn!(path = %report.path.display(), "failed to remove backup: {}", rm);
            }
            return Err(e.into());
        }
        info!(actor, path = %report.path.display(), size = report.size_bytes, "backup written");
        Ok(report)
    }

    /// Decode a control body. A body that is not JSON (`Err` holds the
    /// reason) or does not fit `T` is audited as a failed call, under the
    /// body's `action` and `target` when it names them.
    async fn decode_control<T: DeserializeOwned>(
        &self,
        actor: &str,
        default_target: &str,
        body: Result<Value, String>,
    ) -> Result<T> {
        let (value, reason) = match body {
            Ok(value) => match serde_json::from_value::<T>(value.clone()) {
                Ok(decoded) => return Ok(decoded),
                Err(e) => (value, e.to_string()),
            },
            Err(reason) => (Value::Null, reason),
        };
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        let action = field("action").unwrap_or_else(|| "unknown".to_string());
        let target = field("target").unwrap_or_else(|| default_target.to_string());
        let err = PipelineError::invalid(format!("malformed control body: {}", reason));
        self.audit_failure(actor, &action, &target, err.into()).await
    }

    /// Decode and dispatch a raw `POST /api/admin/db/control` body.
    pub async fn db_control_body(&self, actor: &str, body: Result<Value, String>) -> Result<Value> {
        let request: DbControl = self.decode_control(actor, "db", body).await?;
        let result = self.db_control(actor, &request.action).await?;
        Ok(json!({ "action": request.action, "result": result }))
    }

    /// Decode and dispatch a raw `POST /api/admin/server/control` body.
    pub async fn server_control_body(
        &self,
        actor: &str,
        body: Result<Value, String>,
    ) -> Result<ScaleResult> {
        let request: ServerControl = self.decode_control(actor, "server", body).await?;
        self.server_control(actor, &request).await
    }

    /// Dispatch `POST /api/admin/db/control`.
    pub async fn db_control(&self, actor: &str, action: &str) -> Result<Value> {
        match action {
            "vacuum_analyze" => Ok(serde_json::to_value(self.vacuum_analyze(actor).await?)?),
            "backup_snapshot" => Ok(serde_json::to_value(self.backup_snapshot(actor).await?)?),
            other => {
                let err = PipelineError::invalid(format!(
                    "unknown db action '{}' (allowed: vacuum_analyze, backup_snapshot)",
                    other
                ));
                self.audit_failure(actor, other, "db", err.into()).await
            }
        }
    }

    /// Dispatch `POST /api/admin/server/control`.
    pub async fn server_control(&self, actor: &str, request: &ServerControl) -> Result<ScaleResult> {
        let target = request.target.as_deref().unwrap_or("server");
        if request.action != "scale_worker" {
            let err = PipelineError::invalid(format!(
                "unknown server action '{}' (allowed: scale_worker)",
                request.action
            ));
            return self.audit_failure(actor, &request.action, target, err.into()).await;
        }
        let (Some(target), Some(replicas)) = (request.target.as_deref(), request.replicas) else {
            let err = PipelineError::invalid("scale_worker requires target and replicas");
            return self.audit_failure(actor, "scale_worker", target, err.into()).await;
        };
        self.scale_worker(actor, target, replicas).await
    }

    // ============ Read-only ============

    pub async fn db_status(&self) -> Result<DbStatus> {
        let sqlite_version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        let quick_check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;

        let mut row_counts = BTreeMap::new();
        for table in TABLES {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            row_counts.insert(table.to_string(), n);
        }

        let path = self.config.db.path.clone();
        let file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Ok(DbStatus {
            path,
            sqlite_version,
            file_size_bytes,
            page_count: self.pragma("page_count").await?,
            page_size: self.pragma("page_size").await?,
            freelist_count: self.pragma("freelist_count").await?,
            journal_mode,
            quick_check,
            row_counts,
        })
    }

    pub async fn server_status(&self) -> Result<ServerStatus> {
        let workers = self.config.pipeline.workers;
        let mut replicas = BTreeMap::new();
        for target in &self.config.admin.scale_targets {
            let stored = current_replicas(&self.pool, target).await?;
            let default = if target == WORKER_TARGET { workers as u32 } else { 1 };
            replicas.insert(target.clone(), stored.unwrap_or(default));
        }

        let rows = sqlx::query("SELECT * FROM admin_locks WHERE expires_at_ms >= ? ORDER BY key")
            .bind(now_ms())
            .fetch_all(&self.pool)
            .await?;
        let locks = rows
            .iter()
            .map(|row| HeldLock {
                key: row.get("key"),
                holder: row.get("holder"),
                acquired_at: from_millis(row.get("acquired_at_ms")),
                expires_at: from_millis(row.get("expires_at_ms")),
            })
            .collect();

        Ok(ServerStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            workers,
            replicas,
            jobs: queue::counts(&self.pool).await?,
            outstanding_jobs: queue::outstanding(&self.pool).await?,
            locks,
        })
    }

    /// Newest audit records first.
    pub async fn audit_log(&self, limit: Option<i64>) -> Result<Vec<AuditRecord>> {
        let limit = limit.unwrap_or(100).clamp(1, MAX_AUDIT_LIMIT);
        let rows = sqlx::query("SELECT * FROM ops_audit ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let result: String = row.get("result_json");
                AuditRecord {
                    id: row.get("id"),
                    actor: row.get("actor"),
                    action: row.get("action"),
                    target: row.get("target"),
                    result: serde_json::from_str(&result).unwrap_or(Value::Null),
                    ts: from_millis(row.get("ts_ms")),
                }
            })
            .collect())
    }
}
