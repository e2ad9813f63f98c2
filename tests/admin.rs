//! Admin control plane: audit completeness, serialization and rollback.

use std::sync::Arc;

use energy_cost::admin::{self, AdminPlane, ServerControl};
use energy_cost::config::Config;
use energy_cost::core::PipelineError;
use energy_cost::{db, migrate};
use sqlx::SqlitePool;
use tempfile::TempDir;

async fn setup() -> (TempDir, Arc<Config>, SqlitePool, AdminPlane) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("data/ecost.sqlite"));
    config.admin.serialize_wait_ms = 1000;
    config.admin.max_replicas = 16;
    let config = Arc::new(config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let admin = AdminPlane::new(pool.clone(), config.clone());
    (tmp, config, pool, admin)
}

fn pipeline_error(err: &anyhow::Error) -> &PipelineError {
    err.downcast_ref::<PipelineError>()
        .expect("admin errors are pipeline errors")
}

async fn hold_lock(pool: &SqlitePool, key: &str) {
    let now = db::now_ms();
    sqlx::query(
        "INSERT INTO admin_locks (key, holder, acquired_at_ms, expires_at_ms) VALUES (?, 'other-process', ?, ?)",
    )
    .bind(key)
    .bind(now)
    .bind(now + 60_000)
    .execute(pool)
    .await
    .unwrap();
}

async fn break_audit_log(pool: &SqlitePool) {
    sqlx::query(
        "CREATE TRIGGER reject_audit BEFORE INSERT ON ops_audit BEGIN SELECT RAISE(ABORT, 'audit disk full'); END;",
    )
    .execute(pool)
    .await
    .unwrap();
}

async fn repair_audit_log(pool: &SqlitePool) {
    sqlx::query("DROP TRIGGER reject_audit")
        .execute(pool)
        .await
        .unwrap();
}

// ============ Audit completeness ============

#[tokio::test]
async fn test_every_outcome_is_audited() {
    let (_tmp, _config, pool, admin) = setup().await;

    // success
    let result = admin.scale_worker("alice", "worker", 3).await.unwrap();
    assert_eq!(result.previous, None);
    assert_eq!(result.replicas, 3);
    assert_eq!(result.generation, 1);

    // validation failures
    let err = admin.scale_worker("bob", "worker", -1).await.unwrap_err();
    assert!(matches!(pipeline_error(&err), PipelineError::InvalidRequest(_)));
    let err = admin.scale_worker("bob", "gpu", 1).await.unwrap_err();
    assert!(matches!(pipeline_error(&err), PipelineError::InvalidRequest(_)));

    // conflict
    hold_lock(&pool, "scale:api").await;
    let err = admin.scale_worker("carol", "api", 2).await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::ConflictingAdminAction { .. }
    ));

    let log = admin.audit_log(None).await.unwrap();
    assert_eq!(log.len(), 4);
    // newest first
    let actors: Vec<&str> = log.iter().map(|r| r.actor.as_str()).collect();
    assert_eq!(actors, vec!["carol", "bob", "bob", "alice"]);
    assert!(log.iter().all(|r| r.action == "scale_worker"));

    assert_eq!(log[3].result["status"], "ok");
    assert_eq!(log[3].result["result"]["replicas"], 3);
    assert_eq!(log[2].result["status"], "error");
    assert_eq!(log[2].result["error"]["code"], "bad_request");
    assert_eq!(log[2].target, "worker");
    assert_eq!(log[1].target, "gpu");
    assert_eq!(log[0].result["error"]["code"], "conflicting_admin_action");

    // Failed calls changed nothing.
    assert_eq!(admin::current_replicas(&pool, "worker").await.unwrap(), Some(3));
    assert_eq!(admin::current_replicas(&pool, "api").await.unwrap(), None);
}

#[tokio::test]
async fn test_audit_limit_is_respected() {
    let (_tmp, _config, _pool, admin) = setup().await;
    for n in 1..=5 {
        admin.scale_worker("alice", "worker", n).await.unwrap();
    }
    let log = admin.audit_log(Some(2)).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].result["result"]["replicas"], 5);
    assert_eq!(log[0].result["result"]["previous"], 4);
}

#[tokio::test]
async fn test_unknown_actions_are_audited() {
    let (_tmp, _config, _pool, admin) = setup().await;

    let err = admin.db_control("alice", "drop_everything").await.unwrap_err();
    assert!(matches!(pipeline_error(&err), PipelineError::InvalidRequest(_)));

    let request = ServerControl {
        action: "scale_worker".to_string(),
        target: Some("worker".to_string()),
        replicas: None,
    };
    let err = admin.server_control("alice", &request).await.unwrap_err();
    assert!(matches!(pipeline_error(&err), PipelineError::InvalidRequest(_)));

    let log = admin.audit_log(None).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].action, "drop_everything");
    assert_eq!(log[1].target, "db");
    assert_eq!(log[0].target, "worker");
}

// ============ Serialization ============

#[tokio::test]
async fn test_concurrent_scales_are_serialized() {
    let (_tmp, config, pool, admin) = setup().await;
    let other = AdminPlane::new(pool.clone(), config.clone());

    let (a, b) = tokio::join!(
        admin.scale_worker("alice", "worker", 4),
        other.scale_worker("bob", "worker", 4)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut generations = vec![a.generation, b.generation];
    generations.sort();
    assert_eq!(generations, vec![1, 2]);
    // The later call saw the earlier one's value.
    let later = if a.generation == 2 { &a } else { &b };
    assert_eq!(later.previous, Some(4));

    assert_eq!(admin::current_replicas(&pool, "worker").await.unwrap(), Some(4));
    assert_eq!(admin.audit_log(None).await.unwrap().len(), 2);
    assert!(admin.server_status().await.unwrap().locks.is_empty());
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let (_tmp, _config, pool, admin) = setup().await;
    sqlx::query(
        "INSERT INTO admin_locks (key, holder, acquired_at_ms, expires_at_ms) VALUES ('scale:worker', 'crashed', 0, 1)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = admin.scale_worker("alice", "worker", 2).await.unwrap();
    assert_eq!(result.replicas, 2);
}

#[tokio::test]
async fn test_backup_is_single_flight() {
    let (_tmp, config, pool, admin) = setup().await;
    hold_lock(&pool, "db:backup_snapshot").await;

    let err = admin.backup_snapshot("alice").await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::ConflictingAdminAction { .. }
    ));
    assert!(!config.admin.backup_dir.exists());

    let log = admin.audit_log(None).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, "backup_snapshot");
    assert_eq!(log[0].result["status"], "error");
}

// ============ Maintenance ============

#[tokio::test]
async fn test_backup_and_vacuum() {
    let (_tmp, _config, _pool, admin) = setup().await;
    admin.scale_worker("alice", "worker", 2).await.unwrap();

    let backup = admin.backup_snapshot("alice").await.unwrap();
    assert!(backup.path.exists());
    assert!(backup.size_bytes > 0);

    // The snapshot is a usable database holding the data at backup time.
    let snapshot = db::connect(&Config::minimal(&backup.path)).await.unwrap();
    assert_eq!(
        admin::current_replicas(&snapshot, "worker").await.unwrap(),
        Some(2)
    );

    let vacuum = admin.vacuum_analyze("alice").await.unwrap();
    assert!(vacuum.pages_after > 0);

    let status = admin.db_status().await.unwrap();
    assert_eq!(status.quick_check, "ok");
    assert_eq!(status.journal_mode, "wal");
    assert_eq!(status.row_counts["ops_audit"], 3);
}

#[tokio::test]
async fn test_server_status_reports_replicas() {
    let (_tmp, config, _pool, admin) = setup().await;
    let status = admin.server_status().await.unwrap();
    assert_eq!(status.replicas["worker"], config.pipeline.workers as u32);
    assert_eq!(status.replicas["api"], 1);
    assert_eq!(status.outstanding_jobs, 0);

    admin.scale_worker("alice", "api", 3).await.unwrap();
    let status = admin.server_status().await.unwrap();
    assert_eq!(status.replicas["api"], 3);
}

// ============ Audit write failures ============

#[tokio::test]
async fn test_scale_rolls_back_when_audit_fails() {
    let (_tmp, _config, pool, admin) = setup().await;
    admin.scale_worker("alice", "worker", 2).await.unwrap();

    break_audit_log(&pool).await;
    let err = admin.scale_worker("alice", "worker", 6).await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::AuditWriteFailure(_)
    ));
    repair_audit_log(&pool).await;

    assert_eq!(admin::current_replicas(&pool, "worker").await.unwrap(), Some(2));
    assert_eq!(admin.audit_log(None).await.unwrap().len(), 1);
    // The lock was released.
    admin.scale_worker("alice", "worker", 5).await.unwrap();
}

#[tokio::test]
async fn test_backup_is_removed_when_audit_fails() {
    let (_tmp, config, pool, admin) = setup().await;

    break_audit_log(&pool).await;
    let err = admin.backup_snapshot("alice").await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        PipelineError::AuditWriteFailure(_)
    ));

    let leftovers = std::fs::read_dir(&config.admin.backup_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}
