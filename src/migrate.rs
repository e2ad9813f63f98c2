use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Every table the pipeline and the admin plane use.
pub const TABLES: &[&str] = &[
    "sources",
    "documents",
    "entities",
    "candidates",
    "facts",
    "prices",
    "assumptions",
    "scenarios",
    "results",
    "compute_failures",
    "rankings",
    "jobs",
    "admin_locks",
    "worker_scale",
    "ops_audit",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Sources: one row per URL ever registered
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            domain TEXT NOT NULL,
            robots_ok INTEGER NOT NULL DEFAULT 1,
            deny_reason TEXT,
            content_hash TEXT,
            last_crawled INTEGER,
            first_seen INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Documents: immutable snapshots of a source's content
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            title TEXT,
            published_at INTEGER,
            snippet TEXT,
            raw_storage_ref TEXT,
            content_hash TEXT NOT NULL,
            body TEXT NOT NULL,
            embedding BLOB,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            UNIQUE(source_id, content_hash),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Entities: absent identity parts are stored as '' so the unique key holds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            manufacturer TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            UNIQUE(name, manufacturer, model, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Candidates: raw extractor output awaiting normalization
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            entity_hint TEXT,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            confidence REAL NOT NULL,
            span TEXT NOT NULL,
            extraction_method TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS facts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL,
            document_id INTEGER,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            span_excerpt TEXT NOT NULL DEFAULT '',
            quality_score REAL NOT NULL CHECK (quality_score >= 0.0 AND quality_score <= 1.0),
            extracted_at INTEGER NOT NULL,
            extraction_method TEXT NOT NULL,
            FOREIGN KEY (entity_id) REFERENCES entities(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL,
            value REAL NOT NULL,
            currency TEXT NOT NULL,
            basis TEXT NOT NULL,
            region TEXT,
            valid_from INTEGER,
            valid_to INTEGER,
            document_id INTEGER,
            FOREIGN KEY (entity_id) REFERENCES entities(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assumptions (
            name TEXT PRIMARY KEY,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            document_id INTEGER,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Scenarios are immutable; the full parameter set lives in spec_json
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scenarios (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            use_case TEXT NOT NULL,
            region TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scenario_id INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            lcoe_usd_per_kwh REAL,
            lcos_usd_per_kwh REAL,
            confidence REAL NOT NULL,
            breakdown_json TEXT NOT NULL,
            computed_at INTEGER NOT NULL,
            UNIQUE(scenario_id, entity_id),
            FOREIGN KEY (scenario_id) REFERENCES scenarios(id),
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS compute_failures (
            scenario_id INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (scenario_id, entity_id),
            FOREIGN KEY (scenario_id) REFERENCES scenarios(id),
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rankings (
            scenario_id INTEGER NOT NULL,
            list TEXT NOT NULL CHECK (list IN ('lcoe', 'storage')),
            rank INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            value REAL NOT NULL,
            confidence REAL NOT NULL,
            ranked_at INTEGER NOT NULL,
            PRIMARY KEY (scenario_id, list, rank),
            FOREIGN KEY (scenario_id) REFERENCES scenarios(id),
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Jobs: one row per (stage, key); times are unix milliseconds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            key TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            rerun INTEGER NOT NULL DEFAULT 0,
            next_run_at_ms INTEGER NOT NULL,
            lease_owner TEXT,
            lease_until_ms INTEGER,
            last_error TEXT,
            warning TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(stage, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admin_locks (
            key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS worker_scale (
            target TEXT PRIMARY KEY,
            replicas INTEGER NOT NULL,
            generation INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Audit log: append-only; id gives the total order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ops_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            target TEXT NOT NULL,
            result_json TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_candidates_document ON candidates(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_facts_entity_metric ON facts(entity_id, metric)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_facts_document ON facts(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_prices_entity ON prices(entity_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, next_run_at_ms)")
        .execute(pool)
        .await?;

    Ok(())
}
