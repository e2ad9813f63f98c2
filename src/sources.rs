//! Dedup and source store.
//!
//! Sources are registered idempotently by URL. Each successful fetch is
//! compared against the stored SHA-256 content hash: an unchanged body only
//! touches `last_crawled`, a changed body writes a new immutable Document in
//! the same transaction that records the new hash.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use energy_cost_core::PipelineError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use url::Url;

use crate::db::from_secs;
use crate::fetch::FetchedPage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub domain: String,
    pub robots_ok: bool,
    pub deny_reason: Option<String>,
    pub content_hash: Option<String>,
    pub last_crawled: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Registered {
    pub source_id: i64,
    /// False when the URL was already known.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Unchanged,
    Changed { document_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub source_id: i64,
    pub source_url: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub content_hash: String,
    pub body: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 of the fetched body, hex encoded.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse and canonicalize a URL, returning it with its lowercase host.
pub fn parse_source_url(raw: &str) -> Result<(String, String), PipelineError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| PipelineError::invalid(format!("invalid url '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PipelineError::invalid(format!(
            "unsupported url scheme '{}' in '{}'",
            url.scheme(),
            raw
        )));
    }
    let domain = url
        .host_str()
        .ok_or_else(|| PipelineError::invalid(format!("url has no host: '{}'", raw)))?
        .to_ascii_lowercase();
    Ok((url.to_string(), domain))
}

/// Register `url`. Never fails on a duplicate.
pub async fn register_source(pool: &SqlitePool, url: &str) -> Result<Registered> {
    let (url, domain) = parse_source_url(url)?;
    let now = Utc::now().timestamp();

    let inserted = sqlx::query(
        r#"
        INSERT INTO sources (url, domain, robots_ok, first_seen)
        VALUES (?, ?, 1, ?)
        ON CONFLICT(url) DO NOTHING
        "#,
    )
    .bind(&url)
    .bind(&domain)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    let source_id: i64 = sqlx::query_scalar("SELECT id FROM sources WHERE url = ?")
        .bind(&url)
        .fetch_one(pool)
        .await?;

    Ok(Registered {
        source_id,
        created: inserted == 1,
    })
}

/// Record a successful fetch of `source_id`.
pub async fn record_fetch(
    pool: &SqlitePool,
    source_id: i64,
    content_hash: &str,
    fetched_at: DateTime<Utc>,
    page: &FetchedPage,
) -> Result<FetchOutcome> {
    let mut tx = pool.begin().await?;

    // Write first so the transaction holds the write lock before it reads.
    let touched = sqlx::query("UPDATE sources SET last_crawled = ? WHERE id = ?")
        .bind(fetched_at.timestamp())
        .bind(source_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(PipelineError::not_found(format!("source {}", source_id)).into());
    }

    let stored: Option<String> = sqlx::query_scalar("SELECT content_hash FROM sources WHERE id = ?")
        .bind(source_id)
        .fetch_one(&mut *tx)
        .await?;

    if stored.as_deref() == Some(content_hash) {
        tx.commit().await?;
        return Ok(FetchOutcome::Unchanged);
    }

    sqlx::query("UPDATE sources SET content_hash = ? WHERE id = ?")
        .bind(content_hash)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO documents (source_id, title, published_at, snippet, raw_storage_ref, content_hash, body, tags, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, '[]', ?)
        ON CONFLICT(source_id, content_hash) DO NOTHING
        "#,
    )
    .bind(source_id)
    .bind(&page.title)
    .bind(page.published_at.map(|d| d.timestamp()))
    .bind(page.snippet())
    .bind(&page.url)
    .bind(content_hash)
    .bind(&page.body)
    .bind(fetched_at.timestamp())
    .execute(&mut *tx)
    .await?;

    let document_id: i64 =
        sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ? AND content_hash = ?")
            .bind(source_id)
            .bind(content_hash)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;
    Ok(FetchOutcome::Changed { document_id })
}

/// Disable a source after a fetch was refused.
pub async fn deny_source(pool: &SqlitePool, source_id: i64, reason: &str) -> Result<()> {
    sqlx::query("UPDATE sources SET robots_ok = 0, deny_reason = ? WHERE id = ?")
        .bind(reason)
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Re-enable a denied source. Returns false when the URL is unknown.
pub async fn reset_source(pool: &SqlitePool, url: &str) -> Result<bool> {
    let (url, _) = parse_source_url(url)?;
    let updated = sqlx::query("UPDATE sources SET robots_ok = 1, deny_reason = NULL WHERE url = ?")
        .bind(&url)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated > 0)
}

/// Allowed sources never fetched or last fetched before `now - threshold`.
pub async fn stale_sources(pool: &SqlitePool, threshold: Duration) -> Result<Vec<Source>> {
    let cutoff = (Utc::now() - threshold).timestamp();
    let rows = sqlx::query(
        r#"
        SELECT * FROM sources
        WHERE robots_ok = 1 AND (last_crawled IS NULL OR last_crawled < ?)
        ORDER BY id
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(source_from_row).collect())
}

pub async fn get_source(pool: &SqlitePool, source_id: i64) -> Result<Option<Source>> {
    let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

pub async fn get_source_by_url(pool: &SqlitePool, url: &str) -> Result<Option<Source>> {
    let (url, _) = parse_source_url(url)?;
    let row = sqlx::query("SELECT * FROM sources WHERE url = ?")
        .bind(&url)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<Source>> {
    let rows = sqlx::query("SELECT * FROM sources ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(source_from_row).collect())
}

fn source_from_row(row: &sqlx::sqlite::SqliteRow) -> Source {
    let robots_ok: i64 = row.get("robots_ok");
    let last_crawled: Option<i64> = row.get("last_crawled");
    let first_seen: i64 = row.get("first_seen");
    Source {
        id: row.get("id"),
        url: row.get("url"),
        domain: row.get("domain"),
        robots_ok: robots_ok != 0,
        deny_reason: row.get("deny_reason"),
        content_hash: row.get("content_hash"),
        last_crawled: last_crawled.map(from_secs),
        first_seen: from_secs(first_seen),
    }
}

pub async fn get_document(pool: &SqlitePool, document_id: i64) -> Result<Option<Document>> {
    let row = sqlx::query(
        r#"
        SELECT d.*, s.url AS source_url
        FROM documents d JOIN sources s ON s.id = d.source_id
        WHERE d.id = ?
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let published_at: Option<i64> = row.get("published_at");
        let created_at: i64 = row.get("created_at");
        let tags: String = row.get("tags");
        Document {
            id: row.get("id"),
            source_id: row.get("source_id"),
            source_url: row.get("source_url"),
            title: row.get("title"),
            published_at: published_at.map(from_secs),
            snippet: row.get("snippet"),
            content_hash: row.get("content_hash"),
            body: row.get("body"),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            created_at: from_secs(created_at),
        }
    }))
}

/// Documents with neither candidates nor facts.
pub async fn unextracted_documents(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT d.id FROM documents d
        WHERE NOT EXISTS (SELECT 1 FROM candidates c WHERE c.document_id = d.id)
          AND NOT EXISTS (SELECT 1 FROM facts f WHERE f.document_id = d.id)
        ORDER BY d.id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn urls_are_canonicalized() {
        let (url, domain) = parse_source_url("https://WWW.NREL.gov").unwrap();
        assert_eq!(url, "https://www.nrel.gov/");
        assert_eq!(domain, "www.nrel.gov");
        assert!(parse_source_url("ftp://example.com/x").is_err());
        assert!(parse_source_url("not a url").is_err());
    }
}
