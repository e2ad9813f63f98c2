//! Extract and normalize stages.
//!
//! `extract` runs an [`Extractor`] over a stored document and replaces that
//! document's candidate rows. `normalize` turns the candidates into scored
//! facts: canonical metric, canonical unit, resolved entity, quality score.
//! Both stages are keyed by document id and replace their own output on a
//! re-run, so they are idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use energy_cost_core::extractor::{DocumentText, Extractor};
use energy_cost_core::models::{CandidateFact, EntityType, NewEntity};
use energy_cost_core::normalize::{canonical_metric, is_storage_metric, normalize};
use energy_cost_core::quality::{self, QualityInput};
use energy_cost_core::PipelineError;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::catalog;
use crate::sources::{self, Document};

/// Text with a smaller share of alphanumeric characters is treated as garbled.
pub const MIN_ALNUM_RATIO: f64 = 0.2;

/// Reject empty or garbled document text.
pub fn check_text(document_id: i64, body: &str) -> Result<(), PipelineError> {
    let skipped = |reason: &str| PipelineError::ExtractionSkipped {
        document_id,
        reason: reason.to_string(),
    };

    let mut visible = 0usize;
    let mut alnum = 0usize;
    for c in body.chars().filter(|c| !c.is_whitespace()) {
        visible += 1;
        if c.is_alphanumeric() {
            alnum += 1;
        }
    }
    if visible == 0 {
        return Err(skipped("empty text"));
    }
    if (alnum as f64) < MIN_ALNUM_RATIO * visible as f64 {
        return Err(skipped("garbled text"));
    }
    Ok(())
}

async fn load_document(pool: &SqlitePool, document_id: i64) -> Result<Document> {
    sources::get_document(pool, document_id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)).into())
}

/// Run `extractor` over a document and store its candidates. Returns the
/// number of candidates written.
pub async fn extract_document(
    pool: &SqlitePool,
    extractor: Arc<dyn Extractor>,
    document_id: i64,
) -> Result<usize> {
    let doc = load_document(pool, document_id).await?;
    check_text(document_id, &doc.body)?;

    let method = extractor.method().to_string();
    let title = doc.title.clone();
    let body = doc.body;
    let candidates = tokio::task::spawn_blocking(move || {
        extractor.extract(&DocumentText {
            title: title.as_deref(),
            body: &body,
        })
    })
    .await?;

    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM candidates WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    for c in &candidates {
        sqlx::query(
            r#"
            INSERT INTO candidates (document_id, entity_hint, metric, value, unit, confidence, span, extraction_method, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(&c.entity_hint)
        .bind(&c.metric)
        .bind(c.value)
        .bind(&c.unit)
        .bind(c.confidence)
        .bind(&c.span)
        .bind(&method)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    info!(document_id, candidates = candidates.len(), "extracted");
    Ok(candidates.len())
}

/// Stored candidate with its extraction method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCandidate {
    pub id: i64,
    pub document_id: i64,
    pub extraction_method: String,
    #[serde(flatten)]
    pub candidate: CandidateFact,
}

pub async fn candidates_for_document(
    pool: &SqlitePool,
    document_id: i64,
) -> Result<Vec<StoredCandidate>> {
    let rows = sqlx::query("SELECT * FROM candidates WHERE document_id = ? ORDER BY id")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| StoredCandidate {
            id: row.get("id"),
            document_id: row.get("document_id"),
            extraction_method: row.get("extraction_method"),
            candidate: CandidateFact {
                entity_hint: row.get("entity_hint"),
                metric: row.get("metric"),
                value: row.get("value"),
                unit: row.get("unit"),
                confidence: row.get("confidence"),
                span: row.get("span"),
            },
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub facts: usize,
    pub rejected: usize,
    pub entities_created: usize,
}

struct PendingFact {
    entity_id: i64,
    metric: &'static str,
    value: f64,
    unit: &'static str,
    span: String,
    quality: f64,
    method: String,
}

/// Price basis recorded for cost metrics.
fn price_basis(metric: &str) -> Option<&'static str> {
    match metric {
        "price_usd" => Some("per_unit"),
        "capex_per_kw" => Some("per_kw"),
        "capex_per_kwh" => Some("per_kwh"),
        _ => None,
    }
}

/// Turn a document's candidates into facts, replacing any facts (and price
/// observations) previously derived from it.
pub async fn normalize_document(pool: &SqlitePool, document_id: i64) -> Result<NormalizeReport> {
    let doc = load_document(pool, document_id).await?;
    let candidates = candidates_for_document(pool, document_id).await?;
    let extracted_at = Utc::now();

    let mut report = NormalizeReport::default();
    let mut entity_ids: HashMap<String, i64> = HashMap::new();
    let mut pending: Vec<PendingFact> = Vec::new();

    for stored in &candidates {
        let c = &stored.candidate;
        let Some(metric) = canonical_metric(&c.metric) else {
            warn!(document_id, metric = %c.metric, "unknown metric, candidate rejected");
            report.rejected += 1;
            continue;
        };
        let (value, unit) = match normalize(c.value, &c.unit, metric) {
            Ok(v) => v,
            Err(e) => {
                warn!(document_id, error = %e, "candidate rejected");
                report.rejected += 1;
                continue;
            }
        };

        let hint = c
            .entity_hint
            .as_deref()
            .or(doc.title.as_deref())
            .map(str::trim)
            .filter(|h| !h.is_empty());
        let Some(hint) = hint else {
            warn!(document_id, metric, "no entity hint, candidate rejected");
            report.rejected += 1;
            continue;
        };

        let key = hint.to_lowercase();
        let entity_id = match entity_ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = match catalog::find_entity_by_name(pool, hint).await? {
                    Some(entity) => entity.id,
                    None => {
                        let entity_type = if is_storage_metric(metric) {
                            EntityType::Battery
                        } else {
                            EntityType::Pv
                        };
                        let (entity, created) = catalog::upsert_entity(
                            pool,
                            &NewEntity {
                                name: hint.to_string(),
                                entity_type,
                                manufacturer: None,
                                model: None,
                                version: None,
                            },
                        )
                        .await?;
                        if created {
                            report.entities_created += 1;
                            debug!(entity_id = entity.id, name = %entity.name, "entity registered");
                        }
                        entity.id
                    }
                };
                entity_ids.insert(key, id);
                id
            }
        };

        let score = quality::score(&QualityInput {
            confidence: c.confidence,
            source_url: Some(&doc.source_url),
            span: &c.span,
            title: doc.title.as_deref(),
            published_at: doc.published_at,
            extracted_at: Some(extracted_at),
        });

        pending.push(PendingFact {
            entity_id,
            metric,
            value,
            unit,
            span: c.span.clone(),
            quality: score.overall,
            method: stored.extraction_method.clone(),
        });
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM facts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM prices WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for fact in &pending {
        sqlx::query(
            r#"
            INSERT INTO facts (entity_id, document_id, metric, value, unit, span_excerpt, quality_score, extracted_at, extraction_method)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fact.entity_id)
        .bind(document_id)
        .bind(fact.metric)
        .bind(fact.value)
        .bind(fact.unit)
        .bind(&fact.span)
        .bind(fact.quality)
        .bind(extracted_at.timestamp())
        .bind(&fact.method)
        .execute(&mut *tx)
        .await?;

        if let Some(basis) = price_basis(fact.metric) {
            sqlx::query(
                r#"
                INSERT INTO prices (entity_id, value, currency, basis, region, valid_from, valid_to, document_id)
                VALUES (?, ?, 'USD', ?, NULL, ?, NULL, ?)
                "#,
            )
            .bind(fact.entity_id)
            .bind(fact.value)
            .bind(basis)
            .bind(doc.published_at.map(|d| d.timestamp()))
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;

    report.facts = pending.len();
    info!(
        document_id,
        facts = report.facts,
        rejected = report.rejected,
        "normalized"
    );
    Ok(report)
}
