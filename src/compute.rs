//! Compute stage: evaluate one (scenario, entity) pair and persist the result.
//!
//! The arithmetic lives in `energy_cost_core::lcoe`; this module loads the
//! inputs, upserts the `results` row keyed by the pair and keeps
//! `compute_failures` in step with the latest attempt.

use anyhow::Result;
use chrono::{DateTime, Utc};
use energy_cost_core::lcoe::{self, ComputedCost, EngineInputs, Rates};
use energy_cost_core::models::Entity;
use energy_cost_core::sensitivity::{self, SensitivityRow};
use energy_cost_core::PipelineError;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::catalog;
use crate::db::from_secs;

/// Persisted result of one computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub scenario_id: i64,
    pub entity_id: i64,
    pub entity_name: String,
    pub lcoe_usd_per_kwh: Option<f64>,
    pub lcos_usd_per_kwh: Option<f64>,
    pub confidence: f64,
    pub breakdown: serde_json::Value,
    pub computed_at: DateTime<Utc>,
}

/// Last recorded per-entity failure for a scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeFailure {
    pub entity_id: i64,
    pub kind: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

async fn require_entity(pool: &SqlitePool, entity_id: i64) -> Result<Entity> {
    catalog::get_entity(pool, entity_id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("entity {}", entity_id)).into())
}

/// Compute and store the levelized cost of `entity_id` under `scenario_id`.
///
/// Missing facts or assumptions are recorded in `compute_failures`, and any
/// earlier result for the pair is dropped, before the error is returned; a
/// success clears any earlier failure for the pair.
pub async fn compute_pair(
    pool: &SqlitePool,
    scenario_id: i64,
    entity_id: i64,
) -> Result<ComputedCost> {
    let scenario = catalog::require_scenario(pool, scenario_id).await?;
    let entity = require_entity(pool, entity_id).await?;
    let facts = catalog::facts_for_entity(pool, entity_id).await?;
    let assumptions = catalog::list_assumptions(pool).await?;

    let computed = match lcoe::compute(&scenario.spec, &entity, &facts, &assumptions) {
        Ok(c) => c,
        Err(e) => {
            if matches!(
                e,
                PipelineError::InsufficientData { .. } | PipelineError::MissingAssumption { .. }
            ) {
                record_failure(pool, scenario_id, entity_id, &e).await?;
                warn!(scenario_id, entity_id, kind = e.kind(), "compute failed: {}", e);
            }
            return Err(e.into());
        }
    };

    let now = Utc::now().timestamp();
    let breakdown = serde_json::to_string(&computed.breakdown)?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO results (scenario_id, entity_id, lcoe_usd_per_kwh, lcos_usd_per_kwh, confidence, breakdown_json, computed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(scenario_id, entity_id) DO UPDATE SET
            lcoe_usd_per_kwh = excluded.lcoe_usd_per_kwh,
            lcos_usd_per_kwh = excluded.lcos_usd_per_kwh,
            confidence = excluded.confidence,
            breakdown_json = excluded.breakdown_json,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(scenario_id)
    .bind(entity_id)
    .bind(computed.lcoe_usd_per_kwh)
    .bind(computed.lcos_usd_per_kwh)
    .bind(computed.confidence)
    .bind(&breakdown)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM compute_failures WHERE scenario_id = ? AND entity_id = ?")
        .bind(scenario_id)
        .bind(entity_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(
        scenario_id,
        entity_id,
        lcoe = ?computed.lcoe_usd_per_kwh,
        lcos = ?computed.lcos_usd_per_kwh,
        "computed"
    );
    Ok(computed)
}

async fn record_failure(
    pool: &SqlitePool,
    scenario_id: i64,
    entity_id: i64,
    error: &PipelineError,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO compute_failures (scenario_id, entity_id, kind, message, recorded_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(scenario_id, entity_id) DO UPDATE SET
            kind = excluded.kind,
            message = excluded.message,
            recorded_at = excluded.recorded_at
        "#,
    )
    .bind(scenario_id)
    .bind(entity_id)
    .bind(error.kind())
    .bind(error.to_string())
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;
    // A result computed from facts that no longer suffice is stale.
    let dropped = sqlx::query("DELETE FROM results WHERE scenario_id = ? AND entity_id = ?")
        .bind(scenario_id)
        .bind(entity_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    if dropped > 0 {
        info!(scenario_id, entity_id, "dropped stale result");
    }
    Ok(())
}

/// Whether `compute_pair` recorded this error as a per-entity failure.
pub fn is_recorded_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InsufficientData { .. } | PipelineError::MissingAssumption { .. })
    )
}

/// Entities whose type the scenario covers.
pub async fn entities_for_scenario(pool: &SqlitePool, scenario_id: i64) -> Result<Vec<Entity>> {
    let scenario = catalog::require_scenario(pool, scenario_id).await?;
    let all = catalog::list_entities(pool, &catalog::EntityFilter::default()).await?;
    Ok(all
        .into_iter()
        .filter(|e| scenario.spec.covers(e.entity_type))
        .collect())
}

pub async fn list_results(pool: &SqlitePool, scenario_id: i64) -> Result<Vec<StoredResult>> {
    let rows = sqlx::query(
        r#"
        SELECT r.*, e.name AS entity_name
        FROM results r JOIN entities e ON e.id = r.entity_id
        WHERE r.scenario_id = ?
        ORDER BY r.entity_id
        "#,
    )
    .bind(scenario_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let breakdown: String = row.get("breakdown_json");
            let computed_at: i64 = row.get("computed_at");
            StoredResult {
                scenario_id: row.get("scenario_id"),
                entity_id: row.get("entity_id"),
                entity_name: row.get("entity_name"),
                lcoe_usd_per_kwh: row.get("lcoe_usd_per_kwh"),
                lcos_usd_per_kwh: row.get("lcos_usd_per_kwh"),
                confidence: row.get("confidence"),
                breakdown: serde_json::from_str(&breakdown).unwrap_or(serde_json::Value::Null),
                computed_at: from_secs(computed_at),
            }
        })
        .collect())
}

pub async fn list_failures(pool: &SqlitePool, scenario_id: i64) -> Result<Vec<ComputeFailure>> {
    let rows = sqlx::query(
        "SELECT * FROM compute_failures WHERE scenario_id = ? ORDER BY entity_id",
    )
    .bind(scenario_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| {
            let recorded_at: i64 = row.get("recorded_at");
            ComputeFailure {
                entity_id: row.get("entity_id"),
                kind: row.get("kind"),
                message: row.get("message"),
                recorded_at: from_secs(recorded_at),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct SensitivityReport {
    pub scenario_id: i64,
    pub entity_id: i64,
    pub variation: f64,
    pub rows: Vec<SensitivityRow>,
}

/// One-at-a-time sensitivity of the pair's levelized cost to each input,
/// perturbed by ±`variation`. Computed on demand, never stored.
pub async fn sensitivity(
    pool: &SqlitePool,
    scenario_id: i64,
    entity_id: i64,
    variation: Option<f64>,
) -> Result<SensitivityReport> {
    let variation = variation.unwrap_or(sensitivity::DEFAULT_VARIATION);
    if !(variation > 0.0 && variation < 1.0) {
        return Err(PipelineError::invalid("variation must be in (0, 1)").into());
    }

    let scenario = catalog::require_scenario(pool, scenario_id).await?;
    let entity = require_entity(pool, entity_id).await?;
    let facts = catalog::facts_for_entity(pool, entity_id).await?;
    let assumptions = catalog::list_assumptions(pool).await?;

    let rates = Rates::from_assumptions(&assumptions)?;
    let resolved = EngineInputs::resolve(&scenario.spec, &entity, &facts, rates)?;

    Ok(SensitivityReport {
        scenario_id,
        entity_id,
        variation,
        rows: sensitivity::analyze(&resolved.inputs, variation),
    })
}
