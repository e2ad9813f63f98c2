//! Catalog persistence: entities, facts, assumptions, scenarios and prices.

use anyhow::Result;
use chrono::{DateTime, Utc};
use energy_cost_core::models::{
    Assumption, Entity, EntityType, Fact, NewEntity, Price, Scenario, ScenarioSpec,
};
use energy_cost_core::normalize::{canonical_metric, normalize};
use energy_cost_core::scenarios::{ProductPreset, CATALOG_METHOD, CATALOG_QUALITY};
use energy_cost_core::PipelineError;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::db::from_secs;

// ============ Entities ============

/// Filters for [`list_entities`]. All present filters must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityFilter {
    /// Case-insensitive substring of the name.
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: Option<EntityType>,
    pub manufacturer: Option<String>,
}

fn identity_part(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

fn optional_part(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Insert or update an entity by identity. Returns the row and whether it
/// was newly created.
pub async fn upsert_entity(pool: &SqlitePool, entity: &NewEntity) -> Result<(Entity, bool)> {
    let name = entity.name.trim();
    if name.is_empty() {
        return Err(PipelineError::invalid("entity name must not be empty").into());
    }
    let manufacturer = identity_part(&entity.manufacturer);
    let model = identity_part(&entity.model);
    let version = identity_part(&entity.version);

    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM entities WHERE name = ? AND manufacturer = ? AND model = ? AND version = ?",
    )
    .bind(name)
    .bind(&manufacturer)
    .bind(&model)
    .bind(&version)
    .fetch_optional(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO entities (name, type, manufacturer, model, version, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(name, manufacturer, model, version) DO UPDATE SET type = excluded.type
        "#,
    )
    .bind(name)
    .bind(entity.entity_type.as_str())
    .bind(&manufacturer)
    .bind(&model)
    .bind(&version)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    let row = sqlx::query(
        "SELECT * FROM entities WHERE name = ? AND manufacturer = ? AND model = ? AND version = ?",
    )
    .bind(name)
    .bind(&manufacturer)
    .bind(&model)
    .bind(&version)
    .fetch_one(pool)
    .await?;

    Ok((entity_from_row(&row)?, existing.is_none()))
}

/// First entity whose name matches case-insensitively.
pub async fn find_entity_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Entity>> {
    let row = sqlx::query("SELECT * FROM entities WHERE name = ? COLLATE NOCASE ORDER BY id LIMIT 1")
        .bind(name.trim())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entity_from_row).transpose()
}

pub async fn get_entity(pool: &SqlitePool, entity_id: i64) -> Result<Option<Entity>> {
    let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
        .bind(entity_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entity_from_row).transpose()
}

pub async fn list_entities(pool: &SqlitePool, filter: &EntityFilter) -> Result<Vec<Entity>> {
    let q = filter
        .q
        .as_deref()
        .map(|q| format!("%{}%", q.trim().to_lowercase()));
    let rows = sqlx::query(
        r#"
        SELECT * FROM entities
        WHERE (?1 IS NULL OR lower(name) LIKE ?1)
          AND (?2 IS NULL OR type = ?2)
          AND (?3 IS NULL OR manufacturer = ?3 COLLATE NOCASE)
        ORDER BY name, id
        "#,
    )
    .bind(q)
    .bind(filter.entity_type.map(|t| t.as_str()))
    .bind(filter.manufacturer.as_deref().map(str::trim))
    .fetch_all(pool)
    .await?;
    rows.iter().map(entity_from_row).collect()
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let entity_type: String = row.get("type");
    Ok(Entity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: entity_type.parse()?,
        manufacturer: optional_part(row.get("manufacturer")),
        model: optional_part(row.get("model")),
        version: optional_part(row.get("version")),
    })
}

// ============ Facts ============

pub async fn facts_for_entity(pool: &SqlitePool, entity_id: i64) -> Result<Vec<Fact>> {
    let rows = sqlx::query("SELECT * FROM facts WHERE entity_id = ? ORDER BY id")
        .bind(entity_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(fact_from_row).collect())
}

pub async fn facts_for_document(pool: &SqlitePool, document_id: i64) -> Result<Vec<Fact>> {
    let rows = sqlx::query("SELECT * FROM facts WHERE document_id = ? ORDER BY id")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(fact_from_row).collect())
}

/// Entity ids that have at least one fact.
pub async fn entities_with_facts(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar("SELECT DISTINCT entity_id FROM facts ORDER BY entity_id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

fn fact_from_row(row: &SqliteRow) -> Fact {
    let extracted_at: i64 = row.get("extracted_at");
    Fact {
        id: row.get("id"),
        entity_id: row.get("entity_id"),
        document_id: row.get("document_id"),
        metric: row.get("metric"),
        value: row.get("value"),
        unit: row.get("unit"),
        span_excerpt: row.get("span_excerpt"),
        quality_score: row.get("quality_score"),
        extracted_at: from_secs(extracted_at),
        extraction_method: row.get("extraction_method"),
    }
}

// ============ Assumptions ============

/// Create or overwrite a named assumption.
pub async fn set_assumption(pool: &SqlitePool, assumption: &Assumption) -> Result<()> {
    let name = assumption.name.trim();
    if name.is_empty() {
        return Err(PipelineError::invalid("assumption name must not be empty").into());
    }
    if !assumption.value.is_finite() {
        return Err(PipelineError::invalid(format!("assumption '{}' must be finite", name)).into());
    }
    // Known metrics must carry a convertible unit.
    if canonical_metric(name).is_some() {
        normalize(assumption.value, assumption.unit.trim(), name)?;
    }

    sqlx::query(
        r#"
        INSERT INTO assumptions (name, value, unit, document_id, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            value = excluded.value,
            unit = excluded.unit,
            document_id = excluded.document_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(name)
    .bind(assumption.value)
    .bind(assumption.unit.trim())
    .bind(assumption.document_id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_assumptions(pool: &SqlitePool) -> Result<Vec<Assumption>> {
    let rows = sqlx::query("SELECT * FROM assumptions ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Assumption {
            name: row.get("name"),
            value: row.get("value"),
            unit: row.get("unit"),
            document_id: row.get("document_id"),
        })
        .collect())
}

// ============ Scenarios ============

pub async fn create_scenario(pool: &SqlitePool, spec: &ScenarioSpec) -> Result<Scenario> {
    spec.validate()?;
    let created_at = Utc::now().timestamp();
    let spec_json = serde_json::to_string(spec)?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO scenarios (name, use_case, region, spec_json, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(spec.name.trim())
    .bind(spec.use_case.as_str())
    .bind(&spec.region)
    .bind(&spec_json)
    .bind(created_at)
    .fetch_one(pool)
    .await?;

    Ok(Scenario {
        id,
        spec: spec.clone(),
        created_at: from_secs(created_at),
    })
}

pub async fn get_scenario(pool: &SqlitePool, scenario_id: i64) -> Result<Option<Scenario>> {
    let row = sqlx::query("SELECT * FROM scenarios WHERE id = ?")
        .bind(scenario_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(scenario_from_row).transpose()
}

/// Like [`get_scenario`] but a missing row is a `NotFound` error.
pub async fn require_scenario(pool: &SqlitePool, scenario_id: i64) -> Result<Scenario> {
    get_scenario(pool, scenario_id)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("scenario {}", scenario_id)).into())
}

pub async fn list_scenarios(pool: &SqlitePool) -> Result<Vec<Scenario>> {
    let rows = sqlx::query("SELECT * FROM scenarios ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(scenario_from_row).collect()
}

/// Outcome of [`apply_product_preset`].
#[derive(Debug, Clone, Serialize)]
pub struct AppliedProduct {
    pub entity: Entity,
    pub entity_created: bool,
    pub facts_seeded: usize,
    pub scenario: Scenario,
}

/// Register a product entity, replace its catalog facts with the preset's,
/// and store the preset scenario. Extracted facts on the entity are left
/// alone; selection still prefers whichever fact scores higher.
pub async fn apply_product_preset(pool: &SqlitePool, preset: &ProductPreset) -> Result<AppliedProduct> {
    preset.scenario.validate()?;
    let (entity, entity_created) = upsert_entity(pool, &preset.entity).await?;
    let now = Utc::now().timestamp();

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM facts WHERE entity_id = ? AND extraction_method = ?")
        .bind(entity.id)
        .bind(CATALOG_METHOD)
        .execute(&mut *tx)
        .await?;
    for fact in &preset.facts {
        sqlx::query(
            r#"
            INSERT INTO facts (entity_id, document_id, metric, value, unit, span_excerpt, quality_score, extracted_at, extraction_method)
            VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity.id)
        .bind(fact.metric)
        .bind(fact.value)
        .bind(fact.unit)
        .bind(format!("{} {} product table", entity.name, fact.metric))
        .bind(CATALOG_QUALITY)
        .bind(now)
        .bind(CATALOG_METHOD)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let scenario = create_scenario(pool, &preset.scenario).await?;
    info!(
        product = %preset.product,
        entity_id = entity.id,
        scenario_id = scenario.id,
        facts = preset.facts.len(),
        "product preset applied"
    );

    Ok(AppliedProduct {
        entity,
        entity_created,
        facts_seeded: preset.facts.len(),
        scenario,
    })
}

fn scenario_from_row(row: &SqliteRow) -> Result<Scenario> {
    let spec_json: String = row.get("spec_json");
    let created_at: i64 = row.get("created_at");
    Ok(Scenario {
        id: row.get("id"),
        spec: serde_json::from_str(&spec_json)?,
        created_at: from_secs(created_at),
    })
}

// ============ Prices ============

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrice {
    pub entity_id: i64,
    pub value: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub basis: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub document_id: Option<i64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

const PRICE_BASES: &[&str] = &["per_kw", "per_kwh", "per_w", "per_unit"];

pub async fn add_price(pool: &SqlitePool, price: &NewPrice) -> Result<Price> {
    if !(price.value.is_finite() && price.value >= 0.0) {
        return Err(PipelineError::invalid("price value must be a non-negative number").into());
    }
    if !PRICE_BASES.contains(&price.basis.as_str()) {
        return Err(PipelineError::invalid(format!(
            "unknown price basis '{}'; expected one of {}",
            price.basis,
            PRICE_BASES.join(", ")
        ))
        .into());
    }
    if let (Some(from), Some(to)) = (price.valid_from, price.valid_to) {
        if to < from {
            return Err(PipelineError::invalid("valid_to must not precede valid_from").into());
        }
    }
    if get_entity(pool, price.entity_id).await?.is_none() {
        return Err(PipelineError::not_found(format!("entity {}", price.entity_id)).into());
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO prices (entity_id, value, currency, basis, region, valid_from, valid_to, document_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(price.entity_id)
    .bind(price.value)
    .bind(price.currency.trim().to_ascii_uppercase())
    .bind(&price.basis)
    .bind(&price.region)
    .bind(price.valid_from.map(|d| d.timestamp()))
    .bind(price.valid_to.map(|d| d.timestamp()))
    .bind(price.document_id)
    .fetch_one(pool)
    .await?;

    Ok(Price {
        id,
        entity_id: price.entity_id,
        value: price.value,
        currency: price.currency.trim().to_ascii_uppercase(),
        basis: price.basis.clone(),
        region: price.region.clone(),
        valid_from: price.valid_from,
        valid_to: price.valid_to,
        document_id: price.document_id,
    })
}

pub async fn list_prices(pool: &SqlitePool, entity_id: Option<i64>) -> Result<Vec<Price>> {
    let rows = sqlx::query(
        "SELECT * FROM prices WHERE (?1 IS NULL OR entity_id = ?1) ORDER BY entity_id, id",
    )
    .bind(entity_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| {
            let valid_from: Option<i64> = row.get("valid_from");
            let valid_to: Option<i64> = row.get("valid_to");
            Price {
                id: row.get("id"),
                entity_id: row.get("entity_id"),
                value: row.get("value"),
                currency: row.get("currency"),
                basis: row.get("basis"),
                region: row.get("region"),
                valid_from: valid_from.map(from_secs),
                valid_to: valid_to.map(from_secs),
                document_id: row.get("document_id"),
            }
        })
        .collect())
}
