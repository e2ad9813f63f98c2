//! Rank stage: order a scenario's results and persist the two lists.

use anyhow::Result;
use chrono::{DateTime, Utc};
use energy_cost_core::ranking::{self, RankEntry, RankInput, Rankings};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::catalog;
use crate::compute::{self, ComputeFailure};
use crate::db::from_secs;

/// Stored ranking lists for a scenario together with the failures recorded
/// while computing it.
#[derive(Debug, Clone, Serialize)]
pub struct RankingReport {
    pub scenario_id: i64,
    pub lcoe: Vec<RankEntry>,
    pub storage: Vec<RankEntry>,
    pub ranked_at: Option<DateTime<Utc>>,
    pub failures: Vec<ComputeFailure>,
}

/// Rank every result of `scenario_id`, replacing the stored lists.
pub async fn rank_scenario(pool: &SqlitePool, scenario_id: i64) -> Result<Rankings> {
    catalog::require_scenario(pool, scenario_id).await?;
    let results = compute::list_results(pool, scenario_id).await?;
    let inputs: Vec<RankInput> = results
        .into_iter()
        .map(|r| RankInput {
            entity_id: r.entity_id,
            entity_name: r.entity_name,
            lcoe_usd_per_kwh: r.lcoe_usd_per_kwh,
            lcos_usd_per_kwh: r.lcos_usd_per_kwh,
            confidence: r.confidence,
        })
        .collect();
    let rankings = ranking::rank(&inputs);

    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM rankings WHERE scenario_id = ?")
        .bind(scenario_id)
        .execute(&mut *tx)
        .await?;
    for (list, entries) in [("lcoe", &rankings.lcoe), ("storage", &rankings.storage)] {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO rankings (scenario_id, list, rank, entity_id, value, confidence, ranked_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(scenario_id)
            .bind(list)
            .bind(entry.rank as i64)
            .bind(entry.entity_id)
            .bind(entry.value)
            .bind(entry.confidence)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;

    info!(
        scenario_id,
        lcoe = rankings.lcoe.len(),
        storage = rankings.storage.len(),
        "ranked"
    );
    Ok(rankings)
}

pub async fn get_rankings(pool: &SqlitePool, scenario_id: i64) -> Result<RankingReport> {
    catalog::require_scenario(pool, scenario_id).await?;
    let rows = sqlx::query(
        r#"
        SELECT k.*, e.name AS entity_name
        FROM rankings k JOIN entities e ON e.id = k.entity_id
        WHERE k.scenario_id = ?
        ORDER BY k.list, k.rank
        "#,
    )
    .bind(scenario_id)
    .fetch_all(pool)
    .await?;

    let mut report = RankingReport {
        scenario_id,
        lcoe: Vec::new(),
        storage: Vec::new(),
        ranked_at: None,
        failures: compute::list_failures(pool, scenario_id).await?,
    };
    for row in &rows {
        let list: String = row.get("list");
        let rank: i64 = row.get("rank");
        let ranked_at: i64 = row.get("ranked_at");
        report.ranked_at = Some(from_secs(ranked_at));
        let entry = RankEntry {
            rank: rank as u32,
            entity_id: row.get("entity_id"),
            entity_name: row.get("entity_name"),
            value: row.get("value"),
            confidence: row.get("confidence"),
        };
        match list.as_str() {
            "lcoe" => report.lcoe.push(entry),
            _ => report.storage.push(entry),
        }
    }
    Ok(report)
}
