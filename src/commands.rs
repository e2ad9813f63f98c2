//! CLI command implementations.
//!
//! Each `run_*` function opens the database, calls into the library and
//! prints a human-readable summary to stdout. Structured reports (status
//! snapshots, breakdowns) are printed as pretty JSON.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use energy_cost_core::models::{Assumption, EntityType, JobState, NewEntity, ScenarioSpec, UseCase};
use energy_cost_core::scenarios::{self, Product, ProductOptions};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::admin::AdminPlane;
use crate::catalog::{self, EntityFilter, NewPrice};
use crate::compute;
use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::pipeline::Pipeline;
use crate::queue;
use crate::rank;
use crate::sources;

async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}

async fn open_pipeline(config: &Config) -> Result<Pipeline> {
    let pool = open(config).await?;
    Pipeline::from_config(pool, Arc::new(config.clone()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cli_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("cli-{}", &id[..8])
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

// ============ Pipeline ============

async fn drain(pipeline: &Pipeline) -> Result<()> {
    let processed = pipeline.run_once(&cli_worker_id()).await?;
    for p in &processed {
        let state = p.state.map(|s| s.as_str()).unwrap_or("lease_lost");
        println!("  {:<12} {:<60} {}", p.stage.as_str(), p.key, state);
    }
    println!("processed {} job(s)", processed.len());
    Ok(())
}

/// Run the worker pool, or drain due jobs once with `once`.
pub async fn run_work(config: &Config, once: bool) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    if once {
        return drain(&pipeline).await;
    }

    let (tx, rx) = watch::channel(false);
    let pipeline = Arc::new(pipeline);
    let workers = tokio::spawn(pipeline.clone().run_workers(rx));
    println!(
        "workers running ({}); press Ctrl-C to stop",
        config.pipeline.workers
    );
    tokio::signal::ctrl_c().await?;
    let _ = tx.send(true);
    workers.await??;
    println!("workers stopped");
    Ok(())
}

pub async fn run_refresh(config: &Config) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let queued = pipeline.refresh().await?;
    println!("queued {} stale source(s) for fetch", queued);
    Ok(())
}

pub async fn run_ingest_search(config: &Config, queries: &[String], wait: bool) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let queued = pipeline.enqueue_search(queries).await?;
    println!("queued {} seed search(es)", queued);
    if wait {
        drain(&pipeline).await?;
    }
    Ok(())
}

pub async fn run_ingest_crawl(config: &Config, urls: &[String], wait: bool) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let report = pipeline.crawl(urls).await?;
    println!(
        "registered {} new source(s), {} already known, {} fetch(es) queued",
        report.registered, report.already_known, report.queued
    );
    if wait {
        drain(&pipeline).await?;
    }
    Ok(())
}

pub async fn run_extract(config: &Config, wait: bool) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let queued = pipeline.request_extract().await?;
    println!("queued extraction for {} document(s)", queued);
    if wait {
        drain(&pipeline).await?;
    }
    Ok(())
}

pub async fn run_compute(config: &Config, scenario_id: i64, wait: bool) -> Result<()> {
    let pipeline = open_pipeline(config).await?;
    let entities = pipeline.request_compute(scenario_id).await?;
    println!(
        "queued compute for {} entit{} of scenario {}",
        entities,
        if entities == 1 { "y" } else { "ies" },
        scenario_id
    );
    if wait {
        drain(&pipeline).await?;
    }
    Ok(())
}

pub async fn run_rank(config: &Config, scenario_id: i64) -> Result<()> {
    let pool = open(config).await?;
    rank::rank_scenario(&pool, scenario_id).await?;
    let report = rank::get_rankings(&pool, scenario_id).await?;

    println!("--- LCOE (USD/kWh) ---");
    for e in &report.lcoe {
        println!(
            "{:>3}. {:<40} {:>10.4}  (confidence {:.2})",
            e.rank, e.entity_name, e.value, e.confidence
        );
    }
    println!("--- Storage LCOS (USD/kWh) ---");
    for e in &report.storage {
        println!(
            "{:>3}. {:<40} {:>10.4}  (confidence {:.2})",
            e.rank, e.entity_name, e.value, e.confidence
        );
    }
    if !report.failures.is_empty() {
        println!("--- Failures ---");
        for f in &report.failures {
            println!("entity {}: {} ({})", f.entity_id, f.message, f.kind);
        }
    }
    Ok(())
}

pub async fn run_sensitivity(
    config: &Config,
    scenario_id: i64,
    entity_id: i64,
    variation: Option<f64>,
) -> Result<()> {
    let pool = open(config).await?;
    let report = compute::sensitivity(&pool, scenario_id, entity_id, variation).await?;
    println!(
        "{:<24} {:>12} {:>12} {:>12} {:>10}",
        "parameter", "low", "base", "high", "elasticity"
    );
    for row in &report.rows {
        println!(
            "{:<24} {:>12.4} {:>12.4} {:>12.4} {:>10.3}",
            row.parameter, row.low_result, row.base_result, row.high_result, row.elasticity
        );
    }
    Ok(())
}

pub async fn run_jobs(config: &Config, state: Option<&str>, limit: i64) -> Result<()> {
    let pool = open(config).await?;
    let state = state.map(str::parse::<JobState>).transpose()?;
    let summary = queue::summary(&pool, state, limit).await?;
    for (stage, states) in &summary.counts {
        let parts: Vec<String> = states.iter().map(|(s, n)| format!("{}={}", s, n)).collect();
        println!("{:<12} {}", stage, parts.join(" "));
    }
    if !summary.jobs.is_empty() {
        println!();
    }
    for job in &summary.jobs {
        println!(
            "#{:<5} {:<12} {:<16} attempts={} {}",
            job.id,
            job.stage.as_str(),
            job.state.as_str(),
            job.attempts,
            job.key
        );
        if let Some(err) = &job.last_error {
            println!("       error: {}", err);
        }
        if let Some(warning) = &job.warning {
            println!("       warning: {}", warning);
        }
    }
    Ok(())
}

// ============ Catalog ============

pub async fn run_entity_add(config: &Config, entity: NewEntity) -> Result<()> {
    let pool = open(config).await?;
    let (entity, created) = catalog::upsert_entity(&pool, &entity).await?;
    println!(
        "{} entity {} ({}, {})",
        if created { "created" } else { "updated" },
        entity.id,
        entity.name,
        entity.entity_type
    );
    Ok(())
}

pub async fn run_entity_list(
    config: &Config,
    q: Option<String>,
    entity_type: Option<&str>,
    manufacturer: Option<String>,
) -> Result<()> {
    let pool = open(config).await?;
    let filter = EntityFilter {
        q,
        entity_type: entity_type.map(str::parse::<EntityType>).transpose()?,
        manufacturer,
    };
    for e in catalog::list_entities(&pool, &filter).await? {
        println!(
            "{:<5} {:<9} {:<40} {}",
            e.id,
            e.entity_type.as_str(),
            e.name,
            e.manufacturer.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_assumption_set(config: &Config, name: &str, value: f64, unit: &str) -> Result<()> {
    let pool = open(config).await?;
    catalog::set_assumption(
        &pool,
        &Assumption {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            document_id: None,
        },
    )
    .await?;
    println!("{} = {} {}", name, value, unit);
    Ok(())
}

pub async fn run_assumption_list(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    for a in catalog::list_assumptions(&pool).await? {
        println!("{:<24} {} {}", a.name, a.value, a.unit);
    }
    Ok(())
}

pub async fn run_scenario_create(config: &Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read scenario file: {}", file.display()))?;
    let spec: ScenarioSpec =
        serde_json::from_str(&content).with_context(|| "Failed to parse scenario file")?;
    let pool = open(config).await?;
    let scenario = catalog::create_scenario(&pool, &spec).await?;
    println!("created scenario {} ({})", scenario.id, scenario.spec.name);
    Ok(())
}

pub async fn run_scenario_preset(
    config: &Config,
    use_case: &str,
    region: &str,
    name: Option<String>,
) -> Result<()> {
    let use_case: UseCase = use_case.parse()?;
    let mut spec = scenarios::preset(use_case, region);
    if let Some(name) = name {
        spec.name = name;
    }
    let pool = open(config).await?;
    let scenario = catalog::create_scenario(&pool, &spec).await?;
    println!("created scenario {} ({})", scenario.id, scenario.spec.name);
    Ok(())
}

pub async fn run_scenario_product(
    config: &Config,
    product: &str,
    region: &str,
    options: &ProductOptions,
) -> Result<()> {
    let product: Product = product.parse()?;
    let preset = scenarios::product_preset(product, region, options)?;
    let pool = open(config).await?;
    let applied = catalog::apply_product_preset(&pool, &preset).await?;
    println!(
        "{} entity {} ({}), seeded {} facts",
        if applied.entity_created { "created" } else { "updated" },
        applied.entity.id,
        applied.entity.name,
        applied.facts_seeded
    );
    println!(
        "created scenario {} ({})",
        applied.scenario.id, applied.scenario.spec.name
    );
    Ok(())
}

pub async fn run_scenario_list(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    for s in catalog::list_scenarios(&pool).await? {
        println!(
            "{:<5} {:<32} {:<12} {}",
            s.id,
            s.spec.name,
            s.spec.use_case.as_str(),
            s.spec.region
        );
    }
    Ok(())
}

pub async fn run_price_add(config: &Config, price: NewPrice) -> Result<()> {
    let pool = open(config).await?;
    let price = catalog::add_price(&pool, &price).await?;
    println!(
        "recorded price {} for entity {}: {} {} {}",
        price.id, price.entity_id, price.value, price.currency, price.basis
    );
    Ok(())
}

pub async fn run_price_list(config: &Config, entity_id: Option<i64>) -> Result<()> {
    let pool = open(config).await?;
    for p in catalog::list_prices(&pool, entity_id).await? {
        println!(
            "{:<5} entity={:<5} {:>12.2} {} {:<8} {}",
            p.id,
            p.entity_id,
            p.value,
            p.currency,
            p.basis,
            p.region.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_source_list(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    for s in sources::list_sources(&pool).await? {
        let status = if s.robots_ok { "OK" } else { "DENIED" };
        println!("{:<5} {:<7} {}", s.id, status, s.url);
        if let Some(reason) = &s.deny_reason {
            println!("      reason: {}", reason);
        }
    }
    Ok(())
}

pub async fn run_source_reset(config: &Config, url: &str) -> Result<()> {
    let pool = open(config).await?;
    if sources::reset_source(&pool, url).await? {
        println!("source re-enabled: {}", url);
    } else {
        anyhow::bail!("unknown source: {}", url);
    }
    Ok(())
}

// ============ Admin ============

async fn open_admin(config: &Config) -> Result<AdminPlane> {
    let pool = open(config).await?;
    Ok(AdminPlane::new(pool, Arc::new(config.clone())))
}

fn actor_or_default(config: &Config, actor: Option<String>) -> String {
    actor.unwrap_or_else(|| config.admin.default_actor.clone())
}

pub async fn run_admin_scale(
    config: &Config,
    target: &str,
    replicas: i64,
    actor: Option<String>,
) -> Result<()> {
    let admin = open_admin(config).await?;
    let actor = actor_or_default(config, actor);
    let result = admin.scale_worker(&actor, target, replicas).await?;
    println!(
        "{} scaled to {} (generation {})",
        result.target, result.replicas, result.generation
    );
    Ok(())
}

pub async fn run_admin_db(config: &Config, action: &str, actor: Option<String>) -> Result<()> {
    let admin = open_admin(config).await?;
    let actor = actor_or_default(config, actor);
    let result = admin.db_control(&actor, action).await?;
    print_json(&result)
}

pub async fn run_admin_db_status(config: &Config) -> Result<()> {
    let admin = open_admin(config).await?;
    print_json(&admin.db_status().await?)
}

pub async fn run_admin_server_status(config: &Config) -> Result<()> {
    let admin = open_admin(config).await?;
    print_json(&admin.server_status().await?)
}

pub async fn run_admin_audit(config: &Config, limit: Option<i64>) -> Result<()> {
    let admin = open_admin(config).await?;
    for r in admin.audit_log(limit).await? {
        let status = r.result["status"].as_str().unwrap_or("?");
        println!(
            "#{:<5} {} {:<20} {:<16} {:<10} {}",
            r.id,
            r.ts.format("%Y-%m-%dT%H:%M:%SZ"),
            r.actor,
            r.action,
            r.target,
            status
        );
    }
    Ok(())
}
