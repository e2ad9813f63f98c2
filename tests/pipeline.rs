//! End-to-end pipeline tests against fake search and fetch collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use energy_cost::config::Config;
use energy_cost::core::extractor::RuleExtractor;
use energy_cost::core::models::{Assumption, EntityType, JobState, NewEntity, Stage, UseCase};
use energy_cost::core::{scenarios, PipelineError};
use energy_cost::fetch::{FetchedPage, Fetcher, SeedSearch};
use energy_cost::pipeline::Pipeline;
use energy_cost::{catalog, compute, db, migrate, queue, rank, sources};
use sqlx::SqlitePool;
use tempfile::TempDir;

const BENCHMARK_URL: &str = "https://solar.example/benchmark";
const BLOCKED_URL: &str = "https://blocked.example/private";
const FLAKY_URL: &str = "https://flaky.example/report";
const GARBLED_URL: &str = "https://noise.example/scan";

struct FakeSearch {
    urls: Vec<String>,
}

#[async_trait]
impl SeedSearch for FakeSearch {
    async fn search(&self, _query: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self.urls.clone())
    }
}

#[derive(Default)]
struct FakeFetcher {
    pages: HashMap<String, FetchedPage>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    fn with_page(mut self, url: &str, title: &str, body: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            FetchedPage {
                url: url.to_string(),
                title: Some(title.to_string()),
                published_at: None,
                body: body.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match url {
            BLOCKED_URL => Err(PipelineError::FetchDenied {
                url: url.to_string(),
                reason: "robots.txt disallows /private".to_string(),
            }),
            FLAKY_URL => Err(PipelineError::TransientIo("connection reset".to_string())),
            _ => self
                .pages
                .get(url)
                .cloned()
                .ok_or_else(|| PipelineError::Terminal(format!("404 for {}", url))),
        }
    }
}

fn benchmark_fetcher() -> FakeFetcher {
    FakeFetcher::default()
        .with_page(
            BENCHMARK_URL,
            "Utility-scale PV cost benchmark",
            "Installed cost is $950/kW with fixed O&M of $18/kW-yr. \
             Panels show 0.5% per year degradation and a useful life of 30 years.",
        )
        .with_page(GARBLED_URL, "Scan", "%%%% #### @@@@ ---- ==== ++++ ~~~~ a1 ////")
}

struct TestEnv {
    _tmp: TempDir,
    pool: SqlitePool,
    pipeline: Pipeline,
}

async fn setup_with(search_urls: &[&str], fetcher: FakeFetcher) -> (TestEnv, Arc<FakeFetcher>) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("data/ecost.sqlite"));
    config.pipeline.backoff_base_ms = 0;
    config.pipeline.backoff_max_ms = 0;
    config.pipeline.max_attempts = 3;

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let fetcher = Arc::new(fetcher);
    let pipeline = Pipeline::new(
        pool.clone(),
        Arc::new(config),
        Arc::new(FakeSearch {
            urls: search_urls.iter().map(|u| u.to_string()).collect(),
        }),
        fetcher.clone(),
        Arc::new(RuleExtractor::new()),
    );
    (
        TestEnv {
            _tmp: tmp,
            pool,
            pipeline,
        },
        fetcher,
    )
}

async fn document_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn set_rates(pool: &SqlitePool) {
    for (name, value) in [("discount_rate", 7.0), ("inflation_rate", 2.5)] {
        catalog::set_assumption(
            pool,
            &Assumption {
                name: name.to_string(),
                value,
                unit: "%".to_string(),
                document_id: None,
            },
        )
        .await
        .unwrap();
    }
}

async fn stored_results(pool: &SqlitePool, scenario_id: i64, entity_id: i64) -> Vec<(f64, String)> {
    sqlx::query_as(
        "SELECT lcoe_usd_per_kwh, breakdown_json FROM results WHERE scenario_id = ? AND entity_id = ?",
    )
    .bind(scenario_id)
    .bind(entity_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

// ============ Seed search ============

#[tokio::test]
async fn test_seed_search_registers_unique_sources() {
    let (env, _) = setup_with(
        &[BENCHMARK_URL, "https://SOLAR.example/benchmark", "not a url"],
        benchmark_fetcher(),
    )
    .await;

    assert_eq!(env.pipeline.enqueue_search(&["pv cost".to_string()]).await.unwrap(), 1);
    // Same query while pending: no new job.
    assert_eq!(env.pipeline.enqueue_search(&["pv cost".to_string()]).await.unwrap(), 0);

    let processed = env.pipeline.run_once("test").await.unwrap();
    assert!(processed
        .iter()
        .all(|p| p.state == Some(JobState::Succeeded)));

    let all = sources::list_sources(&env.pool).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].url, BENCHMARK_URL);

    let search_job = queue::get_job(&env.pool, Stage::SeedSearch, "pv cost")
        .await
        .unwrap()
        .unwrap();
    assert!(search_job.warning.unwrap().contains("not a url"));

    // A repeat search finds nothing new.
    env.pipeline.enqueue_search(&["pv cost".to_string()]).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    assert_eq!(sources::list_sources(&env.pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_blank_queries_are_rejected() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let err = env
        .pipeline
        .enqueue_search(&["solar".to_string(), "   ".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidRequest(_))
    ));
    assert!(queue::list_jobs(&env.pool, None, 10).await.unwrap().is_empty());
}

// ============ Fetch ============

#[tokio::test]
async fn test_crawl_with_invalid_url_writes_nothing() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let result = env
        .pipeline
        .crawl(&[BENCHMARK_URL.to_string(), "ftp://files.example/x".to_string()])
        .await;
    assert!(result.is_err());
    assert!(sources::list_sources(&env.pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refetch_of_unchanged_content_creates_no_document() {
    let (env, fetcher) = setup_with(&[], benchmark_fetcher()).await;

    let report = env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    assert_eq!(report.registered, 1);
    assert_eq!(report.queued, 1);
    env.pipeline.run_once("test").await.unwrap();
    assert_eq!(document_count(&env.pool).await, 1);

    let report = env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    assert_eq!(report.already_known, 1);
    let processed = env.pipeline.run_once("test").await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].stage, Stage::Fetch);

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(document_count(&env.pool).await, 1);
    let source = sources::get_source_by_url(&env.pool, BENCHMARK_URL)
        .await
        .unwrap()
        .unwrap();
    assert!(source.last_crawled.is_some());
    assert!(source.content_hash.is_some());
}

#[tokio::test]
async fn test_fetch_denied_disables_source() {
    let (env, fetcher) = setup_with(&[], benchmark_fetcher()).await;

    env.pipeline.crawl(&[BLOCKED_URL.to_string()]).await.unwrap();
    let processed = env.pipeline.run_once("test").await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].state, Some(JobState::FailedTerminal));

    let source = sources::get_source_by_url(&env.pool, BLOCKED_URL)
        .await
        .unwrap()
        .unwrap();
    assert!(!source.robots_ok);
    assert!(source.deny_reason.unwrap().contains("robots.txt"));

    // Denied sources are never queued again.
    let report = env.pipeline.crawl(&[BLOCKED_URL.to_string()]).await.unwrap();
    assert_eq!(report.queued, 0);
    assert!(env.pipeline.run_once("test").await.unwrap().is_empty());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    assert!(sources::reset_source(&env.pool, BLOCKED_URL).await.unwrap());
    let source = sources::get_source_by_url(&env.pool, BLOCKED_URL)
        .await
        .unwrap()
        .unwrap();
    assert!(source.robots_ok);
}

#[tokio::test]
async fn test_transient_failures_retry_until_terminal() {
    let (env, fetcher) = setup_with(&[], benchmark_fetcher()).await;

    env.pipeline.crawl(&[FLAKY_URL.to_string()]).await.unwrap();
    let processed = env.pipeline.run_once("test").await.unwrap();

    let states: Vec<_> = processed.iter().map(|p| p.state).collect();
    assert_eq!(
        states,
        vec![
            Some(JobState::FailedRetryable),
            Some(JobState::FailedRetryable),
            Some(JobState::FailedTerminal),
        ]
    );
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

    let job = queue::get_job(&env.pool, Stage::Fetch, FLAKY_URL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().starts_with("transient_io"));
}

#[tokio::test]
async fn test_refresh_queues_only_stale_allowed_sources() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let unvisited = "https://new.example/unvisited";

    env.pipeline
        .crawl(&[BENCHMARK_URL.to_string(), BLOCKED_URL.to_string()])
        .await
        .unwrap();
    env.pipeline.run_once("test").await.unwrap();
    sources::register_source(&env.pool, unvisited).await.unwrap();

    // Never-fetched sources are stale; a fresh fetch and a denied source are not.
    assert_eq!(env.pipeline.refresh().await.unwrap(), 1);
    let job = queue::get_job(&env.pool, Stage::Fetch, unvisited)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Pending);

    let freshness = env.pipeline.config().pipeline.freshness_hours as i64;
    let old = (chrono::Utc::now() - chrono::Duration::hours(freshness + 1)).timestamp();
    sqlx::query("UPDATE sources SET last_crawled = ?")
        .bind(old)
        .execute(&env.pool)
        .await
        .unwrap();

    // The benchmark is now past the threshold; the blocked source stays skipped
    // and the unvisited one is already queued.
    assert_eq!(env.pipeline.refresh().await.unwrap(), 1);
    let job = queue::get_job(&env.pool, Stage::Fetch, BENCHMARK_URL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Pending);
    let blocked = queue::get_job(&env.pool, Stage::Fetch, BLOCKED_URL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocked.state, JobState::FailedTerminal);

    // Just inside the window counts as fresh.
    let recent = (chrono::Utc::now() - chrono::Duration::hours(freshness - 1)).timestamp();
    sqlx::query("UPDATE sources SET last_crawled = ?")
        .bind(recent)
        .execute(&env.pool)
        .await
        .unwrap();
    let stale = sources::stale_sources(&env.pool, chrono::Duration::hours(freshness))
        .await
        .unwrap();
    assert!(stale.is_empty());
}

#[tokio::test]
async fn test_source_denied_between_retries_is_cancelled() {
    let (env, fetcher) = setup_with(&[], benchmark_fetcher()).await;

    env.pipeline.crawl(&[FLAKY_URL.to_string()]).await.unwrap();
    let first = env.pipeline.process_next("test").await.unwrap().unwrap();
    assert_eq!(first.state, Some(JobState::FailedRetryable));

    let source = sources::get_source_by_url(&env.pool, FLAKY_URL)
        .await
        .unwrap()
        .unwrap();
    sources::deny_source(&env.pool, source.id, "operator request")
        .await
        .unwrap();

    let processed = env.pipeline.run_once("test").await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].state, Some(JobState::Cancelled));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    let job = queue::get_job(&env.pool, Stage::Fetch, FLAKY_URL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.last_error.unwrap().contains("operator request"));
}

// ============ Extract + normalize ============

#[tokio::test]
async fn test_fetched_document_becomes_scored_facts() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;

    env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    let processed = env.pipeline.run_once("test").await.unwrap();
    let stages: Vec<_> = processed.iter().map(|p| p.stage).collect();
    assert_eq!(stages, vec![Stage::Fetch, Stage::Extract, Stage::Normalize]);

    let entity = catalog::find_entity_by_name(&env.pool, "Utility-scale PV cost benchmark")
        .await
        .unwrap()
        .expect("entity registered from the document title");
    assert_eq!(entity.entity_type, EntityType::Pv);

    let facts = catalog::facts_for_entity(&env.pool, entity.id).await.unwrap();
    let metrics: Vec<&str> = facts.iter().map(|f| f.metric.as_str()).collect();
    for metric in ["capex_per_kw", "om_per_kw_year", "degradation_rate", "useful_life_years"] {
        assert!(metrics.contains(&metric), "missing {} in {:?}", metric, metrics);
    }
    assert!(facts
        .iter()
        .all(|f| (0.0..=1.0).contains(&f.quality_score) && f.document_id.is_some()));

    // capex becomes a price observation too.
    let prices = catalog::list_prices(&env.pool, Some(entity.id)).await.unwrap();
    assert!(prices.iter().any(|p| p.basis == "per_kw" && p.value == 950.0));

    // Nothing left to extract.
    assert_eq!(env.pipeline.request_extract().await.unwrap(), 0);
}

#[tokio::test]
async fn test_garbled_document_is_skipped_with_warning() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;

    env.pipeline.crawl(&[GARBLED_URL.to_string()]).await.unwrap();
    let processed = env.pipeline.run_once("test").await.unwrap();
    let stages: Vec<_> = processed.iter().map(|p| p.stage).collect();
    assert_eq!(stages, vec![Stage::Fetch, Stage::Extract]);

    let job = queue::get_job(&env.pool, Stage::Extract, "doc:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.warning.unwrap().contains("garbled"));
}

// ============ Compute + rank ============

#[tokio::test]
async fn test_compute_isolates_entities_missing_data() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    set_rates(&env.pool).await;

    env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    let complete = catalog::find_entity_by_name(&env.pool, "Utility-scale PV cost benchmark")
        .await
        .unwrap()
        .unwrap();

    // Same data minus the capital cost.
    let (partial, _) = catalog::upsert_entity(
        &env.pool,
        &NewEntity {
            name: "Budget Module".to_string(),
            entity_type: EntityType::Pv,
            manufacturer: None,
            model: None,
            version: None,
        },
    )
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO facts (entity_id, document_id, metric, value, unit, span_excerpt, quality_score, extracted_at, extraction_method)
        SELECT ?, document_id, metric, value, unit, span_excerpt, quality_score, extracted_at, extraction_method
        FROM facts WHERE entity_id = ? AND metric != 'capex_per_kw'
        "#,
    )
    .bind(partial.id)
    .bind(complete.id)
    .execute(&env.pool)
    .await
    .unwrap();

    let scenario = catalog::create_scenario(&env.pool, &scenarios::preset(UseCase::Utility, "TX"))
        .await
        .unwrap();
    assert_eq!(env.pipeline.request_compute(scenario.id).await.unwrap(), 2);
    env.pipeline.run_once("test").await.unwrap();

    let results = compute::list_results(&env.pool, scenario.id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entity_id, complete.id);
    let lcoe = results[0].lcoe_usd_per_kwh.unwrap();
    assert!(lcoe > 0.0 && lcoe.is_finite());

    let failures = compute::list_failures(&env.pool, scenario.id).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].entity_id, partial.id);
    assert_eq!(failures[0].kind, "insufficient_data");
    assert!(failures[0].message.contains("capex_per_kw"));

    let report = rank::get_rankings(&env.pool, scenario.id).await.unwrap();
    assert_eq!(report.lcoe.len(), 1);
    assert_eq!(report.lcoe[0].rank, 1);
    assert_eq!(report.lcoe[0].entity_id, complete.id);
    assert!(report.storage.is_empty());
    assert!(report.ranked_at.is_some());
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn test_compute_without_rates_records_missing_assumption() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    let entity = catalog::find_entity_by_name(&env.pool, "Utility-scale PV cost benchmark")
        .await
        .unwrap()
        .unwrap();

    let scenario =
        catalog::create_scenario(&env.pool, &scenarios::preset(UseCase::Residential, "CA"))
            .await
            .unwrap();
    let err = compute::compute_pair(&env.pool, scenario.id, entity.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingAssumption { .. })
    ));
    let failures = compute::list_failures(&env.pool, scenario.id).await.unwrap();
    assert_eq!(failures[0].kind, "missing_assumption");

    // Setting the rates and recomputing clears the failure.
    set_rates(&env.pool).await;
    compute::compute_pair(&env.pool, scenario.id, entity.id)
        .await
        .unwrap();
    assert!(compute::list_failures(&env.pool, scenario.id)
        .await
        .unwrap()
        .is_empty());

    let report = compute::sensitivity(&env.pool, scenario.id, entity.id, None)
        .await
        .unwrap();
    assert_eq!(report.variation, 0.2);
    assert!(!report.rows.is_empty());
}

#[tokio::test]
async fn test_recompute_is_deterministic() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    set_rates(&env.pool).await;
    env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    let entity = catalog::find_entity_by_name(&env.pool, "Utility-scale PV cost benchmark")
        .await
        .unwrap()
        .unwrap();
    let scenario = catalog::create_scenario(&env.pool, &scenarios::preset(UseCase::Utility, "AZ"))
        .await
        .unwrap();

    let first = compute::compute_pair(&env.pool, scenario.id, entity.id)
        .await
        .unwrap();
    let after_first = stored_results(&env.pool, scenario.id, entity.id).await;
    let second = compute::compute_pair(&env.pool, scenario.id, entity.id)
        .await
        .unwrap();
    let after_second = stored_results(&env.pool, scenario.id, entity.id).await;

    assert_eq!(first.lcoe_usd_per_kwh, second.lcoe_usd_per_kwh);
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_first[0].0, after_second[0].0);
    assert_eq!(after_first[0].1, after_second[0].1);
}

#[tokio::test]
async fn test_failed_recompute_drops_stale_result_and_reranks() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    set_rates(&env.pool).await;
    env.pipeline.crawl(&[BENCHMARK_URL.to_string()]).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    let entity = catalog::find_entity_by_name(&env.pool, "Utility-scale PV cost benchmark")
        .await
        .unwrap()
        .unwrap();
    let scenario = catalog::create_scenario(&env.pool, &scenarios::preset(UseCase::Utility, "TX"))
        .await
        .unwrap();

    env.pipeline.request_compute(scenario.id).await.unwrap();
    env.pipeline.run_once("test").await.unwrap();
    let report = rank::get_rankings(&env.pool, scenario.id).await.unwrap();
    assert_eq!(report.lcoe.len(), 1);

    sqlx::query("DELETE FROM facts WHERE entity_id = ? AND metric = 'capex_per_kw'")
        .bind(entity.id)
        .execute(&env.pool)
        .await
        .unwrap();
    env.pipeline.request_compute(scenario.id).await.unwrap();
    let processed = env.pipeline.run_once("test").await.unwrap();
    assert!(processed
        .iter()
        .any(|p| p.stage == Stage::Rank && p.state == Some(JobState::Succeeded)));

    assert!(compute::list_results(&env.pool, scenario.id)
        .await
        .unwrap()
        .is_empty());
    let report = rank::get_rankings(&env.pool, scenario.id).await.unwrap();
    assert!(report.lcoe.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "insufficient_data");
}

#[tokio::test]
async fn test_product_preset_seeds_catalog_facts() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    set_rates(&env.pool).await;

    let options = scenarios::ProductOptions {
        quantity: Some(2.0),
        ..Default::default()
    };
    let preset = scenarios::product_preset(scenarios::Product::Powerwall3, "CA", &options).unwrap();
    let applied = catalog::apply_product_preset(&env.pool, &preset).await.unwrap();
    assert!(applied.entity_created);
    assert_eq!(applied.entity.entity_type, EntityType::Battery);
    assert_eq!(applied.scenario.spec.load_profile.storage_kwh, 27.0);

    let facts = catalog::facts_for_entity(&env.pool, applied.entity.id)
        .await
        .unwrap();
    assert_eq!(facts.len(), applied.facts_seeded);
    assert!(facts.iter().all(|f| f.extraction_method == "catalog" && f.document_id.is_none()));

    let computed = compute::compute_pair(&env.pool, applied.scenario.id, applied.entity.id)
        .await
        .unwrap();
    let lcos = computed.lcos_usd_per_kwh.unwrap();
    assert!(lcos > 0.0 && lcos.is_finite());
    assert!(computed.lcoe_usd_per_kwh.is_none());

    // Re-applying replaces the catalog facts rather than stacking them.
    let again = catalog::apply_product_preset(&env.pool, &preset).await.unwrap();
    assert!(!again.entity_created);
    assert_eq!(again.entity.id, applied.entity.id);
    assert_ne!(again.scenario.id, applied.scenario.id);
    let facts = catalog::facts_for_entity(&env.pool, applied.entity.id)
        .await
        .unwrap();
    assert_eq!(facts.len(), applied.facts_seeded);
}

#[tokio::test]
async fn test_compute_unknown_scenario_is_not_found() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let err = env.pipeline.request_compute(999).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NotFound(_))
    ));
}

// ============ Queue ============

#[tokio::test]
async fn test_rerun_requested_while_running_is_not_lost() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let payload = serde_json::json!({ "scenario_id": 1 });

    assert!(queue::enqueue(&env.pool, Stage::Rank, "scenario:1", &payload).await.unwrap());
    let job = queue::claim(&env.pool, "w1", 60_000, 3).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Running);

    // Enqueue while running flags a rerun instead of creating a row.
    assert!(!queue::enqueue(&env.pool, Stage::Rank, "scenario:1", &payload).await.unwrap());
    let state = queue::complete(&env.pool, job.id, "w1", None).await.unwrap();
    assert_eq!(state, Some(JobState::Pending));

    let again = queue::claim(&env.pool, "w1", 60_000, 3).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    let state = queue::complete(&env.pool, again.id, "w1", None).await.unwrap();
    assert_eq!(state, Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_lost_lease_cannot_complete() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let payload = serde_json::json!({ "scenario_id": 1 });

    queue::enqueue(&env.pool, Stage::Rank, "scenario:1", &payload).await.unwrap();
    let job = queue::claim(&env.pool, "w1", 60_000, 3).await.unwrap().unwrap();
    assert_eq!(queue::complete(&env.pool, job.id, "w2", None).await.unwrap(), None);
    assert!(queue::claim(&env.pool, "w2", 60_000, 3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_crashed_job_goes_terminal_after_max_attempts() {
    let (env, _) = setup_with(&[], benchmark_fetcher()).await;
    let payload = serde_json::json!({ "scenario_id": 1 });
    queue::enqueue(&env.pool, Stage::Rank, "scenario:1", &payload).await.unwrap();

    // A worker that dies mid-job leaves an expired lease behind.
    for attempt in 1..=3 {
        let job = queue::claim(&env.pool, "w1", -1, 3).await.unwrap().unwrap();
        assert_eq!(job.attempts, attempt);
    }
    assert!(queue::claim(&env.pool, "w2", 60_000, 3).await.unwrap().is_none());

    let job = queue::get_job(&env.pool, Stage::Rank, "scenario:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::FailedTerminal);
    assert_eq!(job.attempts, 3);
    assert!(job.lease_owner.is_none());
    assert!(job.last_error.unwrap().contains("lease expired"));
}
