//! Pipeline orchestrator.
//!
//! Drives the stage DAG over the persisted job queue:
//!
//! ```text
//! seed_search → fetch → extract → normalize
//!                                 compute → rank
//! ```
//!
//! | Stage | Key | Enqueues on success |
//! |-------|-----|---------------------|
//! | seed_search | query | fetch per robots-allowed URL |
//! | fetch | URL | extract, only when the content changed |
//! | extract | `doc:<id>` | normalize |
//! | normalize | `doc:<id>` | |
//! | compute | `<scenario_id>:<entity_id>` | rank |
//! | rank | `scenario:<id>` | |
//!
//! Handlers never talk to each other directly; a successor is queued only
//! after its predecessor succeeded, which orders stages per key. The worker
//! pool in [`Pipeline::run_workers`] is sized by `pipeline.workers` and
//! gated by the `worker` replica count held by the admin plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use energy_cost_core::extractor::{Extractor, RuleExtractor};
use energy_cost_core::models::{JobState, Stage};
use energy_cost_core::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::admin;
use crate::compute;
use crate::config::Config;
use crate::extract;
use crate::fetch::{Fetcher, HttpFetcher, SeedSearch, StaticSeedSearch};
use crate::queue::{self, Job};
use crate::rank;
use crate::sources::{self, FetchOutcome};

/// How a stage handler finished.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Done { warning: Option<String> },
    /// The work no longer applies; the job is cancelled rather than failed.
    Cancelled { reason: String },
}

impl StageOutcome {
    fn done() -> Self {
        Self::Done { warning: None }
    }
}

/// One processed job as reported by [`Pipeline::process_next`].
#[derive(Debug, Clone, Serialize)]
pub struct Processed {
    pub job_id: i64,
    pub stage: Stage,
    pub key: String,
    /// State after processing; `None` when the lease was lost meanwhile.
    pub state: Option<JobState>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    pub registered: usize,
    pub already_known: usize,
    pub queued: usize,
}

#[derive(Deserialize)]
struct QueryPayload {
    query: String,
}

#[derive(Deserialize)]
struct UrlPayload {
    url: String,
}

#[derive(Deserialize)]
struct DocumentPayload {
    document_id: i64,
}

#[derive(Deserialize)]
struct PairPayload {
    scenario_id: i64,
    entity_id: i64,
}

#[derive(Deserialize)]
struct ScenarioPayload {
    scenario_id: i64,
}

fn payload<T: DeserializeOwned>(job: &Job) -> Result<T, PipelineError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        PipelineError::Terminal(format!(
            "malformed {} payload for '{}': {}",
            job.stage, job.key, e
        ))
    })
}

fn document_key(document_id: i64) -> String {
    format!("doc:{}", document_id)
}

/// Classify an error surfaced by a handler for the queue.
pub fn classify(err: &anyhow::Error) -> PipelineError {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        return e.clone();
    }
    if let Some(e) = err.downcast_ref::<sqlx::Error>() {
        let transient = match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        };
        if transient {
            return PipelineError::transient(e.to_string());
        }
    }
    PipelineError::Terminal(format!("{:#}", err))
}

pub struct Pipeline {
    pool: SqlitePool,
    config: Arc<Config>,
    search: Arc<dyn SeedSearch>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        search: Arc<dyn SeedSearch>,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            pool,
            config,
            search,
            fetcher,
            extractor,
        }
    }

    /// Pipeline with the built-in collaborators.
    pub fn from_config(pool: SqlitePool, config: Arc<Config>) -> Result<Self> {
        let search = Arc::new(StaticSeedSearch::from_config(&config.search));
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        let extractor = Arc::new(RuleExtractor::new());
        Ok(Self::new(pool, config, search, fetcher, extractor))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ============ Entry points ============

    /// Queue a seed search per query. Returns the number of new jobs.
    pub async fn enqueue_search(&self, queries: &[String]) -> Result<usize> {
        let queries: Vec<&str> = queries.iter().map(|q| q.trim()).collect();
        if queries.is_empty() || queries.iter().any(|q| q.is_empty()) {
            return Err(PipelineError::invalid("query_set must contain non-empty queries").into());
        }
        let mut queued = 0;
        for q in queries {
            if queue::enqueue(&self.pool, Stage::SeedSearch, q, &json!({ "query": q })).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Register `urls` and queue a fetch for each allowed source. Nothing is
    /// written when any URL is invalid.
    pub async fn crawl(&self, urls: &[String]) -> Result<CrawlReport> {
        if urls.is_empty() {
            return Err(PipelineError::invalid("urls must not be empty").into());
        }
        for url in urls {
            sources::parse_source_url(url)?;
        }
        let mut report = CrawlReport::default();
        for url in urls {
            let registered = sources::register_source(&self.pool, url).await?;
            if registered.created {
                report.registered += 1;
            } else {
                report.already_known += 1;
            }
            if self.enqueue_fetch(registered.source_id).await? {
                report.queued += 1;
            }
        }
        Ok(report)
    }

    async fn enqueue_fetch(&self, source_id: i64) -> Result<bool> {
        let Some(source) = sources::get_source(&self.pool, source_id).await? else {
            return Ok(false);
        };
        if !source.robots_ok {
            debug!(url = %source.url, "source denied, not queued");
            return Ok(false);
        }
        queue::enqueue(&self.pool, Stage::Fetch, &source.url, &json!({ "url": source.url })).await
    }

    /// Queue extraction for every document without candidates or facts.
    pub async fn request_extract(&self) -> Result<usize> {
        let mut queued = 0;
        for id in sources::unextracted_documents(&self.pool).await? {
            let key = document_key(id);
            if queue::enqueue(&self.pool, Stage::Extract, &key, &json!({ "document_id": id }))
                .await?
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queue a compute job for every entity the scenario covers. Returns the
    /// number of entities.
    pub async fn request_compute(&self, scenario_id: i64) -> Result<usize> {
        let entities = compute::entities_for_scenario(&self.pool, scenario_id).await?;
        for entity in &entities {
            let key = format!("{}:{}", scenario_id, entity.id);
            queue::enqueue(
                &self.pool,
                Stage::Compute,
                &key,
                &json!({ "scenario_id": scenario_id, "entity_id": entity.id }),
            )
            .await?;
        }
        if entities.is_empty() {
            self.enqueue_rank(scenario_id).await?;
        }
        Ok(entities.len())
    }

    async fn enqueue_rank(&self, scenario_id: i64) -> Result<bool> {
        queue::enqueue(
            &self.pool,
            Stage::Rank,
            &format!("scenario:{}", scenario_id),
            &json!({ "scenario_id": scenario_id }),
        )
        .await
    }

    /// Queue a fetch for every allowed source not crawled within
    /// `pipeline.freshness_hours`.
    pub async fn refresh(&self) -> Result<usize> {
        let threshold = chrono::Duration::hours(self.config.pipeline.freshness_hours as i64);
        let mut queued = 0;
        for source in sources::stale_sources(&self.pool, threshold).await? {
            if queue::enqueue(&self.pool, Stage::Fetch, &source.url, &json!({ "url": source.url }))
                .await?
            {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "refresh queued stale sources");
        }
        Ok(queued)
    }

    // ============ Stage handlers ============

    async fn run_stage(&self, job: &Job) -> Result<StageOutcome> {
        match job.stage {
            Stage::SeedSearch => self.seed_search(job).await,
            Stage::Fetch => self.fetch(job).await,
            Stage::Extract => self.extract(job).await,
            Stage::Normalize => self.normalize(job).await,
            Stage::Compute => self.compute(job).await,
            Stage::Rank => self.rank(job).await,
        }
    }

    async fn seed_search(&self, job: &Job) -> Result<StageOutcome> {
        let QueryPayload { query } = payload(job)?;
        let urls = self.search.search(&query).await?;

        let mut skipped = Vec::new();
        let mut registered = 0;
        for url in &urls {
            if let Err(e) = sources::parse_source_url(url) {
                warn!(url = %url, "search returned an unusable url: {}", e);
                skipped.push(url.clone());
                continue;
            }
            let r = sources::register_source(&self.pool, url).await?;
            if r.created {
                registered += 1;
            }
            self.enqueue_fetch(r.source_id).await?;
        }
        info!(query = %query, found = urls.len(), registered, "seed search");

        let warning = (!skipped.is_empty())
            .then(|| format!("skipped {} invalid url(s): {}", skipped.len(), skipped.join(", ")));
        Ok(StageOutcome::Done { warning })
    }

    async fn fetch(&self, job: &Job) -> Result<StageOutcome> {
        let UrlPayload { url } = payload(job)?;
        let source_id = sources::register_source(&self.pool, &url).await?.source_id;
        let denied = |reason: &Option<String>| StageOutcome::Cancelled {
            reason: format!(
                "source denied: {}",
                reason.as_deref().unwrap_or("disabled by operator")
            ),
        };

        match sources::get_source(&self.pool, source_id).await? {
            Some(s) if !s.robots_ok => return Ok(denied(&s.deny_reason)),
            None => return Err(PipelineError::not_found(format!("source {}", url)).into()),
            _ => {}
        }

        let page = match self.fetcher.fetch(&url).await {
            Ok(page) => page,
            Err(e) => {
                if let PipelineError::FetchDenied { reason, .. } = &e {
                    sources::deny_source(&self.pool, source_id, reason).await?;
                    warn!(url = %url, reason = %reason, "source disabled");
                }
                return Err(e.into());
            }
        };

        // Denied while the request was in flight: discard the page.
        if let Some(s) = sources::get_source(&self.pool, source_id).await? {
            if !s.robots_ok {
                return Ok(denied(&s.deny_reason));
            }
        }

        let hash = sources::content_hash(&page.body);
        match sources::record_fetch(&self.pool, source_id, &hash, Utc::now(), &page).await? {
            FetchOutcome::Unchanged => {
                debug!(url = %url, "content unchanged");
            }
            FetchOutcome::Changed { document_id } => {
                info!(url = %url, document_id, "new document");
                queue::enqueue(
                    &self.pool,
                    Stage::Extract,
                    &document_key(document_id),
                    &json!({ "document_id": document_id }),
                )
                .await?;
            }
        }
        Ok(StageOutcome::done())
    }

    async fn extract(&self, job: &Job) -> Result<StageOutcome> {
        let DocumentPayload { document_id } = payload(job)?;
        match extract::extract_document(&self.pool, self.extractor.clone(), document_id).await {
            Ok(_) => {}
            Err(e) => match e.downcast_ref::<PipelineError>() {
                Some(skip @ PipelineError::ExtractionSkipped { .. }) => {
                    warn!(document_id, "{}", skip);
                    return Ok(StageOutcome::Done {
                        warning: Some(skip.to_string()),
                    });
                }
                _ => return Err(e),
            },
        }
        queue::enqueue(
            &self.pool,
            Stage::Normalize,
            &document_key(document_id),
            &json!({ "document_id": document_id }),
        )
        .await?;
        Ok(StageOutcome::done())
    }

    async fn normalize(&self, job: &Job) -> Result<StageOutcome> {
        let DocumentPayload { document_id } = payload(job)?;
        let report = extract::normalize_document(&self.pool, document_id).await?;
        let warning = (report.rejected > 0)
            .then(|| format!("{} candidate(s) rejected", report.rejected));
        Ok(StageOutcome::Done { warning })
    }

    async fn compute(&self, job: &Job) -> Result<StageOutcome> {
        let PairPayload {
            scenario_id,
            entity_id,
        } = payload(job)?;
        if let Err(e) = compute::compute_pair(&self.pool, scenario_id, entity_id).await {
            // The failure list changed and a stale result may be gone.
            if compute::is_recorded_failure(&e) {
                self.enqueue_rank(scenario_id).await?;
            }
            return Err(e);
        }
        self.enqueue_rank(scenario_id).await?;
        Ok(StageOutcome::done())
    }

    async fn rank(&self, job: &Job) -> Result<StageOutcome> {
        let ScenarioPayload { scenario_id } = payload(job)?;
        rank::rank_scenario(&self.pool, scenario_id).await?;
        Ok(StageOutcome::done())
    }

    // ============ Workers ============

    /// Claim and run one due job. Returns `None` when nothing is due.
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<Processed>> {
        let lease_ms = (self.config.pipeline.lease_secs * 1000) as i64;
        let max_attempts = self.config.pipeline.max_attempts;
        let Some(job) = queue::claim(&self.pool, worker_id, lease_ms, max_attempts).await? else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "job",
            stage = %job.stage,
            key = %job.key,
            attempt = job.attempts
        );
        let outcome = self.run_stage(&job).instrument(span.clone()).await;

        let state = self
            .finish(&job, worker_id, outcome)
            .instrument(span)
            .await?;

        Ok(Some(Processed {
            job_id: job.id,
            stage: job.stage,
            key: job.key,
            state,
        }))
    }

    async fn finish(
        &self,
        job: &Job,
        worker_id: &str,
        outcome: Result<StageOutcome>,
    ) -> Result<Option<JobState>> {
        match outcome {
            Ok(StageOutcome::Done { warning }) => {
                queue::complete(&self.pool, job.id, worker_id, warning.as_deref()).await
            }
            Ok(StageOutcome::Cancelled { reason }) => {
                info!(reason = %reason, "job cancelled");
                queue::cancel(&self.pool, job.stage, &job.key, &reason).await?;
                Ok(Some(JobState::Cancelled))
            }
            Err(err) => {
                let classified = classify(&err);
                let state =
                    queue::fail(&self.pool, job, worker_id, &classified, &self.config.pipeline)
                        .await?;
                match state {
                    Some(JobState::FailedRetryable) => {
                        warn!(kind = classified.kind(), "job will retry: {}", classified)
                    }
                    _ => error!(kind = classified.kind(), "job failed: {}", classified),
                }
                Ok(state)
            }
        }
    }

    /// Process due jobs until none is left. Jobs backing off into the future
    /// are left for a later run.
    pub async fn run_once(&self, worker_id: &str) -> Result<Vec<Processed>> {
        let mut processed = Vec::new();
        while let Some(p) = self.process_next(worker_id).await? {
            processed.push(p);
        }
        Ok(processed)
    }

    /// Number of workers allowed to claim work right now.
    async fn active_workers(&self) -> Result<usize> {
        let configured = self.config.pipeline.workers;
        let replicas = admin::current_replicas(&self.pool, admin::WORKER_TARGET).await?;
        Ok(replicas.map_or(configured, |r| (r as usize).min(configured)))
    }

    /// Run the worker pool and the refresh trigger until `shutdown` turns true.
    pub async fn run_workers(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let mut handles = Vec::new();

        for i in 0..self.config.pipeline.workers {
            let pipeline = self.clone();
            let mut shutdown = shutdown.clone();
            let worker_id = format!("worker-{}-{}", &tag[..8], i);
            handles.push(tokio::spawn(async move {
                let poll = Duration::from_millis(pipeline.config.pipeline.poll_interval_ms);
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let mut busy = false;
                    match pipeline.active_workers().await {
                        Ok(active) if i < active => match pipeline.process_next(&worker_id).await {
                            Ok(p) => busy = p.is_some(),
                            Err(e) => error!(worker = %worker_id, "queue error: {:#}", e),
                        },
                        Ok(_) => {}
                        Err(e) => error!(worker = %worker_id, "replica lookup failed: {:#}", e),
                    }
                    if !busy {
                        tokio::select! {
                            _ = tokio::time::sleep(poll) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                debug!(worker = %worker_id, "worker stopped");
            }));
        }

        let pipeline = self.clone();
        let mut refresh_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let period = Duration::from_secs(pipeline.config.pipeline.refresh_interval_secs);
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = pipeline.refresh().await {
                            error!("refresh failed: {:#}", e);
                        }
                    }
                    changed = refresh_shutdown.changed() => {
                        if changed.is_err() || *refresh_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        info!(workers = self.config.pipeline.workers, "worker pool started");
        for handle in handles {
            handle.await?;
        }
        info!("worker pool stopped");
        Ok(())
    }
}
