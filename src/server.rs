//! HTTP API.
//!
//! Exposes ingestion, compute, catalog and admin operations as JSON over
//! axum. Work-producing endpoints only enqueue jobs and answer `202`; the
//! worker pool started by `ecost serve` does the work.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status and version |
//! | `POST` | `/api/ingest/search` | Queue a seed search per query |
//! | `POST` | `/api/ingest/crawl` | Register URLs and queue fetches |
//! | `POST` | `/api/extract` | Queue extraction of unprocessed documents |
//! | `POST` | `/api/compute/lcoe` | Queue compute for a scenario |
//! | `GET`  | `/api/compute/sensitivity` | Sensitivity table for one pair |
//! | `GET`  | `/api/results` | Stored results for a scenario |
//! | `GET`  | `/api/rankings` | Ranking lists and recorded failures |
//! | `GET`/`POST` | `/api/entities` | List / upsert entities |
//! | `GET`  | `/api/entities/{id}` | One entity with its facts |
//! | `GET`/`POST` | `/api/scenarios` | List / create scenarios |
//! | `POST` | `/api/scenarios/preset` | Create a scenario from a preset |
//! | `POST` | `/api/scenarios/product` | Seed a product's facts and create its scenario |
//! | `GET`/`POST` | `/api/assumptions` | List / set assumptions |
//! | `GET`/`POST` | `/api/prices` | List / add price observations |
//! | `GET`  | `/api/sources` | Registered sources |
//! | `GET`  | `/api/jobs` | Job counts and recent jobs |
//! | `GET`  | `/api/admin/db/status` | Database health |
//! | `GET`  | `/api/admin/server/status` | Server health |
//! | `POST` | `/api/admin/db/control` | `vacuum_analyze` / `backup_snapshot` |
//! | `POST` | `/api/admin/server/control` | `scale_worker` |
//! | `GET`  | `/api/admin/audit` | Audit records, newest first |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "insufficient_data", "message": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `unrecognized_unit` | 400 |
//! | `fetch_denied` | 403 |
//! | `not_found` | 404 |
//! | `conflicting_admin_action` | 409 |
//! | `insufficient_data`, `missing_assumption`, `extraction_skipped` | 422 |
//! | `transient_io` | 503 |
//! | `audit_write_failure`, `terminal`, `internal` | 500 |
//!
//! Admin calls take their actor from the `x-actor` header, falling back to
//! `admin.default_actor`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use energy_cost_core::models::{Assumption, JobState, NewEntity, ScenarioSpec, UseCase};
use energy_cost_core::scenarios::{self, Product, ProductOptions};
use energy_cost_core::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

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

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub pipeline: Arc<Pipeline>,
    pub admin: Arc<AdminPlane>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: SqlitePool, pipeline: Arc<Pipeline>) -> Self {
        let admin = Arc::new(AdminPlane::new(pool.clone(), config.clone()));
        Self {
            config,
            pool,
            pipeline,
            admin,
        }
    }
}

/// Build the router with every route and permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/ingest/search", post(handle_ingest_search))
        .route("/api/ingest/crawl", post(handle_ingest_crawl))
        .route("/api/extract", post(handle_extract))
        .route("/api/compute/lcoe", post(handle_compute))
        .route("/api/compute/sensitivity", get(handle_sensitivity))
        .route("/api/results", get(handle_results))
        .route("/api/rankings", get(handle_rankings))
        .route("/api/entities", get(handle_list_entities).post(handle_upsert_entity))
        .route("/api/entities/{id}", get(handle_get_entity))
        .route("/api/scenarios", get(handle_list_scenarios).post(handle_create_scenario))
        .route("/api/scenarios/preset", post(handle_preset_scenario))
        .route("/api/scenarios/product", post(handle_product_scenario))
        .route("/api/assumptions", get(handle_list_assumptions).post(handle_set_assumption))
        .route("/api/prices", get(handle_list_prices).post(handle_add_price))
        .route("/api/sources", get(handle_list_sources))
        .route("/api/jobs", get(handle_jobs))
        .route("/api/admin/db/status", get(handle_db_status))
        .route("/api/admin/server/status", get(handle_server_status))
        .route("/api/admin/db/control", post(handle_db_control))
        .route("/api/admin/server/control", post(handle_server_control))
        .route("/api/admin/audit", get(handle_audit))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server, and the worker pool unless `workers` is false.
///
/// Binds to `[server].bind`. On Ctrl-C the listener stops accepting
/// connections and the workers finish their current job before exiting.
pub async fn run_server(config: &Config, workers: bool) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;
    migrate::apply(&pool).await?;

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), config.clone())?);
    let state = AppState::new(config.clone(), pool.clone(), pipeline.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = workers.then(|| tokio::spawn(pipeline.clone().run_workers(shutdown_rx)));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, workers, "server listening");
    println!("ecost server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        handle.await??;
    }
    pool.close().await;
    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code, the `PipelineError` kind.
    code: String,
    message: String,
}

/// Error type that converts into an HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// HTTP status for a pipeline error.
fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::FetchDenied { .. } => StatusCode::FORBIDDEN,
        PipelineError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::ExtractionSkipped { .. }
        | PipelineError::InsufficientData { .. }
        | PipelineError::MissingAssumption { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::UnrecognizedUnit { .. } | PipelineError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::ConflictingAdminAction { .. } => StatusCode::CONFLICT,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::AuditWriteFailure(_) | PipelineError::Terminal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<PipelineError>() {
            Some(e) => AppError {
                status: status_for(e),
                code: e.kind().to_string(),
                message: e.to_string(),
            },
            None => {
                error!("internal error: {:#}", err);
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal".to_string(),
                    message: err.to_string(),
                }
            }
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, AppError>;

fn actor(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.config.admin.default_actor.clone())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Ingestion ============

#[derive(Deserialize)]
struct SearchRequest {
    query_set: Vec<String>,
}

async fn handle_ingest_search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body?;
    let queued = state.pipeline.enqueue_search(&req.query_set).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

#[derive(Deserialize)]
struct CrawlRequest {
    urls: Vec<String>,
}

async fn handle_ingest_crawl(
    State(state): State<AppState>,
    body: Result<Json<CrawlRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body?;
    let report = state.pipeline.crawl(&req.urls).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(report))))
}

async fn handle_extract(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<Value>)> {
    let queued = state.pipeline.request_extract().await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

// ============ Compute & rankings ============

#[derive(Deserialize)]
struct ScenarioRef {
    scenario_id: i64,
}

async fn handle_compute(
    State(state): State<AppState>,
    body: Result<Json<ScenarioRef>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body?;
    let entities = state.pipeline.request_compute(req.scenario_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "scenario_id": req.scenario_id, "entities": entities })),
    ))
}

#[derive(Deserialize)]
struct SensitivityQuery {
    scenario_id: i64,
    entity_id: i64,
    variation: Option<f64>,
}

async fn handle_sensitivity(
    State(state): State<AppState>,
    query: Result<Query<SensitivityQuery>, QueryRejection>,
) -> ApiResult<Json<compute::SensitivityReport>> {
    let Query(q) = query?;
    let report = compute::sensitivity(&state.pool, q.scenario_id, q.entity_id, q.variation).await?;
    Ok(Json(report))
}

async fn handle_results(
    State(state): State<AppState>,
    query: Result<Query<ScenarioRef>, QueryRejection>,
) -> ApiResult<Json<Vec<compute::StoredResult>>> {
    let Query(q) = query?;
    catalog::require_scenario(&state.pool, q.scenario_id).await?;
    Ok(Json(compute::list_results(&state.pool, q.scenario_id).await?))
}

async fn handle_rankings(
    State(state): State<AppState>,
    query: Result<Query<ScenarioRef>, QueryRejection>,
) -> ApiResult<Json<rank::RankingReport>> {
    let Query(q) = query?;
    Ok(Json(rank::get_rankings(&state.pool, q.scenario_id).await?))
}

// ============ Catalog ============

async fn handle_list_entities(
    State(state): State<AppState>,
    query: Result<Query<EntityFilter>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(filter) = query?;
    let entities = catalog::list_entities(&state.pool, &filter).await?;
    Ok(Json(json!({ "entities": entities })))
}

async fn handle_upsert_entity(
    State(state): State<AppState>,
    body: Result<Json<NewEntity>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(entity) = body?;
    let (entity, created) = catalog::upsert_entity(&state.pool, &entity).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!(entity))))
}

async fn handle_get_entity(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let entity = catalog::get_entity(&state.pool, id)
        .await?
        .ok_or_else(|| not_found(format!("entity {} not found", id)))?;
    let facts = catalog::facts_for_entity(&state.pool, id).await?;
    Ok(Json(json!({ "entity": entity, "facts": facts })))
}

async fn handle_list_scenarios(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let scenarios = catalog::list_scenarios(&state.pool).await?;
    Ok(Json(json!({ "scenarios": scenarios })))
}

async fn handle_create_scenario(
    State(state): State<AppState>,
    body: Result<Json<ScenarioSpec>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(spec) = body?;
    let scenario = catalog::create_scenario(&state.pool, &spec).await?;
    Ok((StatusCode::CREATED, Json(json!(scenario))))
}

#[derive(Deserialize)]
struct PresetRequest {
    use_case: UseCase,
    region: String,
    #[serde(default)]
    name: Option<String>,
}

async fn handle_preset_scenario(
    State(state): State<AppState>,
    body: Result<Json<PresetRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body?;
    let mut spec = scenarios::preset(req.use_case, &req.region);
    if let Some(name) = req.name {
        spec.name = name;
    }
    let scenario = catalog::create_scenario(&state.pool, &spec).await?;
    Ok((StatusCode::CREATED, Json(json!(scenario))))
}

#[derive(Deserialize)]
struct ProductRequest {
    product: String,
    region: String,
    #[serde(flatten)]
    options: ProductOptions,
}

async fn handle_product_scenario(
    State(state): State<AppState>,
    body: Result<Json<ProductRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body?;
    let product: Product = req.product.parse()?;
    let preset = scenarios::product_preset(product, &req.region, &req.options)?;
    let applied = catalog::apply_product_preset(&state.pool, &preset).await?;
    Ok((StatusCode::CREATED, Json(json!(applied))))
}

async fn handle_list_assumptions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let assumptions = catalog::list_assumptions(&state.pool).await?;
    Ok(Json(json!({ "assumptions": assumptions })))
}

async fn handle_set_assumption(
    State(state): State<AppState>,
    body: Result<Json<Assumption>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(assumption) = body?;
    catalog::set_assumption(&state.pool, &assumption).await?;
    Ok(Json(json!(assumption)))
}

#[derive(Deserialize)]
struct PriceQuery {
    entity_id: Option<i64>,
}

async fn handle_list_prices(
    State(state): State<AppState>,
    query: Result<Query<PriceQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(q) = query?;
    let prices = catalog::list_prices(&state.pool, q.entity_id).await?;
    Ok(Json(json!({ "prices": prices })))
}

async fn handle_add_price(
    State(state): State<AppState>,
    body: Result<Json<NewPrice>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(price) = body?;
    let price = catalog::add_price(&state.pool, &price).await?;
    Ok((StatusCode::CREATED, Json(json!(price))))
}

async fn handle_list_sources(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sources = sources::list_sources(&state.pool).await?;
    Ok(Json(json!({ "sources": sources })))
}

// ============ GET /api/jobs ============

#[derive(Deserialize)]
struct JobsQuery {
    state: Option<JobState>,
    limit: Option<i64>,
}

async fn handle_jobs(
    State(state): State<AppState>,
    query: Result<Query<JobsQuery>, QueryRejection>,
) -> ApiResult<Json<queue::JobSummary>> {
    let Query(q) = query?;
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(queue::summary(&state.pool, q.state, limit).await?))
}

// ============ Admin ============

async fn handle_db_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.admin.db_status().await?)))
}

async fn handle_server_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.admin.server_status().await?)))
}

/// Control bodies stay raw so a malformed one still gets an audit record.
fn control_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, String> {
    body.map(|Json(value)| value).map_err(|rejection| rejection.body_text())
}

async fn handle_db_control(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let actor = actor(&state, &headers);
    let result = state.admin.db_control_body(&actor, control_body(body)).await?;
    Ok(Json(result))
}

async fn handle_server_control(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let actor = actor(&state, &headers);
    let result = state.admin.server_control_body(&actor, control_body(body)).await?;
    Ok(Json(json!(result)))
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<i64>,
}

async fn handle_audit(
    State(state): State<AppState>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(q) = query?;
    let records = state.admin.audit_log(q.limit).await?;
    Ok(Json(json!({ "records": records })))
}
