//! HTTP API tests driving the router in-process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use energy_cost::config::Config;
use energy_cost::pipeline::Pipeline;
use energy_cost::server::{router, AppState};
use energy_cost::{db, migrate};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

async fn setup() -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("data/ecost.sqlite"));
    config.admin.serialize_wait_ms = 100;
    let config = Arc::new(config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), config.clone()).unwrap());
    let app = router(AppState::new(config, pool, pipeline));
    (tmp, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .header("x-actor", "ops@example.com")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

#[tokio::test]
async fn test_health() {
    let (_tmp, app) = setup().await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_unknown_scenario_is_404() {
    let (_tmp, app) = setup().await;

    let (status, body) = get(&app, "/api/rankings?scenario_id=42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = post(&app, "/api/compute/lcoe", json!({ "scenario_id": 42 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let (_tmp, app) = setup().await;
    let request = Request::post("/api/ingest/search")
        .header("content-type", "application/json")
        .body(Body::from("{\"query_set\": ["))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = post(&app, "/api/ingest/search", json!({ "query_set": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/api/rankings?scenario_id=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingest_is_accepted() {
    let (_tmp, app) = setup().await;

    let (status, body) = post(
        &app,
        "/api/ingest/search",
        json!({ "query_set": ["utility pv lcoe", "home battery price"] }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], 2);

    let (status, body) = post(
        &app,
        "/api/ingest/crawl",
        json!({ "urls": ["https://www.example.com/a", "https://www.example.com/a"] }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["registered"], 1);
    assert_eq!(body["already_known"], 1);

    let (status, body) = get(&app, "/api/jobs?state=pending").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 3);
    assert_eq!(body["counts"]["seed_search"]["pending"], 2);
}

#[tokio::test]
async fn test_entity_upsert_and_lookup() {
    let (_tmp, app) = setup().await;
    let entity = json!({ "name": "Home Battery 10", "type": "battery", "manufacturer": "Volt" });

    let (status, created) = post(&app, "/api/entities", entity.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    let (status, updated) = post(&app, "/api/entities", entity).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["id"], id);

    let (status, body) = get(&app, &format!("/api/entities/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"]["type"], "battery");
    assert_eq!(body["facts"].as_array().unwrap().len(), 0);

    let (status, body) = get(&app, "/api/entities?type=battery").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entities"].as_array().unwrap().len(), 1);

    let (status, _) = get(&app, "/api/entities/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&app, "/api/entities", json!({ "name": "X", "type": "warp" })).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_scenario_preset_and_compute() {
    let (_tmp, app) = setup().await;

    let (status, scenario) = post(
        &app,
        "/api/scenarios/preset",
        json!({ "use_case": "commercial", "region": "TX" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = scenario["id"].as_i64().unwrap();

    let (status, body) = post(&app, "/api/compute/lcoe", json!({ "scenario_id": id })).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["entities"], 0);

    let (status, body) = get(&app, &format!("/api/results?scenario_id={}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);

    let (status, body) = get(&app, "/api/scenarios").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scenarios"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_assumption_with_bad_unit_is_rejected() {
    let (_tmp, app) = setup().await;

    let (status, _) = post(
        &app,
        "/api/assumptions",
        json!({ "name": "discount_rate", "value": 7.0, "unit": "%" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &app,
        "/api/assumptions",
        json!({ "name": "discount_rate", "value": 7.0, "unit": "parsecs" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unrecognized_unit");

    let (_, body) = get(&app, "/api/assumptions").await;
    assert_eq!(body["assumptions"][0]["unit"], "%");
}

#[tokio::test]
async fn test_admin_scale_and_audit() {
    let (_tmp, app) = setup().await;

    let (status, body) = post(
        &app,
        "/api/admin/server/control",
        json!({ "action": "scale_worker", "target": "worker", "replicas": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replicas"], 2);
    assert_eq!(body["generation"], 1);

    let (status, body) = post(
        &app,
        "/api/admin/server/control",
        json!({ "action": "scale_worker", "target": "worker", "replicas": 100000 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = post(&app, "/api/admin/db/control", json!({ "action": "defrag" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("defrag"));

    let (status, body) = get(&app, "/api/admin/audit?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r["actor"] == "ops@example.com"));
    assert_eq!(records[2]["result"]["status"], "ok");
    assert_eq!(records[0]["result"]["status"], "error");

    let (status, body) = get(&app, "/api/admin/server/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["replicas"]["worker"], 2);
}

#[tokio::test]
async fn test_admin_db_control_backup() {
    let (tmp, app) = setup().await;

    let (status, body) = post(
        &app,
        "/api/admin/db/control",
        json!({ "action": "backup_snapshot" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "backup_snapshot");
    assert!(body["result"]["size_bytes"].as_u64().unwrap() > 0);
    assert!(tmp.path().join("data/backups").exists());

    let (status, body) = get(&app, "/api/admin/db/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quick_check"], "ok");
    assert_eq!(body["row_counts"]["ops_audit"], 1);
}

#[tokio::test]
async fn test_malformed_admin_body_is_audited() {
    let (_tmp, app) = setup().await;

    let (status, body) = post(
        &app,
        "/api/admin/server/control",
        json!({ "action": "scale_worker", "target": "worker", "replicas": "4" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let request = Request::post("/api/admin/db/control")
        .header("content-type", "application/json")
        .header("x-actor", "ops@example.com")
        .body(Body::from("{ not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = get(&app, "/api/admin/audit").await;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["action"], "unknown");
    assert_eq!(records[0]["target"], "db");
    assert_eq!(records[1]["action"], "scale_worker");
    assert_eq!(records[1]["target"], "worker");
    assert_eq!(records[1]["actor"], "ops@example.com");
    assert_eq!(records[1]["result"]["error"]["code"], "bad_request");

    // Nothing was scaled.
    let (_, body) = get(&app, "/api/admin/db/status").await;
    assert_eq!(body["row_counts"]["worker_scale"], 0);
}

#[tokio::test]
async fn test_product_scenario_seeds_entity() {
    let (_tmp, app) = setup().await;

    let (status, body) = post(
        &app,
        "/api/scenarios/product",
        json!({ "product": "solar-roof", "region": "NY", "roof_complexity": 1.2, "quantity": 8 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["entity_created"], true);
    assert_eq!(body["facts_seeded"], 5);
    assert_eq!(body["scenario"]["name"], "Tesla Solar Roof NY");
    assert_eq!(body["scenario"]["load_profile"]["system_size_kw"], 8.0);
    let entity_id = body["entity"]["id"].as_i64().unwrap();

    let (status, body) = get(&app, &format!("/api/entities/{}", entity_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"]["manufacturer"], "Tesla");
    let facts = body["facts"].as_array().unwrap();
    assert!(facts.iter().all(|f| f["extraction_method"] == "catalog"));
    let capex = facts.iter().find(|f| f["metric"] == "capex_per_kw").unwrap();
    assert_eq!(capex["value"], 4800.0);

    let (status, body) = post(
        &app,
        "/api/scenarios/product",
        json!({ "product": "cybertruck", "region": "CA" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("cybertruck"));
}
