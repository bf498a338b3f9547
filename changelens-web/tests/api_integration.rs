use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use changelens_web::{create_app, AppState, WebConfig};

async fn test_app() -> Router {
    let config = WebConfig {
        database_url: "sqlite::memory:".to_string(),
        ..WebConfig::default()
    };
    let state = AppState::new(config).await.expect("test state");
    create_app(state)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_store_and_graph() {
    let app = test_app().await;
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"]["total"], 0);
    assert_eq!(body["graph"]["nodes"], 0);
}

#[tokio::test]
async fn create_event_returns_201_and_duplicate_returns_200() {
    let app = test_app().await;

    let event = json!({
        "service": "api",
        "summary": "deploy v1",
        "change_type": "deployment",
        "idempotency_key": "k-1"
    });

    let created = app.clone().oneshot(post("/api/events", event.clone())).await.unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    assert_eq!(created["service"], "api");
    assert_eq!(created["environment"], "production");

    let replayed = app.clone().oneshot(post("/api/events", event)).await.unwrap();
    assert_eq!(replayed.status(), StatusCode::OK);
    let replayed = body_json(replayed).await;
    assert_eq!(replayed["id"], created["id"]);
}

#[tokio::test]
async fn idempotency_key_header_is_honored() {
    let app = test_app().await;
    let body = json!({
        "service": "api",
        "summary": "deploy",
        "change_type": "deployment"
    });
    let request = Request::builder()
        .method("POST")
        .uri("/api/events")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "hdr-1")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let event = body_json(response).await;
    assert_eq!(event["idempotency_key"], "hdr-1");
}

#[tokio::test]
async fn invalid_event_is_rejected_with_validation_error() {
    let app = test_app().await;
    let response = app
        .oneshot(post("/api/events", json!({ "service": "api" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn event_crud_and_query_flow() {
    let app = test_app().await;

    let created = body_json(
        app.clone()
            .oneshot(post(
                "/api/events",
                json!({
                    "service": "api",
                    "additional_services": ["db"],
                    "summary": "rolled out checkout flow",
                    "change_type": "deployment"
                }),
            ))
            .await
            .unwrap(),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let fetched = app
        .clone()
        .oneshot(get(&format!("/api/events/{}", id)))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);

    let patched = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/events/{}", id))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({ "status": "rolled_back" })).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(patched.status(), StatusCode::OK);
    assert_eq!(body_json(patched).await["status"], "rolled_back");

    // service filter matches additional services too
    let queried = body_json(
        app.clone()
            .oneshot(get("/api/events?services=db"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(queried["count"], 1);

    let searched = body_json(
        app.clone()
            .oneshot(get("/api/events/search?q=checkout"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(searched["count"], 1);

    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/events/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);

    let missing = app
        .oneshot(get(&format!("/api/events/{}", id)))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn batch_create_is_atomic() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(post(
            "/api/events/batch",
            json!({ "events": [
                { "service": "api", "summary": "one", "change_type": "deployment" },
                { "service": "db", "summary": "two", "change_type": "db_migration" }
            ]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["count"], 2);

    // a bad event anywhere aborts the whole batch
    let response = app
        .clone()
        .oneshot(post(
            "/api/events/batch",
            json!({ "events": [
                { "service": "cache", "summary": "ok", "change_type": "scaling" },
                { "service": "cache", "change_type": "scaling" }
            ]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let health = body_json(app.oneshot(get("/api/health")).await.unwrap()).await;
    assert_eq!(health["store"]["total"], 2);
}

#[tokio::test]
async fn graph_import_then_blast_radius() {
    let app = test_app().await;

    let imported = app
        .clone()
        .oneshot(post(
            "/api/graph/import",
            json!({
                "services": [
                    { "id": "A", "tier": "critical" },
                    { "id": "B" },
                    { "id": "C" }
                ],
                "dependencies": [
                    { "source": "A", "target": "B", "criticality": "critical" },
                    { "source": "B", "target": "C", "criticality": "critical" }
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(imported.status(), StatusCode::OK);
    let imported = body_json(imported).await;
    assert_eq!(imported["imported_nodes"], 3);
    assert_eq!(imported["imported_edges"], 2);

    let prediction = body_json(
        app.clone()
            .oneshot(post("/api/blast-radius", json!({ "services": ["C"] })))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(prediction["direct_services"], json!(["B"]));
    assert_eq!(prediction["downstream_services"], json!(["A"]));
    assert_eq!(prediction["critical_path_affected"], true);
    assert_eq!(prediction["risk_level"], "critical");

    let services = body_json(
        app.clone()
            .oneshot(get("/api/graph/services"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(services.as_array().unwrap().len(), 3);

    let deps = body_json(
        app.clone()
            .oneshot(get("/api/graph/services/B/dependencies"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(deps["dependencies"][0]["target"], "C");
    assert_eq!(deps["dependents"][0]["source"], "A");

    let missing = app
        .oneshot(get("/api/graph/services/zzz/dependencies"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blast_radius_requires_services() {
    let app = test_app().await;
    let response = app
        .oneshot(post("/api/blast-radius", json!({ "services": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn correlate_returns_scored_events_and_change_sets() {
    let app = test_app().await;

    app.clone()
        .oneshot(post(
            "/api/graph/import",
            json!({
                "dependencies": [ { "source": "web", "target": "api" } ]
            }),
        ))
        .await
        .unwrap();

    for summary in ["deploy api", "tune api flags"] {
        app.clone()
            .oneshot(post(
                "/api/events",
                json!({
                    "service": "api",
                    "summary": summary,
                    "change_type": "deployment",
                    "metadata": { "pipeline_id": "p-1" }
                }),
            ))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(post(
            "/api/correlate",
            json!({
                "affected_services": ["web"],
                "window_minutes": 60,
                "include_change_sets": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let correlations = body["correlations"].as_array().unwrap();
    assert_eq!(correlations.len(), 2);
    assert!(correlations[0]["correlation_score"].as_f64().unwrap() > 0.0);
    assert!(correlations[0]["confidence"]["factors"]["environment_match"].is_number());
    let change_sets = body["change_sets"].as_array().unwrap();
    assert_eq!(change_sets.len(), 1);
    assert_eq!(change_sets[0]["change_set"]["key"], "run:manual:p-1");
}

#[tokio::test]
async fn velocity_endpoint_returns_single_and_trend() {
    let app = test_app().await;
    for _ in 0..2 {
        app.clone()
            .oneshot(post(
                "/api/events",
                json!({ "service": "api", "summary": "deploy", "change_type": "deployment" }),
            ))
            .await
            .unwrap();
    }

    let single = body_json(
        app.clone()
            .oneshot(get("/api/velocity/api?window_minutes=60"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(single["change_count"], 2);
    assert_eq!(single["change_types"]["deployment"], 2);

    let trend = body_json(
        app.clone()
            .oneshot(get("/api/velocity/api?window_minutes=60&periods=3"))
            .await
            .unwrap(),
    )
    .await;
    let windows = trend.as_array().unwrap();
    assert_eq!(windows.len(), 3);
    assert_eq!(windows[2]["change_count"], 2);

    let invalid = app
        .oneshot(get("/api/velocity/api?window_minutes=0"))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn triage_endpoint_runs_end_to_end() {
    let app = test_app().await;
    app.clone()
        .oneshot(post(
            "/api/events",
            json!({ "service": "api", "summary": "deploy", "change_type": "deployment" }),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(post(
            "/api/triage",
            json!({ "window_minutes": 60, "symptom_tags": ["errors"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["suspects_derived"], true);
    assert_eq!(body["suspected_services"], json!(["api"]));
    assert_eq!(body["symptom_tags"], json!(["errors"]));
}

#[tokio::test]
async fn unknown_route_returns_structured_404() {
    let app = test_app().await;
    let response = app.oneshot(get("/api/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "not_found");
}
