use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tiermatrix_api::{app, AppState, EngineSettings};
use tiermatrix_core::{MemoryTierStore, StoreCall};
use tiermatrix_shared::{TypeGroupId, Variant, VariantId};
use tower::ServiceExt;
use uuid::Uuid;

struct Fixture {
    store: Arc<MemoryTierStore>,
    state: AppState,
    service_id: Uuid,
    variant_id: VariantId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryTierStore::new());
    let service_id = Uuid::new_v4();
    let draft = Variant::new(VariantId::Local(0), "Paper", TypeGroupId::new()).draft();
    let variant = store.seed_variant(service_id, draft, &[(1, 10), (50, 8)]).await;

    let settings = EngineSettings {
        debounce: Duration::from_millis(20),
        ..Default::default()
    };
    let state = AppState::new(store.clone(), settings);
    Fixture { store, state, service_id, variant_id: variant.id }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn open(app: &Router, service_id: Uuid) -> String {
    let (status, body) = send(app, "POST", &format!("/v1/services/{}/sessions", service_id), None).await;
    assert_eq!(status, StatusCode::CREATED);
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_open_session_returns_grid() {
    let f = fixture().await;
    let app = app(f.state.clone());

    let (status, body) = send(&app, "POST", &format!("/v1/services/{}/sessions", f.service_id), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["grid"]["columns"].as_array().unwrap().len(), 2);
    assert_eq!(body["grid"]["rows"][0]["cells"][1]["price_cents"], 8);
    assert_eq!(body["grid"]["rows"][0]["ranges"][0]["max_quantity"], 49);
}

#[tokio::test]
async fn test_edit_and_flush_round_trip() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;
    let mut flushed = f.state.flush_tx.subscribe();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/sessions/{}/boundaries", session),
        Some(json!({"op": "add", "boundary": 200})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["columns"].as_array().unwrap().len(), 3);

    let (status, _) = send(
        &app,
        "PUT",
        &format!("/v1/sessions/{}/prices", session),
        Some(json!({"variant_id": f.variant_id.to_string(), "min_quantity": 200, "price_cents": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, status_body) = send(&app, "GET", &format!("/v1/sessions/{}", session), None).await;
    assert_eq!(status_body["dirty"], true);

    f.store.reset_calls().await;
    let (status, report) = send(&app, "POST", &format!("/v1/sessions/{}/flush", session), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["applied"].as_array().unwrap().len(), 1);
    assert_eq!(
        f.store.write_calls().await,
        vec![StoreCall::CreateTier {
            variant_id: f.variant_id.persisted().unwrap(),
            min_quantity: 200,
            price_cents: 7
        }]
    );
    assert_eq!(flushed.recv().await.unwrap().applied, 1);
}

#[tokio::test]
async fn test_partial_flush_answers_multi_status() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;
    f.store
        .fail_when(|c| matches!(c, StoreCall::CreateTier { .. }))
        .await;

    send(
        &app,
        "PUT",
        &format!("/v1/sessions/{}/prices", session),
        Some(json!({"variant_id": f.variant_id.to_string(), "min_quantity": 500, "price_cents": 3})),
    )
    .await;
    let (status, report) = send(&app, "POST", &format!("/v1/sessions/{}/flush", session), None).await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(report["failed"].as_array().unwrap().len(), 1);

    let (_, grid) = send(&app, "GET", &format!("/v1/sessions/{}/grid", session), None).await;
    assert_eq!(grid["rows"][0]["cells"][2]["unsynced"], true);
}

#[tokio::test]
async fn test_variant_lifecycle_and_hierarchy() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;

    let (status, created) = send(
        &app,
        "POST",
        &format!("/v1/sessions/{}/variants", session),
        Some(json!({"display_name": "Paper", "parameters": {"density": "130g"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let local = created["variant_id"].as_str().unwrap().to_string();
    assert_eq!(local, "local-1");

    let (_, tree) = send(&app, "GET", &format!("/v1/sessions/{}/hierarchy", session), None).await;
    assert_eq!(tree[0]["roots"][0]["children"][0]["display_name"], "Paper");

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/v1/sessions/{}/variants/{}", session, local),
        Some(json!({"display_name": "Paper 130g"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "DELETE", &format!("/v1/sessions/{}/variants/{}", session, local), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, status_body) = send(&app, "GET", &format!("/v1/sessions/{}", session), None).await;
    assert_eq!(status_body["dirty"], false);
}

#[tokio::test]
async fn test_validation_errors() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/v1/sessions/{}/boundaries", session),
        Some(json!({"op": "add", "boundary": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());

    let (status, _) = send(
        &app,
        "PUT",
        &format!("/v1/sessions/{}/prices", session),
        Some(json!({"variant_id": "local-42", "min_quantity": 1, "price_cents": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", &format!("/v1/sessions/{}/grid", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_debounced_price_is_saved() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;
    f.store.reset_calls().await;

    let (status, _) = send(
        &app,
        "PUT",
        &format!("/v1/sessions/{}/prices", session),
        Some(json!({"variant_id": f.variant_id.to_string(), "min_quantity": 50, "price_cents": 6, "debounce": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = f.store.stored_tiers(f.variant_id.persisted().unwrap()).await;
    assert_eq!(stored[1].price_cents, 6);
}

#[tokio::test]
async fn test_cancel_and_close() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;

    send(
        &app,
        "POST",
        &format!("/v1/sessions/{}/boundaries", session),
        Some(json!({"op": "add", "boundary": 20})),
    )
    .await;
    let (status, grid) = send(&app, "POST", &format!("/v1/sessions/{}/cancel", session), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grid["columns"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, "DELETE", &format!("/v1/sessions/{}", session), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "GET", &format!("/v1/sessions/{}", session), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_streams() {
    let f = fixture().await;
    let app = app(f.state.clone());
    let session = open(&app, f.service_id).await;

    for uri in [
        format!("/v1/services/{}/stream", f.service_id),
        format!("/v1/sessions/{}/stream", session),
    ] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
    }

    let (status, _) = send(&app, "GET", &format!("/v1/sessions/{}/stream", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
