use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use datasets_db_rust::api::handlers::AppState;
use datasets_db_rust::api::routes::create_router;
use datasets_db_rust::config::AppConfig;
use datasets_db_rust::seed::{load_seed_data, SeedData};
use datasets_db_rust::store::{DataSetStore, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app() -> (Router, Arc<MemoryStore>, SeedData) {
    let store = Arc::new(MemoryStore::new());
    let seed = load_seed_data(&*store).await.unwrap();
    let router = create_router().with_state(AppState::new(store.clone(), AppConfig::default()));
    (router, store, seed)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn resolve_uri(seed: &SeedData, data_set_id: &uuid::Uuid) -> String {
    format!(
        "/datasets/{}/resolve?target={}&chain={}",
        data_set_id, seed.city_attribute_id, seed.address_attribute_id
    )
}

#[tokio::test]
async fn test_health() {
    let (app, _, _) = app().await;
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_tree_renders_references_and_overrides() {
    let (app, _, seed) = app().await;
    let (status, body) = send(&app, get(&format!("/dataset-lists/{}/tree", seed.person_list_id))).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(body["name"], "Person");
    assert_eq!(body["visibility_area"]["name"], "Demo");
    assert_eq!(body["stats"]["skipped"], 0);

    let data_sets = body["data_sets"].as_array().unwrap();
    assert_eq!(data_sets.len(), 2);
    let alice = &data_sets[0];
    assert_eq!(alice["name"], "alice");

    let address = alice["values"]
        .as_array()
        .unwrap()
        .iter()
        .find(|value| value["attribute"] == "address")
        .unwrap();
    assert_eq!(address["value"], "home");
    assert_eq!(address["data_set_ref_id"], json!(seed.home_id));

    let overrides = alice["overrides"].as_array().unwrap();
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0]["target_attribute"], "city");
    assert_eq!(overrides[0]["value"], "Lyon");
    assert!(data_sets[1].get("overrides").is_none());
}

#[tokio::test]
async fn test_sorted_tree_puts_references_last() {
    let (app, _, seed) = app().await;
    let uri = format!("/dataset-lists/{}/tree?sorted=true&cache=disabled", seed.person_list_id);
    let (status, body) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["attributes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|attribute| attribute["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["name", "address"]);
}

#[tokio::test]
async fn test_unknown_list_is_not_found() {
    let (app, _, _) = app().await;
    let uri = format!("/dataset-lists/{}/tree", uuid::Uuid::new_v4());
    let (status, body) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_resolve_reports_source() {
    let (app, _, seed) = app().await;

    let (status, alice) = send(&app, get(&resolve_uri(&seed, &seed.alice_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(alice["value"], "Lyon");
    assert_eq!(alice["source"]["kind"], "override");
    assert_eq!(alice["source"]["hop"], 0);

    let (_, bob) = send(&app, get(&resolve_uri(&seed, &seed.bob_id))).await;
    assert_eq!(bob["value"], "Paris");
    assert_eq!(bob["source"]["kind"], "natural");
    assert_eq!(bob["source"]["data_set_id"], json!(seed.home_id));
}

#[tokio::test]
async fn test_override_put_then_delete() {
    let (app, _, seed) = app().await;
    let uri = format!("/datasets/{}/overrides", seed.bob_id);
    let request = json!({
        "target_attribute_id": seed.city_attribute_id,
        "chain": [seed.address_attribute_id],
        "value": {"type": "text", "value": "Nice"}
    });

    let (status, record) = send(&app, put_json(&uri, request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["text"], "Nice");

    let (_, bob) = send(&app, get(&resolve_uri(&seed, &seed.bob_id))).await;
    assert_eq!(bob["value"], "Nice");

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!(
            "{}?target={}&chain={}",
            uri, seed.city_attribute_id, seed.address_attribute_id
        ))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], true);

    let (_, bob) = send(&app, get(&resolve_uri(&seed, &seed.bob_id))).await;
    assert_eq!(bob["value"], "Paris");
}

#[tokio::test]
async fn test_override_rejections() {
    let (app, store, seed) = app().await;

    // Target that is not reachable through the chain
    let uri = format!("/datasets/{}/overrides", seed.alice_id);
    let request = json!({
        "target_attribute_id": seed.name_attribute_id,
        "chain": [seed.address_attribute_id],
        "value": {"type": "text", "value": "x"}
    });
    let (status, _) = send(&app, put_json(&uri, request)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    store.set_data_set_locked(&seed.bob_id, true).await.unwrap();
    let uri = format!("/datasets/{}/overrides", seed.bob_id);
    let request = json!({
        "target_attribute_id": seed.city_attribute_id,
        "chain": [seed.address_attribute_id],
        "value": {"type": "text", "value": "Nice"}
    });
    let (status, body) = send(&app, put_json(&uri, request)).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert!(body["error"].as_str().unwrap().contains("locked"));
}
