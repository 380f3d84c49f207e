use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use oppcomm_client::{CrmClient, CrmClientConfig, CrmError, PageRequest, RemoteStore};
use oppcomm_core::build_update_payload;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    puts: Arc<Mutex<Vec<(String, Value)>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

async fn pipelines(State(rec): State<Recorded>, headers: HeaderMap) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    rec.auth.lock().unwrap().push(auth);
    Json(json!({"pipelines": [{"id": "pip1", "name": "Loans"}]}))
}

async fn opportunities(
    Path(pipeline_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(pipeline_id, "pip1");
    assert_eq!(query.get("status").map(String::as_str), Some("open"));
    if query.contains_key("startAfterId") {
        return Json(json!({
            "opportunities": [{"id": "opp2", "status": "open"}],
            "meta": {"nextPageUrl": null}
        }));
    }
    Json(json!({
        "opportunities": [{"id": "opp1", "status": "open"}, {"broken": true}],
        "meta": {"nextPageUrl": "http://next", "startAfterId": "opp1", "startAfter": 17}
    }))
}

async fn get_one(Path((_, id)): Path<(String, String)>) -> impl IntoResponse {
    match id.as_str() {
        "opp1" => (StatusCode::OK, Json(json!({"id": "opp1", "monetaryValue": "12"}))),
        "boom" => (StatusCode::BAD_REQUEST, Json(json!({"msg": "bad"}))),
        _ => (StatusCode::NOT_FOUND, Json(json!({"msg": "not found"}))),
    }
}

async fn put_one(
    State(rec): State<Recorded>,
    Path((_, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if id == "reject" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"msg": "status is required"})),
        );
    }
    rec.puts.lock().unwrap().push((id, body));
    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn start(rec: Recorded) -> String {
    let app = Router::new()
        .route("/v1/pipelines/", get(pipelines))
        .route("/v1/pipelines/{pipeline}/opportunities", get(opportunities))
        .route(
            "/v1/pipelines/{pipeline}/opportunities/{id}",
            get(get_one).put(put_one),
        )
        .with_state(rec);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn client(base_url: String) -> CrmClient {
    let mut config = CrmClientConfig::new("secret-token");
    config.base_url = base_url;
    CrmClient::new(config).expect("client")
}

#[tokio::test]
async fn lists_pipelines_with_bearer_token() {
    let rec = Recorded::default();
    let crm = client(start(rec.clone()).await);

    let pipelines = crm.list_pipelines().await.unwrap();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].id, "pip1");
    assert_eq!(rec.auth.lock().unwrap().as_slice(), ["Bearer secret-token"]);
}

#[tokio::test]
async fn lists_pages_and_drops_malformed_records() {
    let crm = client(start(Recorded::default()).await);

    let first = crm
        .list_opportunities("pip1", "open", &PageRequest::first(100))
        .await
        .unwrap();
    assert_eq!(first.opportunities.len(), 1);
    let cursor = first.next.expect("cursor");
    assert_eq!(cursor.start_after_id, "opp1");
    assert_eq!(cursor.start_after, Some(17));

    let second = crm
        .list_opportunities(
            "pip1",
            "open",
            &PageRequest {
                limit: 100,
                cursor: Some(cursor),
            },
        )
        .await
        .unwrap();
    assert_eq!(second.opportunities[0].id, "opp2");
    assert_eq!(second.next, None);
}

#[tokio::test]
async fn not_found_is_distinct_from_failure() {
    let crm = client(start(Recorded::default()).await);

    let found = crm.get_opportunity("pip1", "opp1").await.unwrap();
    assert_eq!(found.unwrap().current_value(), Some(12.0));

    assert!(crm.get_opportunity("pip1", "gone").await.unwrap().is_none());

    let err = crm.get_opportunity("pip1", "boom").await.unwrap_err();
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn update_sends_full_payload_and_surfaces_rejections() {
    let rec = Recorded::default();
    let crm = client(start(rec.clone()).await);

    let payload = build_update_payload("pip1", "opp1", 1500.0, None);
    crm.update_opportunity(&payload).await.unwrap();
    assert_eq!(
        rec.puts.lock().unwrap().as_slice(),
        [("opp1".to_string(), json!({"monetaryValue": 1500.0}))]
    );

    let rejected = build_update_payload("pip1", "reject", 1.0, None);
    match crm.update_opportunity(&rejected).await {
        Err(CrmError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 422);
            assert!(body.contains("status is required"));
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}
