use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt as _;
use serde_json::{Value, json};
use tower::ServiceExt as _;

use crate::{
    api,
    model::{AppInstall, BackupAccount, status},
    state::AppState,
    testing::{self, Fakes},
    transport::LOCAL,
};

async fn response_json(resp: axum::response::Response) -> Value {
    let payload = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&payload).unwrap()
}

async fn test_state(tag: &str) -> (Arc<AppState>, Fakes) {
    let (services, fakes) = testing::services(tag).await;
    (AppState::new(services), fakes)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_ok() {
    let (state, _fakes) = test_state("api-health").await;
    let resp = api::router(state).oneshot(get("/api/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn check_port_reports_host_conflict() {
    let (state, fakes) = test_state("api-port").await;
    fakes.ports.used.lock().unwrap().insert(8080);
    let app = api::router(state);

    let resp = app
        .clone()
        .oneshot(post("/api/apps/installed/check-port", json!({"port": 8080})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = response_json(resp).await;
    assert_eq!(body["error"]["code"], "ErrPortInUsed");
    assert_eq!(body["error"]["details"], json!({"port": 8080}));

    let resp = app
        .oneshot(post("/api/apps/installed/check-port", json!({"port": 8081})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(response_json(resp).await, json!({"ok": true}));
}

#[tokio::test]
async fn install_without_name_is_rejected() {
    let (state, _fakes) = test_state("api-install").await;
    let resp = api::router(state)
        .oneshot(post("/api/apps/install", json!({"appDetailId": 1, "params": {}})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(resp).await["error"]["code"], "invalid_argument");
}

#[tokio::test]
async fn operate_maps_domain_errors() {
    let (state, _fakes) = test_state("api-operate").await;
    let busy = state
        .services
        .db
        .create(AppInstall {
            name: "dp-busy".to_string(),
            status: status::UPGRADING.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let app = api::router(state);

    let resp = app
        .clone()
        .oneshot(post("/api/apps/installed/999/operate", json!({"operate": "stop"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(response_json(resp).await["error"]["code"], "ErrRecordNotFound");

    let resp = app
        .oneshot(post(
            &format!("/api/apps/installed/{}/operate", busy.id),
            json!({"operate": "restart"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = response_json(resp).await;
    assert_eq!(body["error"]["code"], "ErrBusy");
    assert_eq!(body["error"]["details"], json!({"name": "dp-busy"}));
}

#[tokio::test]
async fn installed_list_and_local_sync_start_empty() {
    let (state, _fakes) = test_state("api-list").await;
    let app = api::router(state);

    let resp = app
        .clone()
        .oneshot(get("/api/apps/installed?updatedOnly=true"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(response_json(resp).await, json!({"items": []}));

    let resp = app.oneshot(post("/api/apps/local/sync", json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        response_json(resp).await,
        json!({"added": 0, "updated": 0, "removed": 0})
    );
}

#[tokio::test]
async fn imported_snapshots_can_be_searched_described_and_deleted() {
    let (state, fakes) = test_state("api-snapshots").await;
    let account = state
        .services
        .db
        .create(BackupAccount {
            name: "localhost".to_string(),
            kind: LOCAL.to_string(),
            backup_path: fakes.root.join("remote").to_string_lossy().to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let app = api::router(state);

    let resp = app
        .clone()
        .oneshot(post(
            "/api/snapshots/import",
            json!({
                "backupAccountId": account.id,
                "names": ["1panel-v2.0.1-linux-amd64-20240101000000.tar.gz"],
                "description": "from old host",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = response_json(resp).await;
    let id = body["items"][0]["id"].as_i64().unwrap();
    assert_eq!(body["items"][0]["version"], "1panel-v2.0.1");
    assert!(body["items"][0].get("secret").is_none());

    let resp = app
        .clone()
        .oneshot(post(
            &format!("/api/snapshots/{id}/description"),
            json!({"description": "moved"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get("/api/snapshots?page=1&pageSize=10&info=v2.0.1"))
        .await
        .unwrap();
    let body = response_json(resp).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["description"], "moved");

    let resp = app
        .clone()
        .oneshot(get("/api/snapshots?page=0"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(post("/api/snapshots/delete", json!({"ids": [id]})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/api/snapshots")).await.unwrap();
    assert_eq!(response_json(resp).await["total"], 0);
}

#[tokio::test]
async fn snapshot_import_rejects_bad_names() {
    let (state, _fakes) = test_state("api-snap-bad").await;
    let resp = api::router(state)
        .oneshot(post(
            "/api/snapshots/import",
            json!({"backupAccountId": 1, "names": []}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response_json(resp).await["error"]["code"], "ErrFileParse");
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let (state, _fakes) = test_state("api-task").await;
    let resp = api::router(state)
        .oneshot(get("/api/tasks/tsk_missing"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(response_json(resp).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn daemon_change_reports_whether_file_changed() {
    let (state, fakes) = test_state("api-daemon").await;
    fakes.runner.respond("is-active", 0, "active\n");
    let path = state.services.config.daemon_json_path.clone();
    let app = api::router(state);
    let change = json!({"key": "Mirrors", "value": "https://mirror.example.com"});

    let resp = app
        .clone()
        .oneshot(post("/api/docker/daemon", change.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(response_json(resp).await, json!({"changed": true}));
    let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        written["registry-mirrors"],
        json!(["https://mirror.example.com"])
    );

    let resp = app.oneshot(post("/api/docker/daemon", change)).await.unwrap();
    assert_eq!(response_json(resp).await, json!({"changed": false}));
    assert_eq!(fakes.runner.count("restart docker"), 1);
}
