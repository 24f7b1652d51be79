pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};

use crate::{
    app::{InstallRequest, UninstallRequest, UpgradeRequest},
    daemon::DaemonChange,
    error::ApiError,
    snapshot::{SnapshotCreate, SnapshotData, SnapshotImport},
    state::AppState,
};
use types::*;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/apps/install", post(install_app))
        .route("/api/apps/installed", get(list_installed))
        .route("/api/apps/installed/check-port", post(check_port))
        .route("/api/apps/installed/{id}/upgrade", post(upgrade_app))
        .route("/api/apps/installed/{id}/operate", post(operate_app))
        .route("/api/apps/installed/{id}/uninstall", post(uninstall_app))
        .route("/api/apps/local/sync", post(sync_local_apps))
        .route("/api/snapshots", get(search_snapshots).post(create_snapshot))
        .route("/api/snapshots/data", get(snapshot_data))
        .route("/api/snapshots/import", post(import_snapshots))
        .route("/api/snapshots/delete", post(delete_snapshots))
        .route("/api/snapshots/{id}/recreate", post(recreate_snapshot))
        .route("/api/snapshots/{id}/description", post(update_description))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/docker/daemon", post(update_daemon))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn install_app(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstallRequest>,
) -> Result<Json<InstallResponse>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::invalid_argument("name is required"));
    }
    let (install, task_id) = state.apps.install(req).await?;
    Ok(Json(InstallResponse {
        id: install.id,
        name: install.name,
        task_id,
    }))
}

async fn list_installed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListInstalledQuery>,
) -> Result<Json<ListInstalledResponse>, ApiError> {
    let items = state
        .apps
        .list_installed(query.updated_only, query.sync)
        .await?;
    Ok(Json(ListInstalledResponse { items }))
}

async fn upgrade_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpgradeRequest>,
) -> Result<Json<TaskIdResponse>, ApiError> {
    let task_id = state.apps.upgrade(id, req).await?;
    Ok(Json(TaskIdResponse { task_id }))
}

async fn operate_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<OperateRequest>,
) -> Result<Json<TaskIdResponse>, ApiError> {
    let task_id = state.apps.operate(id, req.operate).await?;
    Ok(Json(TaskIdResponse {
        task_id: task_id.unwrap_or_default(),
    }))
}

async fn uninstall_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UninstallRequest>,
) -> Result<Json<TaskIdResponse>, ApiError> {
    let task_id = state.apps.uninstall(id, req).await?;
    Ok(Json(TaskIdResponse { task_id }))
}

async fn check_port(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckPortRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.apps.check_port_exist(req.port).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn sync_local_apps(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncLocalResponse>, ApiError> {
    let changes = state.apps.sync_local_apps().await?;
    Ok(Json(changes.into()))
}

async fn search_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotListQuery>,
) -> Result<Json<SnapshotListResponse>, ApiError> {
    if query.page < 1 || query.page_size < 1 {
        return Err(ApiError::invalid_argument("page and pageSize must be positive"));
    }
    let (total, items) = state
        .snapshots
        .search(query.page, query.page_size, &query.info)
        .await?;
    Ok(Json(SnapshotListResponse { total, items }))
}

async fn snapshot_data(State(state): State<Arc<AppState>>) -> Result<Json<SnapshotData>, ApiError> {
    Ok(Json(state.snapshots.load_snapshot_data().await?))
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SnapshotCreate>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    if req.source_account_ids.trim().is_empty() {
        return Err(ApiError::invalid_argument("sourceAccountIds is required"));
    }
    let snapshot = state.snapshots.create(req).await?;
    Ok(Json(SnapshotResponse { snapshot }))
}

async fn recreate_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskIdResponse>, ApiError> {
    let task_id = state.snapshots.recreate(id).await?;
    Ok(Json(TaskIdResponse { task_id }))
}

async fn import_snapshots(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SnapshotImport>,
) -> Result<Json<SnapshotImportResponse>, ApiError> {
    let items = state.snapshots.import(req).await?;
    Ok(Json(SnapshotImportResponse { items }))
}

async fn delete_snapshots(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteSnapshotsRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.ids.is_empty() {
        return Err(ApiError::invalid_argument("ids is required"));
    }
    state
        .snapshots
        .delete(req.ids, req.delete_with_file)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn update_description(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<DescriptionRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .snapshots
        .update_description(id, req.description)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let db = &state.services.db;
    let Some(task) = db.get_task(&id).await? else {
        return Err(ApiError::not_found("task not found"));
    };
    let logs = db.list_task_logs(&id).await?;
    Ok(Json(TaskResponse { task, logs }))
}

async fn update_daemon(
    State(state): State<Arc<AppState>>,
    Json(change): Json<DaemonChange>,
) -> Result<Json<DaemonResponse>, ApiError> {
    let changed = state.services.daemon.apply(change).await?;
    Ok(Json(DaemonResponse { changed }))
}
