use serde::{Deserialize, Serialize};

use crate::{
    app::{InstalledView, Operate},
    db::CatalogueChanges,
    model::{Snapshot, TaskLogLine, TaskRecord},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub id: i64,
    pub name: String,
    pub task_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListInstalledQuery {
    pub updated_only: bool,
    pub sync: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInstalledResponse {
    pub items: Vec<InstalledView>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperateRequest {
    pub operate: Operate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdResponse {
    /// Empty when the operation finished inline.
    pub task_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPortRequest {
    pub port: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLocalResponse {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl From<CatalogueChanges> for SyncLocalResponse {
    fn from(c: CatalogueChanges) -> Self {
        Self {
            added: c.added,
            updated: c.updated,
            removed: c.removed,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotListQuery {
    pub page: i64,
    pub page_size: i64,
    pub info: String,
}

impl Default for SnapshotListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
            info: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotListResponse {
    pub total: i64,
    pub items: Vec<Snapshot>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotImportResponse {
    pub items: Vec<Snapshot>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotsRequest {
    pub ids: Vec<i64>,
    #[serde(default)]
    pub delete_with_file: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionRequest {
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task: TaskRecord,
    pub logs: Vec<TaskLogLine>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonResponse {
    pub changed: bool,
}
