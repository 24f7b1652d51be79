//! Persisted entities. Field names follow the table columns; JSON is camelCase.

use serde::{Deserialize, Serialize};

pub mod status {
    pub const NORMAL: &str = "normal";
    pub const TAKEDOWN: &str = "takedown";

    pub const INSTALLING: &str = "installing";
    pub const RUNNING: &str = "running";
    pub const STOPPED: &str = "stopped";
    pub const PAUSED: &str = "paused";
    pub const RESTARTING: &str = "restarting";
    pub const UNHEALTHY: &str = "unhealthy";
    pub const ERROR: &str = "error";
    pub const UP_ERR: &str = "up_err";
    pub const UPGRADING: &str = "upgrading";
    pub const UPGRADE_ERR: &str = "upgrade_err";
    pub const REBUILDING: &str = "rebuilding";
    pub const SYNCING: &str = "syncing";
    pub const UNINSTALLING: &str = "uninstalling";
    pub const INSTALL_ERR: &str = "install_err";
    pub const DOWNLOAD_ERR: &str = "download_err";
    pub const WAITING_RESTART: &str = "waiting_restart";

    pub const WAITING: &str = "waiting";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";

    /// Install statuses during which nothing else may touch the install.
    pub const BUSY: &[&str] = &[INSTALLING, UPGRADING, REBUILDING, UNINSTALLING];

    /// Install statuses the status sync leaves alone.
    pub const SYNC_SUPPRESSED: &[&str] = &[
        INSTALLING,
        REBUILDING,
        UPGRADING,
        SYNCING,
        UNINSTALLING,
        INSTALL_ERR,
    ];
}

pub mod app_type {
    pub const WEB: &str = "web";
    pub const TOOL: &str = "tool";
    pub const PHP: &str = "php";
    pub const WEBSITE: &str = "website";
    pub const RUNTIME: &str = "runtime";
}

pub mod resource {
    pub const REMOTE: &str = "remote";
    pub const LOCAL: &str = "local";
    pub const CUSTOM: &str = "custom";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub short_desc_zh: String,
    pub short_desc_en: String,
    pub description: String,
    pub icon: String,
    pub readme: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub resource: String,
    pub limit: i64,
    pub cross_version_update: bool,
    pub status: String,
    pub required_panel_version: f64,
    pub memory_required: i64,
    pub architectures: String,
    pub gpu_support: bool,
    pub website: String,
    pub github: String,
    pub document: String,
    pub recommend: i64,
    pub last_modified: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDetail {
    pub id: i64,
    pub app_id: i64,
    pub version: String,
    pub docker_compose: String,
    pub params: String,
    pub download_url: String,
    pub download_callback_url: String,
    pub status: String,
    pub update: bool,
    pub last_modified: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstall {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    pub app_detail_id: i64,
    pub version: String,
    pub status: String,
    pub message: String,
    pub service_name: String,
    pub container_name: String,
    pub http_port: i64,
    pub https_port: i64,
    pub env: String,
    pub docker_compose: String,
    pub param: String,
    pub webui: String,
    pub favorite: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstallResource {
    pub id: i64,
    pub app_install_id: i64,
    pub link_id: i64,
    pub resource_id: i64,
    pub from: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub address: String,
    pub port: i64,
    pub app_install_id: i64,
    pub username: String,
    pub password: String,
}

/// A schema inside a registered mysql/mariadb or postgresql server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    pub id: i64,
    pub name: String,
    /// `mysql` (also used for mariadb) or `postgresql`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Name of the owning server (the install name for local servers).
    pub server_name: String,
    pub from: String,
    pub username: String,
    pub password: String,
    pub format: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub status: String,
    pub message: String,
    pub interrupt_step: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub source_account_ids: String,
    pub download_account_id: i64,
    pub app_data: String,
    pub panel_data: String,
    pub backup_data: String,
    pub with_docker_conf: bool,
    pub with_monitor_data: bool,
    pub with_login_log: bool,
    pub with_operation_log: bool,
    pub with_task_log: bool,
    pub with_system_log: bool,
    pub ignore_files: String,
    pub description: String,
    pub task_id: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub scope: String,
    pub resource_id: i64,
    pub current_step: String,
    pub status: String,
    pub error_msg: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogLine {
    pub ts: String,
    pub level: String,
    pub msg: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub detail_name: String,
    pub file_dir: String,
    pub file_name: String,
    pub source_account_ids: String,
    pub download_account_id: i64,
    pub description: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAccount {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub bucket: String,
    pub backup_path: String,
    pub vars: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub credential: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIgnoreUpgrade {
    pub id: i64,
    pub app_id: i64,
    pub app_detail_id: i64,
    /// `all` or `version`.
    pub scope: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub sort: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTag {
    pub id: i64,
    pub app_id: i64,
    pub tag_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Launcher {
    pub id: i64,
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeAccount {
    pub id: i64,
    pub email: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub eab_kid: String,
    #[serde(skip_serializing)]
    pub eab_hmac_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteDomain {
    pub id: i64,
    pub website_id: i64,
    pub domain: String,
    pub port: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub port: i64,
    pub status: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub id: i64,
    pub key: String,
    pub value: String,
}
