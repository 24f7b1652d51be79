//! Selection trees offered when creating a snapshot.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::SnapshotEngine;
use crate::{
    archive, compose,
    model::{AppInstall, AppInstallResource},
};

pub const APP_DATA: &str = "appData";
pub const APP_BACKUP: &str = "appBackup";
pub const APP_IMAGE: &str = "appImage";

const FILE_DEPTH: usize = 8;
const PANEL_SKIPPED: &[&str] = &["apps", "backup", "log", "db", "tmp"];
const PANEL_LOCKED: &[&str] = &["agent", "runtime", "docker", "task", "geo", "secret", "uploads"];
const PANEL_EXPANDED: &[&str] = &["clamav", "download"];
const BACKUP_SKIPPED: &[&str] = &["app", "system_snapshot"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataTree {
    pub id: String,
    pub label: String,
    pub key: String,
    pub name: String,
    pub size: u64,
    pub is_check: bool,
    pub is_disable: bool,
    pub path: String,
    #[serde(rename = "relationItemID")]
    pub relation_item_id: String,
    pub children: Vec<DataTree>,
}

impl DataTree {
    fn entry(label: &str, path: &Path, size: u64) -> Self {
        Self {
            id: crate::ids::new_tree_id(),
            label: label.to_string(),
            name: label.to_string(),
            path: path.to_string_lossy().to_string(),
            size,
            is_check: true,
            ..Default::default()
        }
    }
}

/// Leaves the user deselected, depth first.
pub(crate) fn unchecked_leaves(trees: &[DataTree]) -> Vec<&DataTree> {
    let mut out = Vec::new();
    collect_unchecked(trees, &mut out);
    out
}

fn collect_unchecked<'a>(trees: &'a [DataTree], out: &mut Vec<&'a DataTree>) {
    for item in trees {
        if item.children.is_empty() {
            if !item.is_check {
                out.push(item);
            }
        } else {
            collect_unchecked(&item.children, out);
        }
    }
}

/// `path` relative to `root`, or `None` when it lives elsewhere.
pub(crate) fn rel_to(path: &Path, root: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub app_data: Vec<DataTree>,
    pub panel_data: Vec<DataTree>,
    pub backup_data: Vec<DataTree>,
}

/// Lists `dir` down to `depth` levels. Unreadable entries are skipped.
fn load_file(dir: &Path, depth: usize) -> anyhow::Result<Vec<DataTree>> {
    if !dir.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", dir.display()));
    }
    let mut data = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let label = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let mut item = if entry.file_type().is_dir() {
            DataTree::entry(&label, path, archive::dir_size_blocking(path))
        } else {
            let Ok(meta) = entry.metadata() else { continue };
            DataTree::entry(&label, path, meta.len())
        };
        if entry.file_type().is_dir() && depth > 1 {
            item.children = load_file(path, depth - 1).unwrap_or_default();
        }
        data.push(item);
    }
    Ok(data)
}

fn load_panel_file(data_dir: &Path, openresty_dir: Option<&Path>) -> anyhow::Result<Vec<DataTree>> {
    let mut data = Vec::new();
    for entry in WalkDir::new(data_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let label = entry.file_name().to_string_lossy().to_string();
        if PANEL_SKIPPED.contains(&label.as_str()) {
            continue;
        }
        let size = if entry.file_type().is_dir() {
            archive::dir_size_blocking(entry.path())
        } else {
            match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            }
        };
        let mut item = DataTree::entry(&label, entry.path(), size);
        item.name = String::new();
        if PANEL_LOCKED.contains(&label.as_str()) {
            item.is_disable = true;
        } else if PANEL_EXPANDED.contains(&label.as_str()) {
            item.children = load_file(entry.path(), 3).unwrap_or_default();
        }
        if item.is_check && item.size == 0 {
            item.is_check = false;
            item.is_disable = true;
        }
        data.push(item);
    }

    if let Some(site) = openresty_dir
        && !site.starts_with(data_dir)
    {
        let mut item = DataTree::entry("www", site, archive::dir_size_blocking(site));
        item.is_disable = true;
        data.push(item);
    }
    Ok(data)
}

fn load_backup_file(backup_dir: &Path) -> Vec<DataTree> {
    load_file(backup_dir, FILE_DEPTH)
        .unwrap_or_default()
        .into_iter()
        .filter(|item| !BACKUP_SKIPPED.contains(&item.label.as_str()))
        .collect()
}

impl SnapshotEngine {
    /// Builds the app, panel and backup selection trees shown before a snapshot.
    pub async fn load_snapshot_data(&self) -> anyhow::Result<SnapshotData> {
        let app_data = self.load_apps().await?;
        let config = self.svc.config.clone();
        let (panel_data, backup_data) = tokio::task::spawn_blocking(move || {
            let panel = load_panel_file(&config.data_dir, config.openresty_dir.as_deref())?;
            anyhow::Ok((panel, load_backup_file(&config.backup_dir)))
        })
        .await??;
        Ok(SnapshotData {
            app_data,
            panel_data,
            backup_data,
        })
    }

    async fn load_apps(&self) -> anyhow::Result<Vec<DataTree>> {
        let db = &self.svc.db;
        let installs: Vec<AppInstall> = db.list(vec![]).await?;
        let relations: Vec<AppInstallResource> = db.list(vec![]).await?;

        let mut labels = HashMap::new();
        let mut apps = Vec::with_capacity(installs.len());
        for install in installs {
            let app = db.app_of(&install).await?;
            labels.insert(install.id, format!("{}-{}", app.key, install.name));
            apps.push((app, install));
        }
        let links: HashMap<i64, i64> = relations
            .iter()
            .map(|r| (r.app_install_id, r.link_id))
            .collect();

        let mut data = Vec::new();
        for (app, install) in apps {
            let mut item = DataTree {
                id: crate::ids::new_tree_id(),
                label: format!("{} - {}", app.name, install.name),
                key: app.key.clone(),
                name: install.name.clone(),
                ..Default::default()
            };

            let app_path = self.apps.install_dir(&app, &install.name);
            let mut app_data = DataTree::entry(APP_DATA, &app_path, archive::dir_size(&app_path).await);
            app_data.key = app.key.clone();
            app_data.name = install.name.clone();
            if let Some(link) = links.get(&install.id)
                && let Some(label) = labels.get(link)
            {
                app_data.relation_item_id = label.clone();
            }
            item.size += app_data.size;
            item.children.push(app_data);

            let backup_path = self.svc.config.app_backup_dir(&app.key, &install.name);
            let depth_path = backup_path.clone();
            if let Ok(Ok(children)) =
                tokio::task::spawn_blocking(move || load_file(&depth_path, FILE_DEPTH)).await
            {
                let mut backup = DataTree::entry(APP_BACKUP, &backup_path, archive::dir_size(&backup_path).await);
                backup.children = children;
                item.size += backup.size;
                item.children.push(backup);
            }

            let env = self.apps.install_env(&app, &install).await;
            match compose::get_images(&install.docker_compose, &env) {
                Ok(images) => {
                    for image in images {
                        item.children.push(DataTree {
                            id: crate::ids::new_tree_id(),
                            label: APP_IMAGE.to_string(),
                            name: image,
                            ..Default::default()
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(install = %install.name, error = %e, "resolve install images failed")
                }
            }
            data.push(item);
        }
        Ok(data)
    }
}

/// Checked image leaves of the app trees.
pub(crate) fn selected_images(app_data: &[DataTree]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for app in app_data {
        for child in &app.children {
            if child.label == APP_IMAGE && child.is_check && !child.name.is_empty() && !out.contains(&child.name) {
                out.push(child.name.clone());
            }
        }
    }
    out
}

/// Paths of unchecked `appData` leaves, which the panel archive leaves out.
pub(crate) fn unchecked_app_data(app_data: &[DataTree]) -> Vec<PathBuf> {
    app_data
        .iter()
        .flat_map(|app| app.children.iter())
        .filter(|child| child.label == APP_DATA && !child.is_check)
        .map(|child| PathBuf::from(&child.path))
        .collect()
}

/// Unchecked leaves below each `appBackup` node.
pub(crate) fn unchecked_app_backups(app_data: &[DataTree]) -> Vec<&DataTree> {
    let mut out = Vec::new();
    for child in app_data.iter().flat_map(|app| app.children.iter()) {
        if child.label == APP_BACKUP {
            collect_unchecked(&child.children, &mut out);
        }
    }
    out
}
