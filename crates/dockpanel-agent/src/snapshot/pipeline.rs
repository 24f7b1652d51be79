//! The eight snapshot steps and the resume rule that picks which of them run.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{
    SNAPSHOT_DIR, SnapshotEngine,
    tree::{self, DataTree},
};
use crate::{
    archive::{self, Excludes},
    config::Config,
    daemon,
    db::{self, Db, Filter, table_exists},
    model::{BackupRecord, Snapshot, status},
    task::{NO_ROLLBACK, Task, TaskCtx},
    transport::split_ids,
};

const BINARIES: &[&str] = &["dockpanel-core", "dockpanel-agent", "dockpanel-ctl"];
const UNITS: &[&str] = &["dockpanel-core.service", "dockpanel-agent.service"];
const BACKUP_ARCHIVE: &str = "1panel_backup.tar.gz";
const DATA_ARCHIVE: &str = "1panel_data.tar.gz";
const WEBSITE_ARCHIVE: &str = "website.tar.gz";
const IMAGES_ARCHIVE: &str = "images.tar.gz";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    DbInfo,
    BaseInfo,
    InstallApp,
    LocalBackup,
    PanelData,
    CloseDbConn,
    Compress,
    Upload,
}

impl Step {
    pub(crate) const ALL: [Step; 8] = [
        Step::DbInfo,
        Step::BaseInfo,
        Step::InstallApp,
        Step::LocalBackup,
        Step::PanelData,
        Step::CloseDbConn,
        Step::Compress,
        Step::Upload,
    ];

    pub(crate) fn alias(self) -> &'static str {
        match self {
            Step::DbInfo => "SnapDBInfo",
            Step::BaseInfo => "SnapBaseInfo",
            Step::InstallApp => "SnapInstallApp",
            Step::LocalBackup => "SnapLocalBackup",
            Step::PanelData => "SnapPanelData",
            Step::CloseDbConn => "SnapCloseDBConn",
            Step::Compress => "SnapCompress",
            Step::Upload => "SnapUpload",
        }
    }

    /// Opening and closing the staged store run on every attempt.
    fn always_runs(self) -> bool {
        matches!(self, Step::DbInfo | Step::CloseDbConn)
    }
}

/// Steps to run for a snapshot whose last attempt stopped at `interrupt_step`.
pub(crate) fn planned_steps(interrupt_step: &str) -> Vec<Step> {
    let resumable = Step::ALL
        .iter()
        .any(|s| !s.always_runs() && s.alias() == interrupt_step);
    let mut resume = if resumable { interrupt_step } else { "" };
    let mut out = Vec::new();
    for step in Step::ALL {
        if !step.always_runs() {
            if !resume.is_empty() && resume != step.alias() {
                continue;
            }
            resume = "";
        }
        out.push(step);
    }
    out
}

/// Inputs of one pipeline run plus the staged store handle shared across steps.
pub(crate) struct SnapJob {
    snap: Snapshot,
    app_data: Vec<DataTree>,
    panel_data: Vec<DataTree>,
    backup_data: Vec<DataTree>,
    ignore_files: Vec<String>,
    staging: PathBuf,
    archive: PathBuf,
    staged_db: Mutex<Option<Db>>,
}

fn parse_tree(raw: &str, field: &str) -> anyhow::Result<Vec<DataTree>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).with_context(|| format!("parse snapshot {field}"))
}

impl SnapJob {
    pub(crate) fn from_snapshot(config: &Config, snap: &Snapshot) -> anyhow::Result<Self> {
        Ok(Self {
            app_data: parse_tree(&snap.app_data, "app data")?,
            panel_data: parse_tree(&snap.panel_data, "panel data")?,
            backup_data: parse_tree(&snap.backup_data, "backup data")?,
            ignore_files: split_ids(&snap.ignore_files),
            staging: config.snapshot_staging_dir(&snap.name),
            archive: config
                .snapshot_root_dir()
                .join(format!("{}.tar.gz", snap.name)),
            staged_db: Mutex::new(None),
            snap: snap.clone(),
        })
    }

    async fn staged(&self) -> anyhow::Result<Db> {
        self.staged_db
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("staged database is not open"))
    }
}

pub(crate) fn add_steps(engine: &SnapshotEngine, task: &mut Task, job: Arc<SnapJob>) {
    let config = &engine.svc.config;
    for step in planned_steps(&job.snap.interrupt_step) {
        let (engine, job) = (engine.clone(), job.clone());
        task.add_sub_task_with(
            step.alias(),
            move |t| {
                let (engine, job) = (engine.clone(), job.clone());
                async move { engine.run_step(&t, &job, step).await }
            },
            NO_ROLLBACK,
            config.snapshot_retry,
            config.snapshot_step_timeout,
        );
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotJson {
    base_dir: String,
    operesty_dir: String,
    backup_data_dir: String,
    size: u64,
}

fn size_label(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Adds a user supplied ignore pattern; absolute paths only count when they fall under `root`.
fn push_ignore(excludes: &mut Excludes, root: &Path, pattern: &str) {
    let path = Path::new(pattern);
    if path.is_absolute() {
        if let Some(rel) = tree::rel_to(path, root) {
            excludes.push(&rel);
        }
    } else {
        excludes.push(pattern);
    }
}

async fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

async fn copy_logged(t: &TaskCtx, src: &Path, dst: &Path) -> anyhow::Result<()> {
    let res = archive::copy_file(src, dst).await;
    t.log_with_status(&format!("Copy {}", src.display()), res.as_ref().err())
        .await;
    res
}

impl SnapshotEngine {
    async fn run_step(&self, t: &TaskCtx, job: &SnapJob, step: Step) -> anyhow::Result<()> {
        match step {
            Step::DbInfo => self.snap_db_info(t, job).await,
            Step::BaseInfo => self.snap_base_info(t, job).await,
            Step::InstallApp => self.snap_install_app(t, job).await,
            Step::LocalBackup => self.snap_local_backup(t, job).await,
            Step::PanelData => self.snap_panel_data(t, job).await,
            Step::CloseDbConn => snap_close_db(t, job).await,
            Step::Compress => self.snap_compress(t, job).await,
            Step::Upload => self.snap_upload(t, job).await,
        }
    }

    async fn snap_db_info(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let config = &self.svc.config;
        let staged = job.staging.join("db");
        archive::remove_dir_if_exists(&staged).await?;
        let res = archive::copy_dir(&config.db_dir, &staged, true).await;
        t.log_with_status(&format!("Copy {}", config.db_dir.display()), res.as_ref().err())
            .await;
        res?;

        let snap = &job.snap;
        if !snap.with_monitor_data {
            remove_file_if_exists(&staged.join("monitor.db")).await?;
        }
        if !snap.with_task_log {
            remove_file_if_exists(&staged.join("task.db")).await?;
        }

        let db = Db::open_existing(&staged.join("agent.db")).await?;
        let name = snap.name.clone();
        let task_id = t.id.clone();
        let (keep_ops, keep_logins, keep_tasks) =
            (snap.with_operation_log, snap.with_login_log, snap.with_task_log);
        db.tx(move |tx| {
            db::delete::<Snapshot>(tx, &[Filter::Name(name)])?;
            // The running snapshot task is still in flight in the copy.
            if keep_tasks {
                for (table, column) in [("task_logs", "task_id"), ("tasks", "id")] {
                    if table_exists(tx, table)? {
                        tx.execute(&format!("DELETE FROM {table} WHERE {column} = ?1"), [&task_id])?;
                    }
                }
            }
            let mut cleared = Vec::new();
            if !keep_ops {
                cleared.push("operation_logs");
            }
            if !keep_logins {
                cleared.push("login_logs");
            }
            if !keep_tasks {
                cleared.extend(["task_logs", "tasks"]);
            }
            for table in cleared {
                if table_exists(tx, table)? {
                    tx.execute(&format!("DELETE FROM {table}"), [])?;
                }
            }
            Ok(())
        })
        .await?;

        if let Some(old) = job.staged_db.lock().await.replace(db)
            && let Err(e) = old.close().await
        {
            t.warn(format!("close previous staged database: {e:#}")).await;
        }
        Ok(())
    }

    async fn snap_base_info(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let config = &self.svc.config;
        let base = job.staging.join("base");
        tokio::fs::create_dir_all(&base).await?;

        for bin in BINARIES {
            let src = config.bin_dir.join(bin);
            if tokio::fs::try_exists(&src).await.unwrap_or(false) {
                copy_logged(t, &src, &base.join(bin)).await?;
            }
        }
        for unit in UNITS {
            let src = config.systemd_dir.join(unit);
            if tokio::fs::try_exists(&src).await.unwrap_or(false) {
                copy_logged(t, &src, &base.join(unit)).await?;
            }
        }
        if job.snap.with_docker_conf
            && tokio::fs::try_exists(&config.daemon_json_path)
                .await
                .unwrap_or(false)
        {
            copy_logged(t, &config.daemon_json_path, &base.join("daemon.json")).await?;
        }

        let info = SnapshotJson {
            base_dir: config.base_dir.to_string_lossy().to_string(),
            operesty_dir: config
                .openresty_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            backup_data_dir: config.backup_dir.to_string_lossy().to_string(),
            size: archive::dir_size(&config.data_dir).await,
        };
        let target = base.join("snapshot.json");
        let res = async {
            let raw = daemon::to_tab_json(&serde_json::to_value(&info)?)?;
            tokio::fs::write(&target, raw).await?;
            anyhow::Ok(())
        }
        .await;
        t.log_with_status(&format!("Write {}", target.display()), res.as_ref().err())
            .await;
        res
    }

    async fn snap_install_app(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let db = job.staged().await?;
        let marked = db
            .tx(|tx| {
                Ok(tx.execute(
                    "UPDATE app_installs SET status = ?1",
                    [status::WAITING_RESTART],
                )?)
            })
            .await?;
        t.log(format!("Marked {marked} installs to restart after recovery"))
            .await;

        let existing = self.svc.container.list_images().await?;
        let images: Vec<String> = tree::selected_images(&job.app_data)
            .into_iter()
            .filter(|image| existing.contains(image))
            .collect();
        if images.is_empty() {
            t.log("No app images selected").await;
            return Ok(());
        }
        let res = self
            .svc
            .container
            .save_images(&images, &job.staging.join(IMAGES_ARCHIVE))
            .await;
        t.log_with_status(&format!("Save images {}", images.join(" ")), res.as_ref().err())
            .await;
        res
    }

    async fn snap_local_backup(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let root = &self.svc.config.backup_dir;
        tokio::fs::create_dir_all(root).await?;

        let mut excludes = Excludes::default();
        let mut stale = Vec::new();
        let unchecked = tree::unchecked_leaves(&job.backup_data)
            .into_iter()
            .chain(tree::unchecked_app_backups(&job.app_data));
        for leaf in unchecked {
            let Some(rel) = tree::rel_to(Path::new(&leaf.path), root) else {
                continue;
            };
            excludes.push(&rel);
            let rel = Path::new(&rel);
            stale.push((
                rel.parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
                rel.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ));
        }
        for pattern in &job.ignore_files {
            push_ignore(&mut excludes, root, pattern);
        }
        excludes.push(SNAPSHOT_DIR);

        if !stale.is_empty() {
            let db = job.staged().await?;
            let removed = db
                .tx(move |tx| {
                    let mut removed = 0;
                    for (dir, file) in stale {
                        removed += db::delete::<BackupRecord>(
                            tx,
                            &[Filter::Eq("file_dir", dir.into()), Filter::FileName(file)],
                        )?;
                    }
                    Ok(removed)
                })
                .await?;
            t.log(format!("Dropped {removed} unselected backup records")).await;
        }

        let res = archive::tar_gz_dir(root, &job.staging.join(BACKUP_ARCHIVE), excludes).await;
        t.log_with_status(&format!("Compress {}", root.display()), res.as_ref().err())
            .await;
        res
    }

    async fn snap_panel_data(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let config = &self.svc.config;
        let root = &config.data_dir;
        tokio::fs::create_dir_all(root).await?;

        let mut excludes = Excludes::new(["./cache", "./db", "./tmp"]);
        for leaf in tree::unchecked_leaves(&job.panel_data) {
            if let Some(rel) = tree::rel_to(Path::new(&leaf.path), root) {
                excludes.push(&rel);
            }
        }
        for path in tree::unchecked_app_data(&job.app_data) {
            if let Some(rel) = tree::rel_to(&path, root) {
                excludes.push(&rel);
            }
        }
        if !job.snap.with_system_log {
            excludes.push("./log/1Panel*");
        }
        if !job.snap.with_task_log {
            excludes.push("./log/task");
        }
        let owned_elsewhere = [
            Some(&config.backup_dir),
            Some(&config.tmp_dir),
            Some(&config.db_dir),
            config.openresty_dir.as_ref(),
        ];
        for dir in owned_elsewhere.into_iter().flatten() {
            if let Some(rel) = tree::rel_to(dir, root) {
                excludes.push(&rel);
            }
        }
        for pattern in &job.ignore_files {
            push_ignore(&mut excludes, root, pattern);
        }

        let res = archive::tar_gz_dir(root, &job.staging.join(DATA_ARCHIVE), excludes).await;
        t.log_with_status(&format!("Compress {}", root.display()), res.as_ref().err())
            .await;
        res?;

        if let Some(site) = &config.openresty_dir {
            if !tokio::fs::try_exists(site).await.unwrap_or(false) {
                t.warn(format!("website dir {} does not exist", site.display()))
                    .await;
                return Ok(());
            }
            let res =
                archive::tar_gz_dir(site, &job.staging.join(WEBSITE_ARCHIVE), Excludes::default())
                    .await;
            t.log_with_status(&format!("Compress {}", site.display()), res.as_ref().err())
                .await;
            res?;
        }
        Ok(())
    }

    async fn snap_compress(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let res = archive::tar_gz_dir(&job.staging, &job.archive, Excludes::default()).await;
        t.log_with_status("Compress snapshot", res.as_ref().err()).await;
        res?;

        let secret = &job.snap.secret;
        if !secret.is_empty() {
            let res = archive::encrypt_file(self.svc.runner.as_ref(), &job.archive, secret).await;
            t.log_with_status("Encrypt snapshot", res.as_ref().err()).await;
            res?;
        }

        let size = tokio::fs::metadata(&job.archive)
            .await
            .with_context(|| format!("stat {}", job.archive.display()))?
            .len();
        t.log(format!("Snapshot archive size {}", size_label(size)))
            .await;
        archive::remove_dir_if_exists(&job.staging).await
    }

    async fn snap_upload(&self, t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
        let clients = self
            .svc
            .transports
            .new_backup_client_map(&split_ids(&job.snap.source_account_ids))
            .await?;
        let file_name = format!("{}.tar.gz", job.snap.name);
        for client in clients {
            let remote = client.remote_path(&[SNAPSHOT_DIR, &file_name]);
            let res = client.client.upload(&job.archive, &remote).await;
            t.log_with_status(
                &format!("Upload {file_name} to {}", client.name),
                res.as_ref().err(),
            )
            .await;
            res?;
        }
        remove_file_if_exists(&job.archive).await
    }
}

async fn snap_close_db(t: &TaskCtx, job: &SnapJob) -> anyhow::Result<()> {
    if let Some(db) = job.staged_db.lock().await.take() {
        db.close().await?;
        t.log("Closed staged database").await;
    }
    Ok(())
}
