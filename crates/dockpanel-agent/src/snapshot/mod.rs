//! Whole-panel snapshots: create, resume, import, delete and search.

mod pipeline;
mod tree;

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};

pub use tree::{DataTree, SnapshotData};

use crate::{
    app::AppEngine,
    archive,
    db::Filter,
    error::PanelError,
    ids,
    model::{BackupRecord, Snapshot, status},
    state::Services,
    task::{NewTask, StepError, TaskCtx, kind, scope},
    transport::split_ids,
};

pub(crate) const SNAPSHOT_DIR: &str = "system_snapshot";
const BACKUP_KIND: &str = "snapshot";

/// Names this agent and the upstream tool give their snapshot archives.
const IMPORT_PREFIXES: &[&str] = &[
    "dockpanel-core-v2.",
    "dockpanel-agent-v2.",
    "dockpanel-v2.",
    "snapshot-dockpanel-core-v2.",
    "snapshot-dockpanel-agent-v2.",
    "1panel-core-v2.",
    "1panel-agent-v2.",
    "1panel-v2.",
    "snapshot-1panel-core-v2.",
    "snapshot-1panel-agent-v2.",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotCreate {
    pub source_account_ids: String,
    pub download_account_id: i64,
    pub secret: String,
    pub description: String,
    pub app_data: Vec<DataTree>,
    pub panel_data: Vec<DataTree>,
    pub backup_data: Vec<DataTree>,
    pub with_docker_conf: bool,
    pub with_monitor_data: bool,
    pub with_login_log: bool,
    pub with_operation_log: bool,
    pub with_task_log: bool,
    pub with_system_log: bool,
    pub ignore_files: Vec<String>,
    /// Resume from this step instead of the first.
    pub interrupt_step: String,
    pub task_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotImport {
    pub backup_account_id: i64,
    pub names: Vec<String>,
    pub description: String,
}

/// Parsed `<prefix><version>-linux-<arch>-<stamp>.tar.gz`.
#[derive(Debug, PartialEq)]
pub(crate) struct SnapshotFileName<'a> {
    pub short: &'a str,
    pub version: &'a str,
    pub arch: &'a str,
}

pub(crate) fn parse_snapshot_file(name: &str) -> Option<SnapshotFileName<'_>> {
    let short = name.strip_suffix(".tar.gz")?;
    if !IMPORT_PREFIXES.iter().any(|p| short.starts_with(p)) {
        return None;
    }
    let (version, rest) = short.split_once("-linux-")?;
    let (arch, stamp) = rest.split_once('-')?;
    if arch.is_empty() || stamp.is_empty() {
        return None;
    }
    Some(SnapshotFileName {
        short,
        version,
        arch,
    })
}

#[derive(Clone)]
pub struct SnapshotEngine {
    svc: Arc<Services>,
    apps: AppEngine,
}

impl SnapshotEngine {
    pub fn new(svc: Arc<Services>) -> Self {
        Self {
            apps: AppEngine::new(svc.clone()),
            svc,
        }
    }

    fn snapshot_name(&self) -> anyhow::Result<String> {
        let config = &self.svc.config;
        Ok(format!(
            "dockpanel-agent-{}-linux-{}-{}",
            config.version,
            config.arch,
            ids::slim_timestamp()?
        ))
    }

    /// Stores a `waiting` snapshot and starts its pipeline in the background.
    pub async fn create(&self, req: SnapshotCreate) -> anyhow::Result<Snapshot> {
        let db = &self.svc.db;
        self.svc
            .transports
            .new_backup_client_map(&split_ids(&req.source_account_ids))
            .await?;

        let name = self.snapshot_name()?;
        if db.first::<Snapshot>(vec![Filter::Name(name.clone())]).await?.is_some() {
            return Err(PanelError::RecordExist.into());
        }
        let snap = db
            .create(Snapshot {
                name,
                version: self.svc.config.version.clone(),
                status: status::WAITING.to_string(),
                interrupt_step: req.interrupt_step.clone(),
                secret: req.secret,
                source_account_ids: req.source_account_ids,
                download_account_id: req.download_account_id,
                app_data: serde_json::to_string(&req.app_data)?,
                panel_data: serde_json::to_string(&req.panel_data)?,
                backup_data: serde_json::to_string(&req.backup_data)?,
                with_docker_conf: req.with_docker_conf,
                with_monitor_data: req.with_monitor_data,
                with_login_log: req.with_login_log,
                with_operation_log: req.with_operation_log,
                with_task_log: req.with_task_log,
                with_system_log: req.with_system_log,
                ignore_files: req.ignore_files.join(","),
                description: req.description,
                task_id: req.task_id.unwrap_or_else(ids::new_task_id),
                created_at: ids::now_rfc3339()?,
                ..Default::default()
            })
            .await?;
        tracing::info!(snapshot = %snap.name, "snapshot queued");
        self.launch(snap.clone(), kind::CREATE).await?;
        Ok(snap)
    }

    /// Runs a stored snapshot again, resuming from its interrupt step. Returns the task id.
    pub async fn recreate(&self, id: i64) -> anyhow::Result<String> {
        let mut snap: Snapshot = self.svc.db.must(vec![Filter::Id(id)]).await?;
        snap.status = status::WAITING.to_string();
        snap.message = String::new();
        self.launch(snap, kind::RECREATE).await
    }

    async fn launch(&self, mut snap: Snapshot, task_kind: &str) -> anyhow::Result<String> {
        let mut task = self
            .svc
            .tasks
            .new_task(NewTask {
                name: snap.name.clone(),
                kind: task_kind,
                scope: scope::SNAPSHOT,
                task_id: Some(snap.task_id.clone()),
                resource_id: snap.id,
            })
            .await?;
        self.svc.db.save(&mut snap).await?;

        let job = pipeline::SnapJob::from_snapshot(&self.svc.config, &snap)?;
        pipeline::add_steps(self, &mut task, Arc::new(job));

        let engine = self.clone();
        Ok(task.run_async_then(move |t, outcome| async move {
            engine.finish(&t, snap, outcome).await;
        }))
    }

    async fn finish(&self, t: &TaskCtx, snap: Snapshot, outcome: Result<(), StepError>) {
        let fields = match &outcome {
            Ok(()) => vec![
                ("status", status::SUCCESS.to_string().into()),
                ("message", String::new().into()),
                ("interrupt_step", String::new().into()),
            ],
            Err(e) => vec![
                ("status", status::FAILED.to_string().into()),
                ("message", archive::mask_secret(&e.message, &snap.secret).into()),
                ("interrupt_step", e.step.clone().into()),
            ],
        };
        if let Err(e) = self.svc.db.update::<Snapshot>(snap.id, fields).await {
            t.warn(format!("persist snapshot status: {e:#}")).await;
        }
        if outcome.is_ok() {
            let staging = self.svc.config.snapshot_staging_dir(&snap.name);
            if let Err(e) = archive::remove_dir_if_exists(&staging).await {
                t.warn(format!("remove staging dir: {e:#}")).await;
            }
            tracing::info!(snapshot = %snap.name, "snapshot created");
        } else {
            tracing::warn!(snapshot = %snap.name, "snapshot failed");
        }
    }

    /// Registers snapshot archives that already sit on a backup account.
    pub async fn import(&self, req: SnapshotImport) -> anyhow::Result<Vec<Snapshot>> {
        if req.names.is_empty() {
            return Err(PanelError::FileParse {
                detail: "empty snapshot list".to_string(),
            }
            .into());
        }
        let db = &self.svc.db;
        self.svc
            .transports
            .new_backup_client_map(&[req.backup_account_id.to_string()])
            .await?;

        let mut parsed = Vec::with_capacity(req.names.len());
        let mut seen = HashSet::new();
        for name in &req.names {
            let file = parse_snapshot_file(name).ok_or_else(|| PanelError::FileParse {
                detail: format!("snapshot file name {name}"),
            })?;
            // Repeats within one request import once.
            if !seen.insert(file.short) {
                continue;
            }
            if db
                .first::<Snapshot>(vec![Filter::Name(file.short.to_string())])
                .await?
                .is_some()
            {
                return Err(PanelError::RecordExist.into());
            }
            parsed.push(file);
        }

        let mut out = Vec::with_capacity(parsed.len());
        for file in parsed {
            let snap = db
                .create(Snapshot {
                    name: file.short.to_string(),
                    version: file.version.to_string(),
                    status: status::SUCCESS.to_string(),
                    source_account_ids: req.backup_account_id.to_string(),
                    download_account_id: req.backup_account_id,
                    description: req.description.clone(),
                    created_at: ids::now_rfc3339()?,
                    ..Default::default()
                })
                .await?;
            tracing::info!(snapshot = %snap.name, arch = file.arch, "snapshot imported");
            out.push(snap);
        }
        Ok(out)
    }

    /// Removes snapshot rows, and with `with_file` their archives on every source account.
    pub async fn delete(&self, ids: Vec<i64>, with_file: bool) -> anyhow::Result<()> {
        let db = &self.svc.db;
        let snaps: Vec<Snapshot> = db.list(vec![Filter::Ids(ids)]).await?;
        if let Some(busy) = snaps
            .iter()
            .find(|s| self.svc.tasks.is_active(scope::SNAPSHOT, s.id))
        {
            return Err(PanelError::Busy {
                name: busy.name.clone(),
            }
            .into());
        }

        for snap in snaps {
            let file_name = format!("{}.tar.gz", snap.name);
            if with_file {
                self.delete_remote(&snap, &file_name).await;
                db.delete::<BackupRecord>(vec![
                    Filter::Type(BACKUP_KIND.to_string()),
                    Filter::FileName(file_name.clone()),
                ])
                .await?;
            }
            let config = &self.svc.config;
            archive::remove_dir_if_exists(&config.snapshot_staging_dir(&snap.name)).await?;
            let local = config.snapshot_root_dir().join(&file_name);
            if let Err(e) = tokio::fs::remove_file(&local).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %local.display(), error = %e, "remove local snapshot failed");
            }
            db.delete::<Snapshot>(vec![Filter::Id(snap.id)]).await?;
            tracing::info!(snapshot = %snap.name, with_file, "snapshot deleted");
        }
        Ok(())
    }

    async fn delete_remote(&self, snap: &Snapshot, file_name: &str) {
        let clients = match self
            .svc
            .transports
            .new_backup_client_map(&split_ids(&snap.source_account_ids))
            .await
        {
            Ok(clients) => clients,
            Err(e) => {
                tracing::warn!(snapshot = %snap.name, error = %e, "resolve backup accounts failed");
                return;
            }
        };
        for client in clients {
            let remote = client.remote_path(&[SNAPSHOT_DIR, file_name]);
            if let Err(e) = client.client.delete(&remote).await {
                tracing::warn!(account = %client.name, remote, error = %e, "delete remote snapshot failed");
            }
        }
    }

    pub async fn update_description(&self, id: i64, description: String) -> anyhow::Result<()> {
        let db = &self.svc.db;
        db.must::<Snapshot>(vec![Filter::Id(id)]).await?;
        db.update::<Snapshot>(id, vec![("description", description.into())])
            .await
    }

    /// One page of snapshots, newest first, optionally filtered by a name fragment.
    pub async fn search(
        &self,
        page: i64,
        size: i64,
        info: &str,
    ) -> anyhow::Result<(i64, Vec<Snapshot>)> {
        let mut filters = vec![Filter::OrderBy("created_at DESC, id DESC")];
        if !info.trim().is_empty() {
            filters.push(Filter::LikeName(info.trim().to_string()));
        }
        self.svc.db.page(page, size, filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::panel_error, model::BackupAccount, testing, transport::LOCAL};

    async fn local_account(svc: &Services, root: &std::path::Path) -> BackupAccount {
        svc.db
            .create(BackupAccount {
                name: "localhost".to_string(),
                kind: LOCAL.to_string(),
                backup_path: root.to_string_lossy().to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn snapshot_file_names_follow_the_grammar() {
        let parsed =
            parse_snapshot_file("snapshot-1panel-core-v2.1.0-linux-amd64-20240101-000000.tar.gz")
                .unwrap();
        assert_eq!(parsed.version, "snapshot-1panel-core-v2.1.0");
        assert_eq!(parsed.arch, "amd64");
        assert_eq!(
            parsed.short,
            "snapshot-1panel-core-v2.1.0-linux-amd64-20240101-000000"
        );
        assert!(parse_snapshot_file("dockpanel-agent-v2.0.0-linux-arm64-20250101000000.tar.gz").is_some());
        assert!(parse_snapshot_file("random.tar.gz").is_none());
        assert!(parse_snapshot_file("1panel-v2.0.0-linux-amd64-1.zip").is_none());
        assert!(parse_snapshot_file("snapshot-1panel-v2.0.0-linux-amd64-1.tar.gz").is_none());
        assert!(parse_snapshot_file("1panel-v2.0.0-darwin.tar.gz").is_none());
    }

    #[tokio::test]
    async fn import_rejects_unknown_names_and_duplicates() {
        let (svc, fakes) = testing::services("snap-import").await;
        let engine = SnapshotEngine::new(svc.clone());
        let account = local_account(&svc, &fakes.root.join("remote")).await;

        let err = engine
            .import(SnapshotImport {
                backup_account_id: account.id,
                names: vec!["random.tar.gz".to_string()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::FileParse { .. })));
        assert_eq!(svc.db.count::<Snapshot>(vec![]).await.unwrap(), 0);

        let req = SnapshotImport {
            backup_account_id: account.id,
            names: vec!["snapshot-1panel-core-v2.1.0-linux-amd64-20240101-000000.tar.gz".to_string()],
            description: "from old host".to_string(),
        };
        let imported = engine.import(req.clone()).await.unwrap();
        assert_eq!(imported.len(), 1);
        let snap: Snapshot = svc.db.must(vec![Filter::Id(imported[0].id)]).await.unwrap();
        assert_eq!(snap.version, "snapshot-1panel-core-v2.1.0");
        assert_eq!(snap.status, status::SUCCESS);
        assert_eq!(snap.interrupt_step, "");
        assert_eq!(snap.source_account_ids, account.id.to_string());
        assert_eq!(snap.download_account_id, account.id);

        let err = engine.import(req).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::RecordExist)));
    }

    #[tokio::test]
    async fn import_collapses_repeated_names() {
        let (svc, fakes) = testing::services("snap-import-repeat").await;
        let engine = SnapshotEngine::new(svc.clone());
        let account = local_account(&svc, &fakes.root.join("remote")).await;
        let name = "dockpanel-agent-v2.0.0-linux-amd64-20250101000000.tar.gz";

        let imported = engine
            .import(SnapshotImport {
                backup_account_id: account.id,
                names: vec![
                    name.to_string(),
                    "1panel-v2.0.1-linux-amd64-20240101000000.tar.gz".to_string(),
                    name.to_string(),
                ],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(imported.len(), 2);
        assert_eq!(svc.db.count::<Snapshot>(vec![]).await.unwrap(), 2);
        assert_eq!(
            svc.db
                .count::<Snapshot>(vec![Filter::Name(
                    "dockpanel-agent-v2.0.0-linux-amd64-20250101000000".to_string()
                )])
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn delete_with_file_removes_remote_archive_and_records() {
        let (svc, fakes) = testing::services("snap-delete").await;
        let engine = SnapshotEngine::new(svc.clone());
        let remote = fakes.root.join("remote");
        let account = local_account(&svc, &remote).await;
        let name = "dockpanel-agent-v2.0.0-linux-amd64-20250101000000";
        let archive = remote.join(SNAPSHOT_DIR).join(format!("{name}.tar.gz"));
        tokio::fs::create_dir_all(archive.parent().unwrap()).await.unwrap();
        tokio::fs::write(&archive, "tgz").await.unwrap();

        let imported = engine
            .import(SnapshotImport {
                backup_account_id: account.id,
                names: vec![format!("{name}.tar.gz")],
                ..Default::default()
            })
            .await
            .unwrap();
        svc.db
            .create(BackupRecord {
                kind: BACKUP_KIND.to_string(),
                name: "system".to_string(),
                file_name: format!("{name}.tar.gz"),
                ..Default::default()
            })
            .await
            .unwrap();

        engine
            .update_description(imported[0].id, "weekly".to_string())
            .await
            .unwrap();
        let (total, page) = engine.search(1, 10, "linux-amd64").await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].description, "weekly");
        assert_eq!(engine.search(1, 10, "nothing").await.unwrap().0, 0);

        engine.delete(vec![imported[0].id], true).await.unwrap();
        assert!(!archive.exists());
        assert_eq!(svc.db.count::<Snapshot>(vec![]).await.unwrap(), 0);
        assert_eq!(svc.db.count::<BackupRecord>(vec![]).await.unwrap(), 0);
    }
}
