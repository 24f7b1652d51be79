//! Pre-upgrade backups of an install and the recovery that restores one.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

use super::AppEngine;
use crate::{
    archive::{self, Excludes},
    db::Filter,
    error::PanelError,
    ids,
    model::{App, AppInstall, BackupRecord},
    task::TaskCtx,
};

const BACKUP_KIND: &str = "app";
const UPGRADE_BACKUP_PREFIX: &str = "upgrade_backup_";
const KEEP_UPGRADE_BACKUPS: usize = 3;

impl AppEngine {
    /// Archives the install directory and its row, records it, and prunes older upgrade backups.
    pub(crate) async fn backup_install(
        &self,
        t: &TaskCtx,
        app: &App,
        install: &AppInstall,
    ) -> anyhow::Result<PathBuf> {
        self.write_backup(t, app, install)
            .await
            .map_err(|e| {
                PanelError::AppBackup {
                    name: install.name.clone(),
                    err: format!("{e:#}"),
                }
                .into()
            })
    }

    async fn write_backup(
        &self,
        t: &TaskCtx,
        app: &App,
        install: &AppInstall,
    ) -> anyhow::Result<PathBuf> {
        let config = &self.services().config;
        let backup_dir = config.app_backup_dir(&app.key, &install.name);
        tokio::fs::create_dir_all(&backup_dir).await?;
        let file_name = format!(
            "{UPGRADE_BACKUP_PREFIX}{}_{}{}.tar.gz",
            install.name,
            ids::slim_timestamp()?,
            ids::rand_suffix(5)
        );
        let archive_path = backup_dir.join(&file_name);

        let staging = config.tmp_dir.join(format!("app-backup-{}", ulid::Ulid::new()));
        let packed = async {
            tokio::fs::create_dir_all(&staging).await?;
            tokio::fs::write(staging.join("app.json"), serde_json::to_vec_pretty(install)?)
                .await?;
            archive::copy_dir(
                &self.install_dir(app, &install.name),
                &staging.join("app"),
                true,
            )
            .await?;
            archive::tar_gz_dir(&staging, &archive_path, Excludes::default()).await
        }
        .await;
        archive::remove_dir_if_exists(&staging).await?;
        packed?;

        self.services()
            .db
            .create(BackupRecord {
                kind: BACKUP_KIND.to_string(),
                name: app.key.clone(),
                detail_name: install.name.clone(),
                file_dir: format!("app/{}/{}", app.key, install.name),
                file_name: file_name.clone(),
                created_at: ids::now_rfc3339()?,
                ..Default::default()
            })
            .await?;
        t.log(format!("Backup {} to {}", install.name, archive_path.display()))
            .await;

        self.prune_upgrade_backups(app, install).await?;
        Ok(archive_path)
    }

    async fn prune_upgrade_backups(&self, app: &App, install: &AppInstall) -> anyhow::Result<()> {
        let db = &self.services().db;
        let records: Vec<BackupRecord> = db
            .list(vec![
                Filter::Type(BACKUP_KIND.to_string()),
                Filter::Name(app.key.clone()),
                Filter::DetailName(install.name.clone()),
                Filter::OrderBy("created_at ASC, id ASC"),
            ])
            .await?;
        let upgrades: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.file_name.starts_with(UPGRADE_BACKUP_PREFIX))
            .collect();
        let excess = upgrades.len().saturating_sub(KEEP_UPGRADE_BACKUPS);
        for record in &upgrades[..excess] {
            let path = self
                .services()
                .config
                .backup_dir
                .join(&record.file_dir)
                .join(&record.file_name);
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "remove old backup failed");
            }
            db.delete::<BackupRecord>(vec![Filter::Id(record.id)]).await?;
        }
        Ok(())
    }

    /// Puts an install back to the state captured in `archive`. Errors are logged to the task.
    pub(crate) async fn recover_install(
        &self,
        t: &TaskCtx,
        app: &App,
        install_id: i64,
        archive_path: &Path,
    ) {
        t.log(format!("Recover from {}", archive_path.display())).await;
        if let Err(e) = self.restore_backup(t, app, install_id, archive_path).await {
            t.log_failed("Recover app", &e).await;
        }
    }

    async fn restore_backup(
        &self,
        t: &TaskCtx,
        app: &App,
        install_id: i64,
        archive_path: &Path,
    ) -> anyhow::Result<()> {
        let mut install = self.install_by_id(install_id).await?;
        let staging = self
            .services()
            .config
            .tmp_dir
            .join(format!("app-recover-{}", ulid::Ulid::new()));
        archive::extract_tar_gz(archive_path, &staging).await?;

        let restored = async {
            let raw = tokio::fs::read(staging.join("app.json"))
                .await
                .context("read app.json from backup")?;
            let saved: AppInstall = serde_json::from_slice(&raw)?;

            let stack = self.stack(app, &install);
            if let Err(e) = self.services().compose().down(&stack).await {
                t.warn(format!("compose down before recover: {e}")).await;
            }
            let dir = self.install_dir(app, &install.name);
            archive::remove_dir_if_exists(&dir).await?;
            archive::copy_dir(&staging.join("app"), &dir, true).await?;

            install.version = saved.version;
            install.app_detail_id = saved.app_detail_id;
            install.docker_compose = saved.docker_compose;
            install.env = saved.env;
            install.param = saved.param;
            install.container_name = saved.container_name;
            self.save_install(&mut install).await?;

            self.services().compose().up(&stack).await?;
            anyhow::Ok(())
        }
        .await;
        archive::remove_dir_if_exists(&staging).await?;
        restored?;
        t.log_success("Recover app").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app::fixtures, model::app_type, task::NewTask, testing};

    #[tokio::test]
    async fn backups_beyond_three_are_pruned_and_restorable() {
        let (svc, _fakes) = testing::services("app-backup").await;
        let engine = AppEngine::new(svc.clone());
        let (app, _) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let install = svc
            .db
            .create(AppInstall {
                name: "mysql-1".to_string(),
                app_id: app.id,
                version: "8.0.35".to_string(),
                env: r#"{"A":"1"}"#.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let dir = engine.install_dir(&app, "mysql-1");
        tokio::fs::create_dir_all(dir.join("data")).await.unwrap();
        tokio::fs::write(dir.join("data/keep.txt"), "v1").await.unwrap();

        let task = svc
            .tasks
            .new_task(NewTask {
                name: "backup".to_string(),
                kind: crate::task::kind::BACKUP,
                scope: crate::task::scope::APP,
                task_id: None,
                resource_id: 0,
            })
            .await
            .unwrap();
        let t = task.ctx();

        let mut paths = Vec::new();
        for _ in 0..4 {
            paths.push(engine.backup_install(&t, &app, &install).await.unwrap());
        }
        let records: Vec<BackupRecord> = svc.db.list(vec![]).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(!paths[0].exists());
        assert!(paths[3].exists());
        assert!(records.iter().all(|r| r.file_dir == "app/mysql/mysql-1"));

        tokio::fs::write(dir.join("data/keep.txt"), "v2").await.unwrap();
        svc.db
            .update::<AppInstall>(install.id, vec![("version", "9.0".to_string().into())])
            .await
            .unwrap();
        engine.recover_install(&t, &app, install.id, &paths[3]).await;

        let restored = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(restored.version, "8.0.35");
        assert_eq!(
            tokio::fs::read_to_string(dir.join("data/keep.txt")).await.unwrap(),
            "v1"
        );
    }
}
