use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use super::AppEngine;
use crate::{
    archive, compose,
    db::Filter,
    env_file,
    error::PanelError,
    model::{App, AppDetail, AppInstall, resource, status},
    task::{DEFAULT_STEP_TIMEOUT, NewTask, TaskCtx, kind, scope, task_name},
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeRequest {
    pub detail_id: i64,
    pub backup: bool,
    pub pull_image: bool,
    /// Replaces the generated compose file when non-empty.
    pub docker_compose: String,
    pub task_id: Option<String>,
}

impl AppEngine {
    /// Moves an install onto another version of its app.
    ///
    /// With `backup` the install is archived first and restored when the upgrade step fails.
    /// Returns the task id.
    pub async fn upgrade(&self, install_id: i64, req: UpgradeRequest) -> anyhow::Result<String> {
        let db = &self.services().db;
        let mut install = self.install_by_id(install_id).await?;
        Self::ensure_idle(&install)?;
        let detail: AppDetail = db.must(vec![Filter::Id(req.detail_id)]).await?;
        if detail.app_id != install.app_id {
            return Err(PanelError::RecordNotFound.into());
        }
        if detail.version == install.version {
            return Err(PanelError::VersionSame.into());
        }
        let app = db.app_of(&install).await?;
        if req.docker_compose.trim().is_empty() {
            self.check_service_count(&app, &detail, &install).await?;
        }

        let mut task = self
            .services()
            .tasks
            .new_task(NewTask {
                name: task_name("Upgrade", scope::APP, &install.name),
                kind: kind::UPGRADE,
                scope: scope::APP,
                task_id: req.task_id.clone(),
                resource_id: install.id,
            })
            .await?;
        install.status = status::UPGRADING.to_string();
        self.save_install(&mut install).await?;

        let id = install.id;
        let backup_file: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));

        if req.backup {
            let (engine, a, slot) = (self.clone(), app.clone(), backup_file.clone());
            let on_failure = {
                let engine = self.clone();
                move |t: TaskCtx, err: String| async move {
                    engine.mark_upgrade_err(&t, id, &err).await
                }
            };
            task.add_sub_task_with(
                "BackupApp",
                move |t| {
                    let (engine, a, slot) = (engine.clone(), a.clone(), slot.clone());
                    async move {
                        let install = engine.install_by_id(id).await?;
                        let path = engine.backup_install(&t, &a, &install).await?;
                        if let Ok(mut slot) = slot.lock() {
                            *slot = Some(path);
                        }
                        Ok(())
                    }
                },
                Some(on_failure),
                0,
                DEFAULT_STEP_TIMEOUT,
            );
        }

        let (engine, a, d, r) = (self.clone(), app.clone(), detail.clone(), req.clone());
        let on_failure = {
            let (engine, a) = (self.clone(), app.clone());
            move |t: TaskCtx, err: String| async move {
                let archive = backup_file.lock().ok().and_then(|slot| slot.clone());
                if let Some(archive) = archive {
                    engine.recover_install(&t, &a, id, &archive).await;
                }
                engine.mark_upgrade_err(&t, id, &err).await
            }
        };
        task.add_sub_task_with(
            "UpgradeApp",
            move |t| {
                let (engine, a, d, r) = (engine.clone(), a.clone(), d.clone(), r.clone());
                async move { engine.upgrade_files(&t, &a, d, id, &r).await }
            },
            Some(on_failure),
            0,
            DEFAULT_STEP_TIMEOUT,
        );

        tracing::info!(install = %install.name, from = %install.version, to = %detail.version, "upgrade accepted");
        Ok(task.run_async())
    }

    async fn check_service_count(
        &self,
        app: &App,
        detail: &AppDetail,
        install: &AppInstall,
    ) -> anyhow::Result<()> {
        let template = if detail.docker_compose.is_empty() {
            let path = self
                .detail_dir(app, &detail.version)
                .join("docker-compose.yml");
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                // Not downloaded yet; checked again once the payload is in place.
                Err(_) => return Ok(()),
            }
        } else {
            detail.docker_compose.clone()
        };
        let old = compose::service_names(&compose::parse_document(&install.docker_compose)?)?;
        let new = compose::service_names(&compose::parse_document(&template)?)?;
        if old.len() != new.len() {
            return Err(PanelError::ServiceCountChanged {
                old: old.len(),
                new: new.len(),
            }
            .into());
        }
        Ok(())
    }

    async fn upgrade_files(
        &self,
        t: &TaskCtx,
        app: &App,
        mut detail: AppDetail,
        install_id: i64,
        req: &UpgradeRequest,
    ) -> anyhow::Result<()> {
        let svc = self.services();
        let mut install = self.install_by_id(install_id).await?;

        if app.resource != resource::LOCAL {
            self.download_app(t, app, &detail).await?;
        }
        let src = self.detail_dir(app, &detail.version);
        if detail.docker_compose.is_empty() {
            detail.docker_compose = tokio::fs::read_to_string(src.join("docker-compose.yml"))
                .await
                .map_err(|_| PanelError::FileNotFound {
                    name: "docker-compose.yml".to_string(),
                })?;
            svc.db
                .update::<AppDetail>(
                    detail.id,
                    vec![("docker_compose", detail.docker_compose.clone().into())],
                )
                .await?;
        }

        let mut env = env_file::from_json(&install.env)?;
        if req.pull_image {
            for image in compose::get_images(&detail.docker_compose, &env)? {
                let label = format!("Pull image {image}");
                t.log_start(&label).await;
                let progress = |line: &str| tracing::debug!(image = %image, "{line}");
                svc.container
                    .pull_image(&image, &progress)
                    .await
                    .map_err(|e| PanelError::DockerPullImage {
                        err: format!("{e:#}"),
                    })?;
                t.log_success(&label).await;
            }
        }

        let dir = self.install_dir(app, &install.name);
        archive::copy_dir(&src, &dir, false).await?;
        let scripts = src.join("scripts");
        if tokio::fs::try_exists(&scripts).await.unwrap_or(false) {
            archive::remove_dir_if_exists(&dir.join("scripts")).await?;
            archive::copy_dir(&scripts, &dir.join("scripts"), true).await?;
        }

        let new_compose = if req.docker_compose.trim().is_empty() {
            let fallback = install
                .container_name
                .split(',')
                .next()
                .unwrap_or_default()
                .to_string();
            compose::mutate_for_upgrade(
                &install.docker_compose,
                &detail.docker_compose,
                &install.service_name,
                &fallback,
                svc.config.image_prefix.as_deref(),
                &mut env,
            )?
        } else {
            req.docker_compose.clone()
        };

        let env_path = dir.join(".env");
        let mut file_env = env_file::read(&env_path).await.unwrap_or_default();
        file_env.extend(env.clone());
        env_file::write(&env_path, &file_env).await?;

        // Persist the target version before the running stack is touched.
        install.version = detail.version.clone();
        install.app_detail_id = detail.id;
        install.docker_compose = new_compose;
        install.env = env_file::to_json(&env)?;
        self.save_install(&mut install).await?;

        let stack = self.stack(app, &install);
        svc.compose().down(&stack).await?;
        self.run_script(t, app, &install, "upgrade").await?;
        tokio::fs::write(stack.compose_path(), &install.docker_compose).await?;

        svc.compose().up(&stack).await?;
        self.refresh_container_names(app, &mut install).await;
        install.status = status::RUNNING.to_string();
        install.message.clear();
        self.save_install(&mut install).await?;
        t.log(format!("Upgrade {} to {}", install.name, install.version))
            .await;

        self.update_tool_app(&install, app).await;
        Ok(())
    }

    async fn mark_upgrade_err(&self, t: &TaskCtx, install_id: i64, err: &str) {
        let marked = async {
            let mut install = self.install_by_id(install_id).await?;
            install.status = status::UPGRADE_ERR.to_string();
            install.message = err.to_string();
            self.save_install(&mut install).await
        };
        if let Err(e) = marked.await {
            t.warn(format!("persist upgrade_err: {e:#}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::fixtures,
        db::TASK_FAILED,
        error::panel_error,
        model::{BackupRecord, app_type},
        testing,
    };

    const MYSQL_V2: &str = r#"services:
  mysql:
    image: mysql:8.4.0
    container_name: ${CONTAINER_NAME}
    ports:
      - ${PANEL_APP_PORT_HTTP}:3306
"#;

    const TWO_SERVICES: &str = r#"services:
  mysql:
    image: mysql:8.4.0
  exporter:
    image: prom/mysqld-exporter
"#;

    async fn installed(engine: &AppEngine, app: &App, detail: &AppDetail) -> AppInstall {
        let mut env = env_file::EnvMap::new();
        env.insert("CONTAINER_NAME".to_string(), "dp-mysql-abcd".to_string());
        env.insert("PANEL_APP_PORT_HTTP".to_string(), "3306".to_string());
        let install = engine
            .services()
            .db
            .create(AppInstall {
                name: "mysql-1".to_string(),
                app_id: app.id,
                app_detail_id: detail.id,
                version: detail.version.clone(),
                status: status::RUNNING.to_string(),
                service_name: "mysql".to_string(),
                container_name: "dp-mysql-abcd".to_string(),
                env: env_file::to_json(&env).unwrap(),
                docker_compose: fixtures::MYSQL_COMPOSE.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let dir = engine.install_dir(app, "mysql-1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("docker-compose.yml"), fixtures::MYSQL_COMPOSE)
            .await
            .unwrap();
        env_file::write(&dir.join(".env"), &env).await.unwrap();
        install
    }

    #[tokio::test]
    async fn upgrade_moves_install_to_new_version() {
        let (svc, fakes) = testing::services("upgrade-ok").await;
        let engine = AppEngine::new(svc.clone());
        let (app, v1) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let v2 = fixtures::seed_version(&engine, &app, "8.4.0", MYSQL_V2).await;
        let install = installed(&engine, &app, &v1).await;

        let task_id = engine
            .upgrade(
                install.id,
                UpgradeRequest {
                    detail_id: v2.id,
                    pull_image: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.error_msg, "");

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::RUNNING);
        assert_eq!(install.version, "8.4.0");
        assert_eq!(install.app_detail_id, v2.id);
        assert!(install.docker_compose.contains("mysql:8.4.0"));
        assert_eq!(install.container_name, "dp-mysql-abcd");
        assert_eq!(*fakes.container.pulled.lock().unwrap(), vec!["mysql:8.4.0"]);
    }

    #[tokio::test]
    async fn failed_upgrade_restores_backup_and_marks_upgrade_err() {
        let (svc, fakes) = testing::services("upgrade-fail").await;
        let engine = AppEngine::new(svc.clone());
        let (app, v1) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let v2 = fixtures::seed_version(&engine, &app, "8.4.0", MYSQL_V2).await;
        let install = installed(&engine, &app, &v1).await;
        fakes.runner.respond(" up -d", 1, "manifest unknown");

        let task_id = engine
            .upgrade(
                install.id,
                UpgradeRequest {
                    detail_id: v2.id,
                    backup: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.status, TASK_FAILED);
        assert_eq!(record.current_step, "UpgradeApp");

        let records: Vec<BackupRecord> = svc.db.list(vec![]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].file_name.starts_with("upgrade_backup_mysql-1_"));
        assert!(
            svc.config
                .backup_dir
                .join(&records[0].file_dir)
                .join(&records[0].file_name)
                .exists()
        );

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::UPGRADE_ERR);
        assert_eq!(install.message, "manifest unknown");
        assert_eq!(install.version, "8.0.35");
        assert_eq!(install.app_detail_id, v1.id);
        let on_disk = tokio::fs::read_to_string(engine.install_dir(&app, "mysql-1").join("docker-compose.yml"))
            .await
            .unwrap();
        assert!(on_disk.contains("mysql:8.0.35"));
    }

    #[tokio::test]
    async fn failed_upgrade_without_backup_keeps_new_version() {
        let (svc, fakes) = testing::services("upgrade-nobackup").await;
        let engine = AppEngine::new(svc.clone());
        let (app, v1) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let v2 = fixtures::seed_version(&engine, &app, "8.4.0", MYSQL_V2).await;
        let install = installed(&engine, &app, &v1).await;
        fakes.runner.respond(" up -d", 1, "manifest unknown");

        let task_id = engine
            .upgrade(
                install.id,
                UpgradeRequest {
                    detail_id: v2.id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.status, TASK_FAILED);
        assert_eq!(fakes.runner.count(" down --remove-orphans"), 1);

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::UPGRADE_ERR);
        assert_eq!(install.message, "manifest unknown");
        assert_eq!(install.version, "8.4.0");
        assert_eq!(install.app_detail_id, v2.id);
        let on_disk = tokio::fs::read_to_string(engine.install_dir(&app, "mysql-1").join("docker-compose.yml"))
            .await
            .unwrap();
        assert_eq!(on_disk, install.docker_compose);
        assert!(on_disk.contains("mysql:8.4.0"));
    }

    #[tokio::test]
    async fn upgrade_preconditions() {
        let (svc, _fakes) = testing::services("upgrade-pre").await;
        let engine = AppEngine::new(svc.clone());
        let (app, v1) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let two = fixtures::seed_version(&engine, &app, "9.0.0", TWO_SERVICES).await;
        let install = installed(&engine, &app, &v1).await;

        let same = UpgradeRequest {
            detail_id: v1.id,
            ..Default::default()
        };
        let err = engine.upgrade(install.id, same).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::VersionSame)));

        let split = UpgradeRequest {
            detail_id: two.id,
            ..Default::default()
        };
        let err = engine.upgrade(install.id, split).await.unwrap_err();
        assert!(matches!(
            panel_error(&err),
            Some(PanelError::ServiceCountChanged { old: 1, new: 2 })
        ));
        assert_eq!(
            engine.install_by_id(install.id).await.unwrap().status,
            status::RUNNING
        );
    }
}
