use serde::{Deserialize, Serialize};

use super::{AppEngine, hosts_schemas, is_database_key};
use crate::{
    archive, compose,
    db::{self, Filter},
    model::{
        App, AppInstall, AppInstallResource, BackupRecord, Database, DatabaseSchema, status,
    },
    task::{DEFAULT_STEP_TIMEOUT, NewTask, TaskCtx, kind, scope, task_name},
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallRequest {
    pub delete_image: bool,
    pub delete_db: bool,
    pub delete_backup: bool,
    pub force_delete: bool,
    pub task_id: Option<String>,
}

impl AppEngine {
    /// Stops and removes an install with its rows and directories. Returns the task id.
    pub async fn uninstall(&self, install_id: i64, req: UninstallRequest) -> anyhow::Result<String> {
        let mut install = self.install_by_id(install_id).await?;
        if !req.force_delete {
            Self::ensure_idle(&install)?;
        }
        let app = self.services().db.app_of(&install).await?;

        let mut task = self
            .services()
            .tasks
            .new_task(NewTask {
                name: task_name("Uninstall", scope::APP, &install.name),
                kind: kind::UNINSTALL,
                scope: scope::APP,
                task_id: req.task_id.clone(),
                resource_id: install.id,
            })
            .await?;
        install.status = status::UNINSTALLING.to_string();
        self.save_install(&mut install).await?;

        let id = install.id;
        let on_failure = {
            let engine = self.clone();
            // A failed uninstall must not leave the row in `uninstalling`, forced or not.
            move |t: TaskCtx, err: String| async move {
                let marked = async {
                    let found = engine
                        .services()
                        .db
                        .first::<AppInstall>(vec![Filter::Id(id)])
                        .await?;
                    let Some(mut install) = found else {
                        return anyhow::Ok(());
                    };
                    install.status = status::ERROR.to_string();
                    install.message = err;
                    engine.save_install(&mut install).await
                };
                if let Err(e) = marked.await {
                    t.warn(format!("persist uninstall failure: {e:#}")).await;
                }
            }
        };
        let engine = self.clone();
        task.add_sub_task_with(
            "UninstallApp",
            move |t| {
                let (engine, app, req) = (engine.clone(), app.clone(), req.clone());
                async move { engine.delete_install(&t, &app, id, &req).await }
            },
            Some(on_failure),
            0,
            DEFAULT_STEP_TIMEOUT,
        );
        Ok(task.run_async())
    }

    async fn delete_install(
        &self,
        t: &TaskCtx,
        app: &App,
        install_id: i64,
        req: &UninstallRequest,
    ) -> anyhow::Result<()> {
        let svc = self.services();
        let mut install = self.install_by_id(install_id).await?;
        let dir = self.install_dir(app, &install.name);

        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            let stack = self.stack(app, &install);
            if let Err(e) = svc.compose().down(&stack).await {
                if !req.force_delete {
                    return Err(self.handle_err(&mut install, e, "").await);
                }
                t.warn(format!("compose down: {e}")).await;
            }
            if let Err(e) = self.run_script(t, app, &install, "uninstall").await {
                if req.force_delete {
                    t.warn(format!("uninstall script: {e:#}")).await;
                } else {
                    if let Err(up) = svc.compose().up(&stack).await {
                        t.warn(format!("compose up after failed uninstall script: {up}"))
                            .await;
                    }
                    return Err(e);
                }
            }
            if req.delete_image {
                self.delete_images(t, app, &install).await;
            }
        }

        if req.delete_db {
            self.delete_link(t, &install, req.force_delete).await?;
        }

        let (app_key, name) = (app.key.clone(), install.name.clone());
        svc.db
            .tx(move |tx| {
                db::delete::<AppInstall>(tx, &[Filter::Id(install_id)])?;
                db::delete::<AppInstallResource>(
                    tx,
                    &[Filter::Eq("app_install_id", install_id.into())],
                )?;
                if is_database_key(&app_key) {
                    db::delete::<Database>(tx, &[Filter::Eq("app_install_id", install_id.into())])?;
                }
                if hosts_schemas(&app_key) {
                    db::delete::<DatabaseSchema>(
                        tx,
                        &[Filter::Eq("server_name", name.clone().into())],
                    )?;
                }
                db::delete::<BackupRecord>(
                    tx,
                    &[
                        Filter::Type("app".to_string()),
                        Filter::Name(app_key),
                        Filter::DetailName(name),
                    ],
                )?;
                Ok(())
            })
            .await?;

        archive::remove_dir_if_exists(&svc.config.uploads_dir(&app.key, &install.name)).await?;
        if req.delete_backup {
            archive::remove_dir_if_exists(&svc.config.app_backup_dir(&app.key, &install.name))
                .await?;
        }
        archive::remove_dir_if_exists(&dir).await?;
        if let Some(parent) = dir.parent()
            && archive::is_empty_dir(parent).await
        {
            archive::remove_dir_if_exists(parent).await?;
        }
        tracing::info!(install = %install.name, app = %app.key, "install removed");
        Ok(())
    }

    /// Removes the images an install's compose references. Best-effort per image.
    async fn delete_images(&self, t: &TaskCtx, app: &App, install: &AppInstall) {
        let env = self.install_env(app, install).await;
        let images = match compose::get_images(&install.docker_compose, &env) {
            Ok(images) => images,
            Err(e) => {
                t.warn(format!("resolve images: {e:#}")).await;
                return;
            }
        };
        let container = &self.services().container;
        for image in images {
            let label = format!("Delete image {image}");
            match container.image_id(&image).await {
                Ok(Some(id)) => {
                    let res = container.delete_image(&id).await;
                    t.log_with_status(&label, res.as_ref().err()).await;
                }
                Ok(None) => {}
                Err(e) => t.log_failed(&label, &e).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app::fixtures, db::TASK_SUCCESS, model::app_type, testing};

    async fn seeded(engine: &AppEngine) -> (App, AppInstall) {
        let db = &engine.services().db;
        let (app, detail) =
            fixtures::seed_app(engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let install = db
            .create(AppInstall {
                name: "mysql-1".to_string(),
                app_id: app.id,
                app_detail_id: detail.id,
                status: status::RUNNING.to_string(),
                container_name: "dp-mysql-abcd".to_string(),
                env: r#"{"CONTAINER_NAME":"dp-mysql-abcd"}"#.to_string(),
                docker_compose: fixtures::MYSQL_COMPOSE.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        db.create(Database {
            name: "mysql-1".to_string(),
            kind: "mysql".to_string(),
            app_install_id: install.id,
            ..Default::default()
        })
        .await
        .unwrap();
        db.create(BackupRecord {
            kind: "app".to_string(),
            name: "mysql".to_string(),
            detail_name: "mysql-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let dir = engine.install_dir(&app, "mysql-1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("docker-compose.yml"), fixtures::MYSQL_COMPOSE)
            .await
            .unwrap();
        (app, install)
    }

    #[tokio::test]
    async fn uninstall_removes_rows_dirs_and_images() {
        let (svc, fakes) = testing::services("uninstall-ok").await;
        let engine = AppEngine::new(svc.clone());
        let (app, install) = seeded(&engine).await;
        fakes.container.images.lock().unwrap().push("mysql:8.0.35".to_string());
        let backups = svc.config.app_backup_dir("mysql", "mysql-1");
        tokio::fs::create_dir_all(&backups).await.unwrap();

        let task_id = engine
            .uninstall(
                install.id,
                UninstallRequest {
                    delete_image: true,
                    delete_db: true,
                    delete_backup: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(testing::wait_task(&svc.db, &task_id).await.status, TASK_SUCCESS);

        assert_eq!(svc.db.count::<AppInstall>(vec![]).await.unwrap(), 0);
        assert_eq!(svc.db.count::<Database>(vec![]).await.unwrap(), 0);
        assert_eq!(svc.db.count::<BackupRecord>(vec![]).await.unwrap(), 0);
        let dir = engine.install_dir(&app, "mysql-1");
        assert!(!dir.exists());
        assert!(!dir.parent().unwrap().exists());
        assert!(!backups.exists());
        assert_eq!(*fakes.container.deleted.lock().unwrap(), vec!["sha256:mysql:8.0.35"]);
        assert_eq!(fakes.runner.count(" down --remove-orphans"), 1);
    }

    #[tokio::test]
    async fn failed_down_keeps_install_in_error() {
        let (svc, fakes) = testing::services("uninstall-fail").await;
        let engine = AppEngine::new(svc.clone());
        let (app, install) = seeded(&engine).await;
        fakes.runner.respond(" down --remove-orphans", 1, "network in use");

        let task_id = engine
            .uninstall(install.id, UninstallRequest::default())
            .await
            .unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.error_msg, "network in use");

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::ERROR);
        assert_eq!(install.message, "network in use");
        assert!(engine.install_dir(&app, "mysql-1").exists());
    }

    #[tokio::test]
    async fn forced_uninstall_ignores_down_failure() {
        let (svc, fakes) = testing::services("uninstall-force").await;
        let engine = AppEngine::new(svc.clone());
        let (_app, install) = seeded(&engine).await;
        fakes.runner.respond(" down --remove-orphans", 1, "daemon unreachable");

        let req = UninstallRequest {
            force_delete: true,
            ..Default::default()
        };
        let task_id = engine.uninstall(install.id, req).await.unwrap();
        assert_eq!(testing::wait_task(&svc.db, &task_id).await.status, TASK_SUCCESS);
        assert_eq!(svc.db.count::<AppInstall>(vec![]).await.unwrap(), 0);
    }

    async fn failing_uninstall_script(engine: &AppEngine, app: &App, fakes: &testing::Fakes) {
        let scripts = engine.install_dir(app, "mysql-1").join("scripts");
        tokio::fs::create_dir_all(&scripts).await.unwrap();
        tokio::fs::write(scripts.join("uninstall.sh"), "exit 1\n")
            .await
            .unwrap();
        fakes.runner.respond("uninstall.sh", 1, "script exploded");
    }

    #[tokio::test]
    async fn forced_uninstall_continues_past_failing_script() {
        let (svc, fakes) = testing::services("uninstall-force-script").await;
        let engine = AppEngine::new(svc.clone());
        let (app, install) = seeded(&engine).await;
        failing_uninstall_script(&engine, &app, &fakes).await;

        let req = UninstallRequest {
            force_delete: true,
            ..Default::default()
        };
        let task_id = engine.uninstall(install.id, req).await.unwrap();
        assert_eq!(testing::wait_task(&svc.db, &task_id).await.status, TASK_SUCCESS);
        assert_eq!(svc.db.count::<AppInstall>(vec![]).await.unwrap(), 0);
        assert!(!engine.install_dir(&app, "mysql-1").exists());
        assert_eq!(fakes.runner.count(" up -d"), 0);
    }

    #[tokio::test]
    async fn failing_script_leaves_install_operable() {
        let (svc, fakes) = testing::services("uninstall-script").await;
        let engine = AppEngine::new(svc.clone());
        let (app, install) = seeded(&engine).await;
        failing_uninstall_script(&engine, &app, &fakes).await;

        let task_id = engine
            .uninstall(install.id, UninstallRequest::default())
            .await
            .unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.error_msg, "script exploded");

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::ERROR);
        assert_eq!(install.message, "script exploded");
        assert!(AppEngine::ensure_idle(&install).is_ok());
        assert_eq!(fakes.runner.count(" up -d"), 1);
    }
}
