use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt as _;

use super::{AppEngine, database_port, port::port_param};
use crate::{
    archive,
    compose::{self, CONTAINER_NAME, ContainerConfig},
    db::Filter,
    env_file::{self, EnvMap},
    error::PanelError,
    ids,
    model::{App, AppDetail, AppInstall, Database, app_type, resource, status},
    provisioner::check_cmd_illegal,
    task::{DEFAULT_STEP_TIMEOUT, NO_ROLLBACK, NewTask, Task, TaskCtx, kind, scope, task_name},
};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallRequest {
    pub name: String,
    pub app_key: String,
    pub app_detail_id: i64,
    pub params: Map<String, Value>,
    #[serde(flatten)]
    pub container: ContainerConfig,
    pub pull_image: bool,
    pub edit_compose: bool,
    pub docker_compose: String,
    pub task_id: Option<String>,
}

impl AppEngine {
    /// Validates the request, stores the install as `installing` and starts the install task.
    ///
    /// Every precondition is checked before the row or any directory is created. Returns the
    /// stored row and the task id.
    pub async fn install(&self, req: InstallRequest) -> anyhow::Result<(AppInstall, String)> {
        let svc = self.services();
        let db = &svc.db;

        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(PanelError::FileParse {
                detail: "install name must not be empty".to_string(),
            }
            .into());
        }
        check_cmd_illegal(&[&name])?;

        let detail: AppDetail = db.must(vec![Filter::Id(req.app_detail_id)]).await?;
        let app: App = db.must(vec![Filter::Id(detail.app_id)]).await?;
        if !req.app_key.is_empty() && req.app_key != app.key {
            return Err(PanelError::RecordNotFound.into());
        }
        if db
            .first::<AppInstall>(vec![Filter::Name(name.clone())])
            .await?
            .is_some()
        {
            return Err(PanelError::NameIsExist { name }.into());
        }
        if app.limit > 0
            && db.count::<AppInstall>(vec![Filter::AppId(app.id)]).await? >= app.limit
        {
            return Err(PanelError::AppLimit.into());
        }

        let http_port = self.check_port("PANEL_APP_PORT_HTTP", &req.params).await?;
        let https_port = self.check_port("PANEL_APP_PORT_HTTPS", &req.params).await?;
        for key in req.params.keys().filter(|k| k.contains("PANEL_APP_PORT")) {
            let port = port_param(key, &req.params);
            if port > 0 {
                self.check_port_exist(port).await?;
            }
        }

        let container_name = if req.container.advanced && !req.container.container_name.is_empty() {
            let wanted = req.container.container_name.clone();
            let taken = svc
                .container
                .list_all_containers()
                .await?
                .iter()
                .any(|c| c.name == wanted);
            if taken {
                return Err(PanelError::NameIsExist { name: wanted }.into());
            }
            wanted
        } else {
            format!("dp-{}-{}", app.key, ids::rand_suffix(4))
        };

        let template = self.install_template(&app, &detail, &req).await?;
        let service_name = compose::first_service_name(&template)?;
        let mut env = EnvMap::new();
        env_file::flatten_params(&req.params, &mut env);
        env.insert(CONTAINER_NAME.to_string(), container_name.clone());
        let mut doc = compose::parse_document(&template)?;
        compose::mutate_for_install(
            &mut doc,
            &service_name,
            &req.container,
            svc.config.image_prefix.as_deref(),
            &mut env,
        )?;

        let now = ids::now_rfc3339()?;
        let install = db
            .create(AppInstall {
                name: name.clone(),
                app_id: app.id,
                app_detail_id: detail.id,
                version: detail.version.clone(),
                status: status::INSTALLING.to_string(),
                service_name,
                container_name,
                http_port,
                https_port,
                env: env_file::to_json(&env)?,
                docker_compose: compose::to_yaml(&doc)?,
                created_at: now.clone(),
                updated_at: now,
                ..Default::default()
            })
            .await?;

        let task = match svc
            .tasks
            .new_task(NewTask {
                name: task_name("Install", scope::APP, &name),
                kind: kind::INSTALL,
                scope: scope::APP,
                task_id: req.task_id.clone(),
                resource_id: install.id,
            })
            .await
        {
            Ok(task) => task,
            Err(e) => {
                db.delete::<AppInstall>(vec![Filter::Id(install.id)]).await?;
                return Err(e);
            }
        };
        let task = self.install_steps(task, &app, &detail, &install, req.pull_image);
        tracing::info!(install = %install.name, app = %app.key, version = %install.version, "install accepted");
        let task_id = task.run_async();
        Ok((install, task_id))
    }

    async fn install_template(
        &self,
        app: &App,
        detail: &AppDetail,
        req: &InstallRequest,
    ) -> anyhow::Result<String> {
        if req.edit_compose && !req.docker_compose.trim().is_empty() {
            return Ok(req.docker_compose.clone());
        }
        if !detail.docker_compose.is_empty() {
            return Ok(detail.docker_compose.clone());
        }
        let path = self
            .detail_dir(app, &detail.version)
            .join("docker-compose.yml");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| {
                PanelError::FileNotFound {
                    name: path.display().to_string(),
                }
                .into()
            })
    }

    fn install_steps(
        &self,
        mut task: Task,
        app: &App,
        detail: &AppDetail,
        install: &AppInstall,
        pull_image: bool,
    ) -> Task {
        let id = install.id;
        let rollback = |engine: AppEngine, app: App| {
            Some(move |t: TaskCtx, err: String| async move {
                engine.rollback_install(&t, &app, id, &err).await
            })
        };

        let (engine, a, d) = (self.clone(), app.clone(), detail.clone());
        task.add_sub_task_with(
            "HandleAppFile",
            move |t| {
                let (engine, a, d) = (engine.clone(), a.clone(), d.clone());
                async move { engine.copy_app_files(&t, &a, &d, id).await }
            },
            rollback(self.clone(), app.clone()),
            0,
            DEFAULT_STEP_TIMEOUT,
        );

        if database_port(&app.key).is_some() {
            let (engine, a, d) = (self.clone(), app.clone(), detail.clone());
            task.add_sub_task_with(
                "HandleDatabaseApp",
                move |t| {
                    let (engine, a, d) = (engine.clone(), a.clone(), d.clone());
                    async move { engine.handle_database_app(&t, &a, &d, id).await }
                },
                rollback(self.clone(), app.clone()),
                0,
                DEFAULT_STEP_TIMEOUT,
            );
        }

        let env = env_file::from_json(&install.env).unwrap_or_default();
        let links_database = matches!(app.kind.as_str(), app_type::WEBSITE | app_type::TOOL)
            && env.get("PANEL_DB_HOST").is_some_and(|h| !h.is_empty());
        if links_database {
            let engine = self.clone();
            task.add_sub_task_with(
                "CreateDatabase",
                move |t| {
                    let engine = engine.clone();
                    async move { engine.link_database(&t, id).await }
                },
                rollback(self.clone(), app.clone()),
                0,
                DEFAULT_STEP_TIMEOUT,
            );
        }

        // A failed start keeps the row as up_err so the user can inspect it.
        let engine = self.clone();
        task.add_sub_task_with(
            "RunApp",
            move |t| {
                let engine = engine.clone();
                async move {
                    let mut install = engine.install_by_id(id).await?;
                    engine.up_app(&t, &mut install, pull_image).await
                }
            },
            NO_ROLLBACK,
            0,
            DEFAULT_STEP_TIMEOUT,
        );

        let (engine, a) = (self.clone(), app.clone());
        task.add_sub_task_with(
            "InitScript",
            move |t| {
                let (engine, a) = (engine.clone(), a.clone());
                async move {
                    let install = engine.install_by_id(id).await?;
                    engine.run_script(&t, &a, &install, "init").await?;
                    engine.update_tool_app(&install, &a).await;
                    Ok(())
                }
            },
            rollback(self.clone(), app.clone()),
            0,
            DEFAULT_STEP_TIMEOUT,
        );
        task
    }

    /// Lays the version payload out in the install directory with the merged `.env` and the
    /// rewritten compose file.
    async fn copy_app_files(
        &self,
        t: &TaskCtx,
        app: &App,
        detail: &AppDetail,
        install_id: i64,
    ) -> anyhow::Result<()> {
        let mut install = self.install_by_id(install_id).await?;
        if let Err(e) = self.download_app(t, app, detail).await {
            install.status = status::DOWNLOAD_ERR.to_string();
            install.message = format!("{e:#}");
            self.save_install(&mut install).await?;
            return Err(e);
        }

        let src = self.detail_dir(app, &detail.version);
        let dir = self.install_dir(app, &install.name);
        archive::remove_dir_if_exists(&dir).await?;
        if tokio::fs::try_exists(&src).await.unwrap_or(false) {
            archive::copy_dir(&src, &dir, true).await?;
        } else {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let env_path = dir.join(".env");
        let mut env = if tokio::fs::try_exists(&env_path).await.unwrap_or(false) {
            env_file::read(&env_path).await?
        } else {
            EnvMap::new()
        };
        env.extend(env_file::from_json(&install.env)?);
        env_file::write(&env_path, &env).await?;
        tokio::fs::write(dir.join("docker-compose.yml"), &install.docker_compose)
            .await
            .with_context(|| format!("write compose file in {}", dir.display()))?;
        t.log(format!("Copy app files to {}", dir.display())).await;
        Ok(())
    }

    /// Fetches and unpacks a remote version payload unless it is already present and current.
    pub(crate) async fn download_app(
        &self,
        t: &TaskCtx,
        app: &App,
        detail: &AppDetail,
    ) -> anyhow::Result<()> {
        if app.resource == resource::LOCAL {
            return Ok(());
        }
        let version_dir = self.detail_dir(app, &detail.version);
        if !detail.update && tokio::fs::try_exists(&version_dir).await.unwrap_or(false) {
            return Ok(());
        }
        if detail.download_url.is_empty() {
            return Err(PanelError::FileNotFound {
                name: version_dir.display().to_string(),
            }
            .into());
        }

        let label = format!("Download app {} {}", app.key, detail.version);
        t.log_start(&label).await;
        tokio::fs::create_dir_all(&version_dir).await?;
        let file = version_dir.join(format!("{}-{}.tar.gz", app.key, detail.version));
        let mut resp = self
            .services()
            .http
            .get(&detail.download_url)
            .send()
            .await?
            .error_for_status()?;
        let mut out = tokio::fs::File::create(&file).await?;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);

        let root = self.services().config.resource_apps_dir(&app.resource);
        archive::extract_tar_gz(&file, &root).await?;
        tokio::fs::remove_file(&file).await?;
        self.services()
            .db
            .update::<AppDetail>(detail.id, vec![("update", false.into())])
            .await?;
        t.log_success(&label).await;
        self.request_download_callback(&detail.download_callback_url);
        Ok(())
    }

    fn request_download_callback(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        let http = self.services().http.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = http.get(&url).timeout(CALLBACK_TIMEOUT).send().await {
                tracing::debug!(url = %url, error = %e, "download callback failed");
            }
        });
    }

    /// Undoes a failed install: stops the stack, removes links, rows and the directory.
    ///
    /// A `download_err` install is kept so the failure stays visible.
    async fn rollback_install(&self, t: &TaskCtx, app: &App, install_id: i64, err: &str) {
        let db = &self.services().db;
        let install = match db.first::<AppInstall>(vec![Filter::Id(install_id)]).await {
            Ok(Some(install)) => install,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(install_id, error = %e, "load install for rollback failed");
                return;
            }
        };
        if install.status == status::DOWNLOAD_ERR {
            return;
        }
        t.warn(format!("Rollback install {}: {err}", install.name)).await;

        let dir = self.install_dir(app, &install.name);
        if tokio::fs::try_exists(dir.join("docker-compose.yml"))
            .await
            .unwrap_or(false)
            && let Err(e) = self.services().compose().down(&self.stack(app, &install)).await
        {
            t.warn(format!("compose down: {e}")).await;
        }
        if let Err(e) = self.delete_link(t, &install, true).await {
            t.warn(format!("delete links: {e:#}")).await;
        }
        let cleanup = async {
            if database_port(&app.key).is_some() {
                db.delete::<Database>(vec![Filter::Eq("app_install_id", install.id.into())])
                    .await?;
            }
            db.delete::<AppInstall>(vec![Filter::Id(install.id)]).await?;
            archive::remove_dir_if_exists(&dir).await
        };
        if let Err(e) = cleanup.await {
            t.warn(format!("rollback cleanup: {e:#}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{app::fixtures, db::TASK_FAILED, error::panel_error, testing};

    fn mysql_request(detail: &AppDetail, name: &str) -> InstallRequest {
        let Value::Object(params) = json!({
            "PANEL_APP_PORT_HTTP": 3306,
            "PANEL_DB_ROOT_PASSWORD": "s3cr",
            "PANEL_DB_ROOT_USER": "root"
        }) else {
            unreachable!()
        };
        InstallRequest {
            name: name.to_string(),
            app_key: "mysql".to_string(),
            app_detail_id: detail.id,
            params,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mysql_install_registers_database_and_runs() {
        let (svc, fakes) = testing::services("install-mysql").await;
        let engine = AppEngine::new(svc.clone());
        let (app, detail) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;

        let (install, task_id) = engine.install(mysql_request(&detail, "mysql-1")).await.unwrap();
        assert_eq!(install.status, status::INSTALLING);
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.error_msg, "");

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::RUNNING);
        assert_eq!(install.http_port, 3306);
        assert_eq!(install.service_name, "mysql");
        let env = env_file::from_json(&install.env).unwrap();
        assert_eq!(install.container_name, env[CONTAINER_NAME]);
        assert!(install.container_name.starts_with("dp-mysql-"));

        let database: Database = svc
            .db
            .must(vec![Filter::Eq("app_install_id", install.id.into())])
            .await
            .unwrap();
        assert_eq!(database.port, 3306);
        assert_eq!(database.username, "root");
        assert_eq!(database.password, "s3cr");
        let param: Value = serde_json::from_str(&install.param).unwrap();
        assert_eq!(param, json!({"rootUser": "root", "rootPassword": "s3cr"}));

        let dir = engine.install_dir(&app, "mysql-1");
        let written = env_file::read(&dir.join(".env")).await.unwrap();
        assert_eq!(written["TZ"], "UTC");
        assert_eq!(written["PANEL_DB_ROOT_PASSWORD"], "s3cr");
        assert_eq!(fakes.runner.count(" up -d"), 1);
    }

    #[tokio::test]
    async fn install_preconditions_leave_nothing_behind() {
        let (svc, fakes) = testing::services("install-pre").await;
        let engine = AppEngine::new(svc.clone());
        let (app, detail) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;

        let err = engine
            .install(mysql_request(&detail, "bad;name"))
            .await
            .unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::CmdIllegal)));

        fakes.ports.used.lock().unwrap().insert(3306);
        let err = engine.install(mysql_request(&detail, "mysql-1")).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::PortInUsed { port: 3306 })));
        fakes.ports.used.lock().unwrap().clear();

        let mut req = mysql_request(&detail, "mysql-1");
        req.container.advanced = true;
        req.container.container_name = "taken".to_string();
        fakes.container.set_containers(&[("taken", "running")]);
        let err = engine.install(req).await.unwrap_err();
        assert_eq!(panel_error(&err).unwrap().key(), "ErrNameIsExist");

        assert_eq!(svc.db.count::<AppInstall>(vec![]).await.unwrap(), 0);
        assert!(!tokio::fs::try_exists(engine.install_dir(&app, "mysql-1")).await.unwrap());
    }

    #[tokio::test]
    async fn failed_start_keeps_up_err_row() {
        let (svc, fakes) = testing::services("install-uperr").await;
        let engine = AppEngine::new(svc.clone());
        let (_app, detail) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        fakes.runner.respond(" up -d", 1, "bind: address already in use");

        let (install, task_id) = engine.install(mysql_request(&detail, "mysql-1")).await.unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.status, TASK_FAILED);
        assert_eq!(record.current_step, "RunApp");

        let install = engine.install_by_id(install.id).await.unwrap();
        assert_eq!(install.status, status::UP_ERR);
        assert!(install.message.contains("address already in use"));
    }

    #[tokio::test]
    async fn failed_init_script_rolls_back() {
        let (svc, fakes) = testing::services("install-init").await;
        let engine = AppEngine::new(svc.clone());
        let (app, detail) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let scripts = engine.detail_dir(&app, "8.0.35").join("scripts");
        tokio::fs::create_dir_all(&scripts).await.unwrap();
        tokio::fs::write(scripts.join("init.sh"), "exit 1").await.unwrap();
        fakes.runner.respond("init.sh", 1, "init failed");

        let (install, task_id) = engine.install(mysql_request(&detail, "mysql-1")).await.unwrap();
        let record = testing::wait_task(&svc.db, &task_id).await;
        assert_eq!(record.status, TASK_FAILED);
        assert!(record.error_msg.contains("init failed"));

        assert!(
            svc.db
                .first::<AppInstall>(vec![Filter::Id(install.id)])
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(svc.db.count::<Database>(vec![]).await.unwrap(), 0);
        assert!(!tokio::fs::try_exists(engine.install_dir(&app, "mysql-1")).await.unwrap());
        assert_eq!(fakes.runner.count(" down --remove-orphans"), 1);
    }
}
