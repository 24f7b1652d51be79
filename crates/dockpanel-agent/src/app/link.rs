//! Resource links between installs and the databases they own or use.

use serde_json::{Map, Value};

use super::{APP_TOOLS, AppEngine, database_port, hosts_schemas};
use crate::{
    db::Filter,
    env_file::{self, EnvMap},
    error::PanelError,
    model::{App, AppDetail, AppInstall, AppInstallResource, Database, DatabaseSchema, resource},
    provisioner::check_cmd_illegal,
    task::TaskCtx,
};

/// Default of the `PANEL_APP_PORT_HTTP` form field in a detail's params schema.
fn form_default_port(params: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(params).ok()?;
    let field = value
        .get("formFields")?
        .as_array()?
        .iter()
        .find(|f| f.get("envKey").and_then(Value::as_str) == Some("PANEL_APP_PORT_HTTP"))?;
    match field.get("default")? {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Schema table kind for a server kind.
fn schema_kind(server_kind: &str) -> &'static str {
    match server_kind {
        "postgresql" | "postgres" => "postgresql",
        _ => "mysql",
    }
}

impl AppEngine {
    /// Registers the database server an install provides and records its root credentials.
    pub(crate) async fn handle_database_app(
        &self,
        t: &TaskCtx,
        app: &App,
        detail: &AppDetail,
        install_id: i64,
    ) -> anyhow::Result<()> {
        let db = &self.services().db;
        let mut install = self.install_by_id(install_id).await?;
        let env = env_file::from_json(&install.env)?;

        let mut database = Database {
            name: install.name.clone(),
            kind: app.key.clone(),
            from: resource::LOCAL.to_string(),
            address: install.service_name.clone(),
            port: form_default_port(&detail.params)
                .or_else(|| database_port(&app.key))
                .unwrap_or_default(),
            app_install_id: install.id,
            ..Default::default()
        };
        let mut param = Map::new();
        match app.key.as_str() {
            "mysql" | "mariadb" | "postgresql" | "postgres" | "mongodb" => {
                if let Some(password) = non_empty(&env, "PANEL_DB_ROOT_PASSWORD") {
                    database.password = password.to_string();
                    if matches!(app.key.as_str(), "mysql" | "mariadb") {
                        database.username = "root".to_string();
                    }
                    if let Some(user) = non_empty(&env, "PANEL_DB_ROOT_USER") {
                        database.username = user.to_string();
                    }
                    param.insert("rootPassword".to_string(), password.into());
                    if !database.username.is_empty() {
                        param.insert("rootUser".to_string(), database.username.clone().into());
                    }
                }
            }
            "redis" => {
                if let Some(password) = env.get("PANEL_REDIS_ROOT_PASSWORD") {
                    param.insert("rootPassword".to_string(), password.clone().into());
                    database.password = password.clone();
                }
            }
            "minio" => {
                let user = env.get("PANEL_MINIO_ROOT_USER").cloned().unwrap_or_default();
                let password = env
                    .get("PANEL_MINIO_ROOT_PASSWORD")
                    .cloned()
                    .unwrap_or_default();
                param.insert("rootUser".to_string(), user.clone().into());
                param.insert("rootPassword".to_string(), password.clone().into());
                database.username = user;
                database.password = password;
            }
            _ => {}
        }

        if !param.is_empty() {
            install.param = Value::Object(param).to_string();
            self.save_install(&mut install).await?;
        }
        let database = db.create(database).await?;
        t.log(format!(
            "Register database {} [{}:{}]",
            database.name, database.address, database.port
        ))
        .await;
        Ok(())
    }

    /// Attaches a website or tool install to the database named by its `PANEL_DB_*` params,
    /// creating the schema on the server when it does not exist yet.
    pub(crate) async fn link_database(&self, t: &TaskCtx, install_id: i64) -> anyhow::Result<()> {
        let db = &self.services().db;
        let install = self.install_by_id(install_id).await?;
        let env = env_file::from_json(&install.env)?;

        let Some(server_name) = non_empty(&env, "PANEL_DB_HOST_NAME") else {
            return Ok(());
        };
        let Some(server) = db
            .first::<Database>(vec![Filter::Name(server_name.to_string())])
            .await?
        else {
            return Ok(());
        };

        let mut resource_id = server.id;
        let name = non_empty(&env, "PANEL_DB_NAME");
        let user = non_empty(&env, "PANEL_DB_USER");
        let password = non_empty(&env, "PANEL_DB_USER_PASSWORD");
        if let (Some(name), Some(user), Some(password)) = (name, user, password)
            && hosts_schemas(&server.kind)
        {
            let existing = db
                .first::<DatabaseSchema>(vec![
                    Filter::Name(name.to_string()),
                    Filter::From(resource::LOCAL.to_string()),
                    Filter::Eq("server_name", server.name.clone().into()),
                ])
                .await?;
            resource_id = match existing {
                Some(schema) => {
                    if schema.username != user || schema.password != password {
                        return Err(PanelError::DbUserNotValid.into());
                    }
                    schema.id
                }
                None => {
                    check_cmd_illegal(&[name, user, password])?;
                    let kind = schema_kind(&server.kind);
                    let schema = DatabaseSchema {
                        name: name.to_string(),
                        kind: kind.to_string(),
                        server_name: server.name.clone(),
                        from: server.from.clone(),
                        username: user.to_string(),
                        password: password.to_string(),
                        format: if kind == "mysql" { "utf8mb4" } else { "UTF8" }.to_string(),
                        ..Default::default()
                    };
                    let container = self.server_container(&server).await?;
                    self.services()
                        .provisioner
                        .create_schema(&server, &container, &schema)
                        .await?;
                    t.log(format!("Create database {name} on {}", server.name)).await;
                    db.create(schema).await?.id
                }
            };
        }

        db.create(AppInstallResource {
            app_install_id: install.id,
            link_id: if server.app_install_id > 0 {
                server.app_install_id
            } else {
                server.id
            },
            resource_id,
            from: server.from.clone(),
            key: server.kind.clone(),
            ..Default::default()
        })
        .await?;
        Ok(())
    }

    /// Container a local server runs in; remote servers are reached by address.
    async fn server_container(&self, server: &Database) -> anyhow::Result<String> {
        if server.app_install_id <= 0 {
            return Ok(server.address.clone());
        }
        let owner = self.install_by_id(server.app_install_id).await?;
        Ok(owner
            .container_name
            .split(',')
            .next()
            .unwrap_or_default()
            .to_string())
    }

    /// Drops the schemas an install created and removes its resource links.
    ///
    /// With `force` a failed drop is logged and the links are removed anyway.
    pub(crate) async fn delete_link(
        &self,
        t: &TaskCtx,
        install: &AppInstall,
        force: bool,
    ) -> anyhow::Result<()> {
        let db = &self.services().db;
        let links: Vec<AppInstallResource> = db
            .list(vec![Filter::Eq("app_install_id", install.id.into())])
            .await?;
        for link in &links {
            if !hosts_schemas(&link.key) {
                continue;
            }
            let Some(schema) = db
                .first::<DatabaseSchema>(vec![Filter::Id(link.resource_id)])
                .await?
            else {
                continue;
            };
            if let Err(e) = self.drop_schema(&schema).await {
                if !force {
                    return Err(e);
                }
                t.log_failed(&format!("Delete database {}", schema.name), &e)
                    .await;
            }
            db.delete::<DatabaseSchema>(vec![Filter::Id(schema.id)])
                .await?;
        }
        db.delete::<AppInstallResource>(vec![Filter::Eq("app_install_id", install.id.into())])
            .await?;
        Ok(())
    }

    async fn drop_schema(&self, schema: &DatabaseSchema) -> anyhow::Result<()> {
        let server = self
            .services()
            .db
            .must::<Database>(vec![Filter::Name(schema.server_name.clone())])
            .await?;
        let container = self.server_container(&server).await?;
        self.services()
            .provisioner
            .drop_schema(&server, &container, schema)
            .await
    }

    /// Pushes a database app's root password and host into its management tool and restarts it.
    pub(crate) async fn update_tool_app(&self, installed: &AppInstall, app: &App) {
        let Some((_, tool_key)) = APP_TOOLS.iter().find(|(k, _)| *k == app.key) else {
            return;
        };
        if let Err(e) = self.refresh_tool(installed, tool_key).await {
            tracing::warn!(tool = %tool_key, error = %e, "update tool app failed");
        }
    }

    async fn refresh_tool(&self, installed: &AppInstall, tool_key: &str) -> anyhow::Result<()> {
        let db = &self.services().db;
        let Some(tool_app) = db.first::<App>(vec![Filter::Key(tool_key.to_string())]).await? else {
            return Ok(());
        };
        let Some(mut tool) = db.first::<AppInstall>(vec![Filter::AppId(tool_app.id)]).await? else {
            return Ok(());
        };

        let source = env_file::from_json(&installed.env)?;
        let mut env = env_file::from_json(&tool.env)?;
        if let Some(password) = source.get("PANEL_DB_ROOT_PASSWORD") {
            env.insert("PANEL_DB_ROOT_PASSWORD".to_string(), password.clone());
        }
        for key in ["PANEL_REDIS_HOST", "PANEL_DB_HOST"] {
            if env.contains_key(key) {
                env.insert(key.to_string(), installed.service_name.clone());
            }
        }

        let env_path = self.install_dir(&tool_app, &tool.name).join(".env");
        let mut file_env = env_file::read(&env_path).await.unwrap_or_default();
        file_env.extend(env.clone());
        env_file::write(&env_path, &file_env).await?;
        tool.env = env_file::to_json(&env)?;
        self.save_install(&mut tool).await?;

        let stack = self.stack(&tool_app, &tool);
        self.services().compose().down(&stack).await?;
        self.services().compose().up(&stack).await?;
        tracing::info!(tool = %tool.name, "tool app refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app::fixtures, error::panel_error, model::app_type, testing};

    async fn seed_install(engine: &AppEngine, app: &App, name: &str, env: &str) -> AppInstall {
        engine
            .services()
            .db
            .create(AppInstall {
                name: name.to_string(),
                app_id: app.id,
                service_name: name.to_string(),
                container_name: format!("dp-{name}"),
                env: env.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn form_default_port_reads_number_or_string() {
        assert_eq!(form_default_port(&fixtures::mysql_params()), Some(3306));
        let params = r#"{"formFields":[{"envKey":"PANEL_APP_PORT_HTTP","default":"5433"}]}"#;
        assert_eq!(form_default_port(params), Some(5433));
        assert_eq!(form_default_port("{}"), None);
    }

    #[tokio::test]
    async fn website_links_to_new_schema_then_reuses_it() {
        let (svc, fakes) = testing::services("link-schema").await;
        let engine = AppEngine::new(svc.clone());
        let (mysql, _) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let server_install = seed_install(&engine, &mysql, "mysql-1", "{}").await;
        svc.db
            .create(Database {
                name: "mysql-1".to_string(),
                kind: "mysql".to_string(),
                from: "local".to_string(),
                app_install_id: server_install.id,
                username: "root".to_string(),
                password: "s3cr".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (wp, _) =
            fixtures::seed_app(&engine, "wordpress", app_type::WEBSITE, "6.5", fixtures::MYSQL_COMPOSE)
                .await;
        let env = r#"{"PANEL_DB_HOST":"mysql-1","PANEL_DB_HOST_NAME":"mysql-1","PANEL_DB_NAME":"wp","PANEL_DB_USER":"wp","PANEL_DB_USER_PASSWORD":"pw"}"#;
        let site = seed_install(&engine, &wp, "wordpress-1", env).await;

        let mut task = svc
            .tasks
            .new_task(crate::task::NewTask {
                name: "link".to_string(),
                kind: crate::task::kind::INSTALL,
                scope: crate::task::scope::APP,
                task_id: None,
                resource_id: 0,
            })
            .await
            .unwrap();
        let t = task.ctx();
        task.add_sub_task("noop", |_t| async { Ok(()) });

        engine.link_database(&t, site.id).await.unwrap();
        assert_eq!(*fakes.provisioner.created.lock().unwrap(), vec!["wp"]);
        let link: AppInstallResource = svc
            .db
            .must(vec![Filter::Eq("app_install_id", site.id.into())])
            .await
            .unwrap();
        assert_eq!(link.link_id, server_install.id);
        assert_eq!(link.key, "mysql");

        let other_env = env.replace("\"pw\"", "\"other\"");
        let second = seed_install(&engine, &wp, "wordpress-2", &other_env).await;
        let err = engine.link_database(&t, second.id).await.unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::DbUserNotValid)));

        engine.delete_link(&t, &site, false).await.unwrap();
        assert_eq!(*fakes.provisioner.dropped.lock().unwrap(), vec!["wp"]);
        assert_eq!(
            svc.db
                .count::<AppInstallResource>(vec![Filter::Eq("app_install_id", site.id.into())])
                .await
                .unwrap(),
            0
        );
        assert_eq!(svc.db.count::<DatabaseSchema>(vec![]).await.unwrap(), 0);
        task.execute().await.unwrap();
    }

    #[tokio::test]
    async fn tool_app_follows_database_password() {
        let (svc, fakes) = testing::services("link-tool").await;
        let engine = AppEngine::new(svc.clone());
        let (mysql, _) =
            fixtures::seed_app(&engine, "mysql", app_type::RUNTIME, "8.0.35", fixtures::MYSQL_COMPOSE)
                .await;
        let (pma, _) =
            fixtures::seed_app(&engine, "phpmyadmin", app_type::TOOL, "5.2", fixtures::MYSQL_COMPOSE)
                .await;
        let server = seed_install(
            &engine,
            &mysql,
            "mysql-1",
            r#"{"PANEL_DB_ROOT_PASSWORD":"n3w"}"#,
        )
        .await;
        let tool = seed_install(
            &engine,
            &pma,
            "phpmyadmin-1",
            r#"{"PANEL_DB_ROOT_PASSWORD":"old","PANEL_DB_HOST":"x"}"#,
        )
        .await;
        tokio::fs::create_dir_all(engine.install_dir(&pma, &tool.name))
            .await
            .unwrap();

        engine.update_tool_app(&server, &mysql).await;

        let tool: AppInstall = svc.db.must(vec![Filter::Id(tool.id)]).await.unwrap();
        let env = env_file::from_json(&tool.env).unwrap();
        assert_eq!(env["PANEL_DB_ROOT_PASSWORD"], "n3w");
        assert_eq!(env["PANEL_DB_HOST"], "mysql-1");
        let written = env_file::read(&engine.install_dir(&pma, "phpmyadmin-1").join(".env"))
            .await
            .unwrap();
        assert_eq!(written["PANEL_DB_ROOT_PASSWORD"], "n3w");
        assert_eq!(fakes.runner.count("up -d"), 1);
    }
}
