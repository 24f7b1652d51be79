//! Creates and drops schemas inside locally installed database servers.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::PanelError,
    model::{Database, DatabaseSchema},
    runner::{CommandRunner, CommandSpec, run_checked},
};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Characters that must never reach a shell or SQL string built from user input.
const ILLEGAL: &[char] = &[
    '&', '|', ';', '$', '\'', '`', '(', ')', '"', '\n', '\r', '>', '<', '\\', ' ',
];

/// Rejects names and credentials that could break out of the generated commands.
pub fn check_cmd_illegal(values: &[&str]) -> anyhow::Result<()> {
    if values.iter().any(|v| v.contains(ILLEGAL)) {
        return Err(PanelError::CmdIllegal.into());
    }
    Ok(())
}

#[async_trait]
pub trait DbProvisioner: Send + Sync {
    /// Creates `schema` with its user inside `server`, running in `container`.
    async fn create_schema(
        &self,
        server: &Database,
        container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()>;

    async fn drop_schema(
        &self,
        server: &Database,
        container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()>;
}

/// Runs the server's own client through `docker exec`.
pub struct DockerExecProvisioner {
    runner: Arc<dyn CommandRunner>,
    docker_bin: String,
}

impl DockerExecProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, docker_bin: &str) -> Self {
        Self {
            runner,
            docker_bin: docker_bin.to_string(),
        }
    }

    fn exec(&self, server: &Database, container: &str, sql: String) -> anyhow::Result<CommandSpec> {
        let args = match server.kind.as_str() {
            "mysql" | "mariadb" => vec![
                "exec".to_string(),
                container.to_string(),
                "mysql".to_string(),
                format!("-u{}", server.username),
                format!("-p{}", server.password),
                "-e".to_string(),
                sql,
            ],
            "postgresql" | "postgres" => vec![
                "exec".to_string(),
                "-e".to_string(),
                format!("PGPASSWORD={}", server.password),
                container.to_string(),
                "psql".to_string(),
                "-U".to_string(),
                server.username.clone(),
                "-c".to_string(),
                sql,
            ],
            other => return Err(anyhow::anyhow!("schemas are not supported on {other}")),
        };
        Ok(CommandSpec::new(self.docker_bin.clone(), args))
    }

    async fn run_all(
        &self,
        server: &Database,
        container: &str,
        statements: Vec<String>,
    ) -> anyhow::Result<()> {
        for sql in statements {
            let spec = self.exec(server, container, sql)?;
            run_checked(self.runner.as_ref(), spec, EXEC_TIMEOUT)
                .await
                .map_err(|e| anyhow::anyhow!(crate::archive::mask_secret(&e.to_string(), &server.password)))?;
        }
        Ok(())
    }
}

fn create_statements(kind: &str, schema: &DatabaseSchema) -> Vec<String> {
    let (name, user, pass) = (&schema.name, &schema.username, &schema.password);
    match kind {
        "mysql" | "mariadb" => {
            let format = if schema.format.is_empty() { "utf8mb4" } else { &schema.format };
            vec![format!(
                "CREATE DATABASE IF NOT EXISTS `{name}` DEFAULT CHARACTER SET {format}; \
CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{pass}'; \
GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'%'; FLUSH PRIVILEGES;"
            )]
        }
        _ => {
            let format = if schema.format.is_empty() { "UTF8" } else { &schema.format };
            vec![
                format!("CREATE USER \"{user}\" WITH PASSWORD '{pass}' SUPERUSER;"),
                format!("CREATE DATABASE \"{name}\" OWNER \"{user}\" ENCODING '{format}';"),
            ]
        }
    }
}

fn drop_statements(kind: &str, schema: &DatabaseSchema) -> Vec<String> {
    let (name, user) = (&schema.name, &schema.username);
    match kind {
        "mysql" | "mariadb" => vec![format!(
            "DROP DATABASE IF EXISTS `{name}`; DROP USER IF EXISTS '{user}'@'%';"
        )],
        _ => vec![
            format!("DROP DATABASE IF EXISTS \"{name}\";"),
            format!("DROP USER IF EXISTS \"{user}\";"),
        ],
    }
}

#[async_trait]
impl DbProvisioner for DockerExecProvisioner {
    async fn create_schema(
        &self,
        server: &Database,
        container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()> {
        check_cmd_illegal(&[&schema.name, &schema.username, &schema.password, &schema.format])?;
        self.run_all(server, container, create_statements(&server.kind, schema))
            .await
    }

    async fn drop_schema(
        &self,
        server: &Database,
        container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()> {
        check_cmd_illegal(&[&schema.name, &schema.username])?;
        self.run_all(server, container, drop_statements(&server.kind, schema))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::runner::CommandOutput;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: CommandSpec, _timeout: Duration) -> anyhow::Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.args);
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn schema(name: &str) -> DatabaseSchema {
        DatabaseSchema {
            name: name.to_string(),
            kind: "mysql".to_string(),
            username: "wp".to_string(),
            password: "pw123".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn illegal_characters_are_rejected() {
        assert!(check_cmd_illegal(&["wordpress", "wp_user"]).is_ok());
        let err = check_cmd_illegal(&["wp; DROP"]).unwrap_err();
        assert!(matches!(crate::error::panel_error(&err), Some(PanelError::CmdIllegal)));
    }

    #[tokio::test]
    async fn mysql_schema_is_created_through_exec() {
        let runner = Arc::new(RecordingRunner::default());
        let p = DockerExecProvisioner::new(runner.clone(), "docker");
        let server = Database {
            kind: "mysql".to_string(),
            username: "root".to_string(),
            password: "s3cr".to_string(),
            ..Default::default()
        };
        p.create_schema(&server, "dp-mysql-ab12", &schema("wordpress"))
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0][..4], ["exec", "dp-mysql-ab12", "mysql", "-uroot"]);
        assert!(calls[0][6].contains("CREATE DATABASE IF NOT EXISTS `wordpress`"));
    }

    #[tokio::test]
    async fn unsupported_server_fails() {
        let p = DockerExecProvisioner::new(Arc::new(RecordingRunner::default()), "docker");
        let server = Database {
            kind: "redis".to_string(),
            ..Default::default()
        };
        assert!(p.create_schema(&server, "c", &schema("x")).await.is_err());
    }
}
