use std::{path::PathBuf, time::Duration};

use crate::runner::{CommandRunner, CommandSpec};

const UP_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const DOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const OP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

#[derive(Clone, Debug)]
pub struct ComposeRunnerConfig {
    pub compose_bin: String,
}

/// One compose project on disk: `<dir>/docker-compose.yml` plus the `.env` next to it.
#[derive(Clone, Debug)]
pub struct ComposeStack {
    pub project_name: String,
    pub dir: PathBuf,
}

impl ComposeStack {
    pub fn new(project_name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            project_name: project_name.into(),
            dir: dir.into(),
        }
    }

    pub fn compose_path(&self) -> PathBuf {
        self.dir.join("docker-compose.yml")
    }

    pub fn base_command(&self, cfg: &ComposeRunnerConfig) -> CommandSpec {
        let mut args: Vec<String> = Vec::new();

        if is_docker_plugin(&cfg.compose_bin) {
            args.push("compose".to_string());
        }

        args.push("-f".to_string());
        args.push(self.compose_path().to_string_lossy().to_string());

        let env_file = self.dir.join(".env");
        if env_file.exists() {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().to_string());
        }

        args.push("--project-name".to_string());
        args.push(sanitize_project_name(&self.project_name));

        CommandSpec {
            program: cfg.compose_bin.clone(),
            args,
            env: Vec::new(),
            current_dir: Some(self.dir.clone()),
        }
    }

    fn command(&self, cfg: &ComposeRunnerConfig, verb: &[&str]) -> CommandSpec {
        let mut cmd = self.base_command(cfg);
        cmd.args.extend(verb.iter().map(|s| s.to_string()));
        cmd
    }

    pub fn up(&self, cfg: &ComposeRunnerConfig) -> CommandSpec {
        self.command(cfg, &["up", "-d"])
    }

    pub fn down(&self, cfg: &ComposeRunnerConfig) -> CommandSpec {
        self.command(cfg, &["down", "--remove-orphans"])
    }

    pub fn pull(&self, cfg: &ComposeRunnerConfig) -> CommandSpec {
        self.command(cfg, &["pull"])
    }

    pub fn operate(&self, cfg: &ComposeRunnerConfig, verb: &str) -> CommandSpec {
        self.command(cfg, &[verb])
    }
}

/// Thin executor over the compose verbs. A non-zero exit becomes an error whose message is the
/// captured output, which callers persist as the install's message.
#[derive(Clone)]
pub struct Compose<'a> {
    pub runner: &'a dyn CommandRunner,
    pub cfg: ComposeRunnerConfig,
}

impl<'a> Compose<'a> {
    pub fn new(runner: &'a dyn CommandRunner, compose_bin: &str) -> Self {
        Self {
            runner,
            cfg: ComposeRunnerConfig {
                compose_bin: compose_bin.to_string(),
            },
        }
    }

    async fn exec(&self, spec: CommandSpec, timeout: Duration) -> anyhow::Result<String> {
        let out = self.runner.run(spec, timeout).await?;
        if !out.success() {
            return Err(anyhow::anyhow!("{}", out.combined()));
        }
        Ok(out.stdout)
    }

    pub async fn up(&self, stack: &ComposeStack) -> anyhow::Result<String> {
        self.exec(stack.up(&self.cfg), UP_TIMEOUT).await
    }

    pub async fn down(&self, stack: &ComposeStack) -> anyhow::Result<String> {
        self.exec(stack.down(&self.cfg), DOWN_TIMEOUT).await
    }

    pub async fn pull(&self, stack: &ComposeStack) -> anyhow::Result<String> {
        self.exec(stack.pull(&self.cfg), UP_TIMEOUT).await
    }

    /// `start`, `stop` or `restart`.
    pub async fn operate(&self, stack: &ComposeStack, verb: &str) -> anyhow::Result<String> {
        self.exec(stack.operate(&self.cfg, verb), OP_TIMEOUT).await
    }
}

fn is_docker_plugin(compose_bin: &str) -> bool {
    let bin = compose_bin.to_ascii_lowercase();
    bin == "docker" || bin.ends_with("/docker") || bin.ends_with("\\docker")
}

fn sanitize_project_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' || ch == '_' {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "dockpanel".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_compose_plugin_builds_args() {
        let stack = ComposeStack::new("MySQL 1", "/srv/apps/mysql/mysql-1");
        let cfg = ComposeRunnerConfig {
            compose_bin: "docker".to_string(),
        };
        let cmd = stack.up(&cfg);
        assert_eq!(cmd.program, "docker");
        assert_eq!(cmd.args[0], "compose");
        assert_eq!(cmd.args[2], "/srv/apps/mysql/mysql-1/docker-compose.yml");
        assert!(cmd.args.windows(2).any(|w| w == ["--project-name", "mysql-1"]));
        assert_eq!(&cmd.args[cmd.args.len() - 2..], ["up", "-d"]);
        assert_eq!(
            cmd.current_dir.as_deref(),
            Some(std::path::Path::new("/srv/apps/mysql/mysql-1"))
        );
    }

    #[test]
    fn docker_compose_v1_builds_args() {
        let stack = ComposeStack::new("app", "/srv/app");
        let cfg = ComposeRunnerConfig {
            compose_bin: "docker-compose".to_string(),
        };
        let cmd = stack.operate(&cfg, "restart");
        assert_eq!(cmd.program, "docker-compose");
        assert_ne!(cmd.args[0], "compose");
        assert_eq!(cmd.args.last().map(String::as_str), Some("restart"));
    }
}
