use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::Command,
};

#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// `bash -c <script>`; used where a pipeline is unavoidable.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash", ["-c".to_string(), script.into()])
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, the text compose prints on failure.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            _ => self.stderr.trim_end().to_string(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec, timeout: Duration) -> anyhow::Result<CommandOutput>;

    /// Runs the command and feeds every stdout/stderr line to `on_line` as it arrives.
    async fn run_streaming(
        &self,
        spec: CommandSpec,
        timeout: Duration,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<CommandOutput> {
        let out = self.run(spec, timeout).await?;
        for line in out.stdout.lines().chain(out.stderr.lines()) {
            on_line(line);
        }
        Ok(out)
    }
}

#[derive(Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(dir) = spec.current_dir.as_deref() {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: CommandSpec, timeout: Duration) -> anyhow::Result<CommandOutput> {
        let mut cmd = Self::command(&spec);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("timeout: {}", spec.program))??;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_streaming(
        &self,
        spec: CommandSpec,
        timeout: Duration,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<CommandOutput> {
        let mut cmd = Self::command(&spec);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr not captured"))?;

        let work = async {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_buf = String::new();
            let mut err_buf = String::new();
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line? {
                        Some(line) => {
                            on_line(&line);
                            out_buf.push_str(&line);
                            out_buf.push('\n');
                        }
                        None => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line? {
                        Some(line) => {
                            on_line(&line);
                            err_buf.push_str(&line);
                            err_buf.push('\n');
                        }
                        None => err_done = true,
                    },
                }
            }
            let status = child.wait().await?;
            anyhow::Ok(CommandOutput {
                status: status.code().unwrap_or(-1),
                stdout: out_buf,
                stderr: err_buf,
            })
        };

        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| anyhow::anyhow!("timeout: {}", spec.program))?
    }
}

/// Runs `spec` and fails with the combined output when the exit status is non-zero.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
    timeout: Duration,
) -> anyhow::Result<String> {
    let out = runner.run(spec, timeout).await?;
    if !out.success() {
        return Err(anyhow::anyhow!("{}", out.combined()));
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_prefers_both_streams() {
        let out = CommandOutput {
            status: 1,
            stdout: "pulling\n".to_string(),
            stderr: "error: boom\n".to_string(),
        };
        assert_eq!(out.combined(), "pulling\nerror: boom");

        let out = CommandOutput {
            status: 1,
            stdout: "  \n".to_string(),
            stderr: "only err".to_string(),
        };
        assert_eq!(out.combined(), "only err");
    }

    #[test]
    fn shell_wraps_script() {
        let spec = CommandSpec::shell("echo hi | cat").in_dir("/tmp");
        assert_eq!(spec.program, "bash");
        assert_eq!(spec.args, vec!["-c", "echo hi | cat"]);
        assert_eq!(spec.current_dir.as_deref(), Some(std::path::Path::new("/tmp")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_streams_lines() {
        let runner = TokioCommandRunner;
        let seen = std::sync::Mutex::new(Vec::new());
        let out = runner
            .run_streaming(
                CommandSpec::shell("echo one; echo two 1>&2"),
                Duration::from_secs(10),
                &|line| seen.lock().unwrap().push(line.to_string()),
            )
            .await
            .unwrap();
        assert!(out.success());
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_times_out() {
        let runner = TokioCommandRunner;
        let err = runner
            .run(CommandSpec::new("sleep", ["5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
