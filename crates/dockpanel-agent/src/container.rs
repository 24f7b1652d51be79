use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    error::PanelError,
    runner::{CommandRunner, CommandSpec},
};

const PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const SAVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub state: String,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait ContainerClient: Send + Sync {
    async fn list_all_containers(&self) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Pulls `image`, handing every progress line to `progress`.
    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<()>;

    async fn image_id(&self, image: &str) -> anyhow::Result<Option<String>>;
    async fn delete_image(&self, id: &str) -> anyhow::Result<()>;

    /// `repository:tag` of every local image.
    async fn list_images(&self) -> anyhow::Result<Vec<String>>;

    /// Saves `images` into a gzip-compressed tarball at `dest`.
    async fn save_images(&self, images: &[String], dest: &Path) -> anyhow::Result<()>;

    async fn ping(&self) -> anyhow::Result<()>;
    async fn server_version(&self) -> anyhow::Result<String>;
    async fn info(&self) -> anyhow::Result<serde_json::Value>;

    /// `true` when this engine is a swarm node.
    async fn swarm_active(&self) -> anyhow::Result<bool>;
}

/// Maps the output of a failed pull onto the error kinds surfaced to users.
pub fn classify_pull_error(image: &str, output: &str) -> PanelError {
    let lower = output.to_ascii_lowercase();
    if lower.contains("no such host") {
        PanelError::NoSuchHost {
            detail: format!("{image}: {}", output.trim()),
        }
    } else if lower.contains("timeout") {
        PanelError::ImagePullTimeOut {
            detail: format!("{image}: {}", output.trim()),
        }
    } else {
        PanelError::DockerPullImage {
            err: format!("{image}: {}", output.trim()),
        }
    }
}

#[derive(Clone)]
pub struct DockerCliClient {
    runner: Arc<dyn CommandRunner>,
    docker_bin: String,
    tmp_dir: PathBuf,
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

#[derive(Deserialize)]
struct SwarmInfo {
    #[serde(rename = "LocalNodeState", default)]
    local_node_state: String,
}

impl DockerCliClient {
    pub fn new(runner: Arc<dyn CommandRunner>, docker_bin: &str, tmp_dir: &Path) -> Self {
        Self {
            runner,
            docker_bin: docker_bin.to_string(),
            tmp_dir: tmp_dir.to_path_buf(),
        }
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.docker_bin.clone(), args)
    }

    async fn query(&self, spec: CommandSpec) -> anyhow::Result<String> {
        let display = spec.display();
        let out = self.runner.run(spec, QUERY_TIMEOUT).await?;
        if !out.success() {
            return Err(anyhow::anyhow!("{display}: {}", out.combined()));
        }
        Ok(out.stdout)
    }
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

pub(crate) fn parse_ps_output(stdout: &str) -> anyhow::Result<Vec<ContainerSummary>> {
    let mut out = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let row: PsLine = serde_json::from_str(line).context("parse docker ps line")?;
        // `Names` may list several aliases; the first one is the container's own name.
        let name = row.names.split(',').next().unwrap_or_default().to_string();
        out.push(ContainerSummary {
            name,
            state: row.state,
            labels: parse_labels(&row.labels),
        });
    }
    Ok(out)
}

#[async_trait]
impl ContainerClient for DockerCliClient {
    async fn list_all_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let stdout = self
            .query(self.spec(["ps", "-a", "--no-trunc", "--format", "{{json .}}"]))
            .await?;
        parse_ps_output(&stdout)
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<()> {
        let out = match self
            .runner
            .run_streaming(self.spec(["pull", image]), PULL_TIMEOUT, progress)
            .await
        {
            Ok(out) => out,
            Err(e) => return Err(classify_pull_error(image, &e.to_string()).into()),
        };
        if !out.success() {
            return Err(classify_pull_error(image, &out.combined()).into());
        }
        Ok(())
    }

    async fn image_id(&self, image: &str) -> anyhow::Result<Option<String>> {
        let out = self
            .runner
            .run(
                self.spec(["image", "inspect", "--format", "{{.Id}}", image]),
                QUERY_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let id = out.stdout.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    async fn delete_image(&self, id: &str) -> anyhow::Result<()> {
        self.query(self.spec(["rmi", "-f", id])).await?;
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        let stdout = self
            .query(self.spec(["images", "--format", "{{.Repository}}:{{.Tag}}"]))
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn save_images(&self, images: &[String], dest: &Path) -> anyhow::Result<()> {
        if images.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let raw = self
            .tmp_dir
            .join(format!("images-{}.tar", ulid::Ulid::new()));
        let mut args = vec![
            "save".to_string(),
            "-o".to_string(),
            raw.to_string_lossy().to_string(),
        ];
        args.extend(images.iter().cloned());
        let out = self.runner.run(self.spec(args), SAVE_TIMEOUT).await?;
        if !out.success() {
            let _ = tokio::fs::remove_file(&raw).await;
            return Err(anyhow::anyhow!("docker save failed: {}", out.combined()));
        }
        let result = crate::archive::gzip_file(&raw, dest).await;
        let _ = tokio::fs::remove_file(&raw).await;
        result
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.server_version().await.map(|_| ())
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        let stdout = self
            .query(self.spec(["version", "--format", "{{.Server.Version}}"]))
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn info(&self) -> anyhow::Result<serde_json::Value> {
        let stdout = self.query(self.spec(["info", "--format", "{{json .}}"])).await?;
        serde_json::from_str(stdout.trim()).context("parse docker info")
    }

    async fn swarm_active(&self) -> anyhow::Result<bool> {
        let stdout = self
            .query(self.spec(["info", "--format", "{{json .Swarm}}"]))
            .await?;
        let swarm: SwarmInfo = serde_json::from_str(stdout.trim()).context("parse swarm info")?;
        Ok(swarm.local_node_state == "active")
    }
}
