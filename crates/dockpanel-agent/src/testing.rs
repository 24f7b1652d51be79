//! Fakes shared by the engine tests.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::Config,
    container::{ContainerClient, ContainerSummary, classify_pull_error},
    db::{Db, TASK_EXECUTING},
    model::{Database, DatabaseSchema, TaskRecord},
    ports::PortProber,
    provisioner::DbProvisioner,
    runner::{CommandOutput, CommandRunner, CommandSpec},
    state::Services,
};

pub(crate) fn temp_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dockpanel-{tag}-{}", ulid::Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Records every command; the newest rule whose needle occurs in the command line answers it.
#[derive(Default)]
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, CommandOutput)>>,
}

impl FakeRunner {
    pub(crate) fn respond(&self, needle: &str, status: i32, stdout: &str) {
        self.rules.lock().unwrap().push((
            needle.to_string(),
            CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: CommandSpec, _timeout: Duration) -> anyhow::Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        let rules = self.rules.lock().unwrap();
        let hit = rules.iter().rev().find(|(needle, _)| line.contains(needle.as_str()));
        Ok(match hit {
            Some((_, out)) => out.clone(),
            None => CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeContainerClient {
    pub containers: Mutex<Vec<ContainerSummary>>,
    pub images: Mutex<Vec<String>>,
    pub pulled: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub saved: Mutex<Vec<Vec<String>>>,
    pub pull_error: Mutex<Option<String>>,
}

impl FakeContainerClient {
    pub(crate) fn set_containers(&self, items: &[(&str, &str)]) {
        *self.containers.lock().unwrap() = items
            .iter()
            .map(|(name, state)| ContainerSummary {
                name: name.to_string(),
                state: state.to_string(),
                labels: BTreeMap::new(),
            })
            .collect();
    }
}

#[async_trait]
impl ContainerClient for FakeContainerClient {
    async fn list_all_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<()> {
        if let Some(out) = self.pull_error.lock().unwrap().clone() {
            return Err(classify_pull_error(image, &out).into());
        }
        progress("Pull complete");
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn image_id(&self, image: &str) -> anyhow::Result<Option<String>> {
        let images = self.images.lock().unwrap();
        Ok(images
            .iter()
            .any(|i| i == image)
            .then(|| format!("sha256:{image}")))
    }

    async fn delete_image(&self, id: &str) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn save_images(&self, images: &[String], dest: &Path) -> anyhow::Result<()> {
        self.saved.lock().unwrap().push(images.to_vec());
        tokio::fs::write(dest, images.join("\n")).await?;
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        Ok("27.0.3".to_string())
    }

    async fn info(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "ServerVersion": "27.0.3" }))
    }

    async fn swarm_active(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
pub(crate) struct FakePorts {
    pub used: Mutex<HashSet<u16>>,
}

impl PortProber for FakePorts {
    fn in_use(&self, port: u16) -> bool {
        self.used.lock().unwrap().contains(&port)
    }
}

#[derive(Default)]
pub(crate) struct FakeProvisioner {
    pub created: Mutex<Vec<String>>,
    pub dropped: Mutex<Vec<String>>,
}

#[async_trait]
impl DbProvisioner for FakeProvisioner {
    async fn create_schema(
        &self,
        _server: &Database,
        _container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()> {
        self.created.lock().unwrap().push(schema.name.clone());
        Ok(())
    }

    async fn drop_schema(
        &self,
        _server: &Database,
        _container: &str,
        schema: &DatabaseSchema,
    ) -> anyhow::Result<()> {
        self.dropped.lock().unwrap().push(schema.name.clone());
        Ok(())
    }
}

pub(crate) struct Fakes {
    pub root: PathBuf,
    pub runner: Arc<FakeRunner>,
    pub container: Arc<FakeContainerClient>,
    pub ports: Arc<FakePorts>,
    pub provisioner: Arc<FakeProvisioner>,
}

/// Services over an in-memory store and a fresh directory tree.
pub(crate) async fn services(tag: &str) -> (Arc<Services>, Fakes) {
    build_services(tag, false).await
}

/// Like [`services`] but the store lives in `<root>/db/agent.db`, for code that copies it.
pub(crate) async fn services_with_db_file(tag: &str) -> (Arc<Services>, Fakes) {
    build_services(tag, true).await
}

async fn build_services(tag: &str, on_disk: bool) -> (Arc<Services>, Fakes) {
    let root = temp_root(tag);
    let config = Config::rooted_at(&root);
    let db = if on_disk {
        Db::open(&config.db_path()).await.unwrap()
    } else {
        Db::open(Path::new(":memory:")).await.unwrap()
    };
    let fakes = Fakes {
        root,
        runner: Arc::new(FakeRunner::default()),
        container: Arc::new(FakeContainerClient::default()),
        ports: Arc::new(FakePorts::default()),
        provisioner: Arc::new(FakeProvisioner::default()),
    };
    let services = Services::new(
        config,
        db,
        fakes.runner.clone(),
        fakes.container.clone(),
        fakes.ports.clone(),
        fakes.provisioner.clone(),
    )
    .unwrap();
    (services, fakes)
}

/// Polls the task row until the background worker has finished it.
pub(crate) async fn wait_task(db: &Db, id: &str) -> TaskRecord {
    for _ in 0..500 {
        if let Some(record) = db.get_task(id).await.unwrap()
            && record.status != TASK_EXECUTING
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not finish");
}
