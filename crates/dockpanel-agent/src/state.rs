use std::{sync::Arc, time::Duration};

use crate::{
    app::AppEngine,
    compose_runner::Compose,
    config::Config,
    container::{ContainerClient, DockerCliClient},
    daemon::DaemonJsonActor,
    db::Db,
    ports::{PortProber, TcpPortProber},
    provisioner::{DbProvisioner, DockerExecProvisioner},
    runner::{CommandRunner, TokioCommandRunner},
    snapshot::SnapshotEngine,
    task::TaskRuntime,
    transport::TransportRegistry,
};

/// Everything the engines need, built once at boot.
#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub db: Db,
    pub runner: Arc<dyn CommandRunner>,
    pub container: Arc<dyn ContainerClient>,
    pub ports: Arc<dyn PortProber>,
    pub transports: TransportRegistry,
    pub http: reqwest::Client,
    pub daemon: Arc<DaemonJsonActor>,
    pub tasks: TaskRuntime,
    pub provisioner: Arc<dyn DbProvisioner>,
}

impl Services {
    pub fn new(
        config: Config,
        db: Db,
        runner: Arc<dyn CommandRunner>,
        container: Arc<dyn ContainerClient>,
        ports: Arc<dyn PortProber>,
        provisioner: Arc<dyn DbProvisioner>,
    ) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("dockpanel-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let daemon = Arc::new(DaemonJsonActor::new(
            config.daemon_json_path.clone(),
            runner.clone(),
        ));
        Ok(Arc::new(Self {
            transports: TransportRegistry::new(db.clone(), http.clone()),
            tasks: TaskRuntime::new(db.clone()),
            config,
            db,
            runner,
            container,
            ports,
            http,
            daemon,
            provisioner,
        }))
    }

    /// Wires the host implementations: the docker CLI, real port probes and `docker exec`.
    pub fn for_host(config: Config, db: Db) -> anyhow::Result<Arc<Self>> {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let container = Arc::new(DockerCliClient::new(
            runner.clone(),
            &config.docker_bin,
            &config.tmp_dir,
        ));
        let provisioner = Arc::new(DockerExecProvisioner::new(runner.clone(), &config.docker_bin));
        Self::new(
            config,
            db,
            runner,
            container,
            Arc::new(TcpPortProber),
            provisioner,
        )
    }

    pub fn compose(&self) -> Compose<'_> {
        Compose::new(self.runner.as_ref(), &self.config.compose_bin)
    }
}

/// Shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub apps: AppEngine,
    pub snapshots: SnapshotEngine,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            apps: AppEngine::new(services.clone()),
            snapshots: SnapshotEngine::new(services.clone()),
            services,
        })
    }
}
