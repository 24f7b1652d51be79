//! App lifecycle engine: install, upgrade, uninstall, rebuild and status sync of compose apps.
//!
//! Long operations allocate a [`crate::task::Task`] whose steps run on a background worker; the
//! install row carries the user-visible status and message while the task log carries the detail.

mod backup;
mod install;
mod link;
mod local;
mod operate;
mod port;
mod uninstall;
mod updates;
mod upgrade;

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    compose,
    compose_runner::ComposeStack,
    db::Filter,
    env_file::{self, EnvMap},
    error::PanelError,
    model::{App, AppInstall, app_type, resource, status},
    runner::CommandSpec,
    state::Services,
    task::TaskCtx,
};

pub use install::InstallRequest;
pub use operate::Operate;
pub use uninstall::UninstallRequest;
pub use updates::InstalledView;
pub use upgrade::UpgradeRequest;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Apps that are database servers, with the port a linked app reaches them on.
pub const DATABASE_KEYS: &[(&str, i64)] = &[
    ("mysql", 3306),
    ("mariadb", 3306),
    ("postgresql", 5432),
    ("postgres", 5432),
    ("mongodb", 27017),
    ("redis", 6379),
    ("memcached", 11211),
];

pub const TOOL_KEYS: &[(&str, i64)] = &[("minio", 9001)];

/// Database app key to the management tool that follows its credentials.
pub const APP_TOOLS: &[(&str, &str)] = &[
    ("mysql", "phpmyadmin"),
    ("postgresql", "pgadmin4"),
    ("redis", "redis-commander"),
];

pub fn database_port(key: &str) -> Option<i64> {
    DATABASE_KEYS
        .iter()
        .chain(TOOL_KEYS)
        .find(|(k, _)| *k == key)
        .map(|(_, p)| *p)
}

fn is_database_key(key: &str) -> bool {
    DATABASE_KEYS.iter().any(|(k, _)| *k == key)
}

/// Server kinds that host per-app schemas.
fn hosts_schemas(kind: &str) -> bool {
    matches!(kind, "mysql" | "mariadb" | "postgresql" | "postgres")
}

#[derive(Clone)]
pub struct AppEngine {
    svc: Arc<Services>,
}

impl AppEngine {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    pub fn services(&self) -> &Services {
        &self.svc
    }

    /// Directory name of an app under the resource and install roots.
    fn dir_key(app: &App) -> &str {
        if app.resource == resource::LOCAL {
            app.key.strip_prefix("local").unwrap_or(&app.key)
        } else {
            &app.key
        }
    }

    pub fn install_dir(&self, app: &App, name: &str) -> PathBuf {
        let root = if app.resource == resource::LOCAL {
            self.svc.config.local_app_install_dir()
        } else {
            self.svc.config.app_install_dir()
        };
        root.join(Self::dir_key(app)).join(name)
    }

    /// Template payload of one app version.
    pub fn detail_dir(&self, app: &App, version: &str) -> PathBuf {
        self.svc
            .config
            .resource_apps_dir(&app.resource)
            .join(Self::dir_key(app))
            .join(version)
    }

    fn stack(&self, app: &App, install: &AppInstall) -> ComposeStack {
        ComposeStack::new(&install.name, self.install_dir(app, &install.name))
    }

    pub(crate) async fn install_env(&self, app: &App, install: &AppInstall) -> EnvMap {
        let path = self.install_dir(app, &install.name).join(".env");
        match env_file::read(&path).await {
            Ok(env) => env,
            Err(_) => env_file::from_json(&install.env).unwrap_or_default(),
        }
    }

    async fn save_install(&self, install: &mut AppInstall) -> anyhow::Result<()> {
        install.updated_at = crate::ids::now_rfc3339()?;
        self.svc.db.save(install).await
    }

    /// Persists `up_err` for a failed compose call; prefers the captured output as message.
    async fn handle_err(
        &self,
        install: &mut AppInstall,
        err: anyhow::Error,
        out: &str,
    ) -> anyhow::Error {
        let (message, returned) = if out.is_empty() {
            (format!("{err:#}"), err)
        } else {
            (out.to_string(), anyhow::anyhow!("{out}"))
        };
        install.status = status::UP_ERR.to_string();
        install.message = message;
        if let Err(e) = self.save_install(install).await {
            tracing::warn!(install = %install.name, error = %e, "persist up_err failed");
        }
        returned
    }

    /// Re-reads the expected container names from the final compose and env.
    async fn refresh_container_names(&self, app: &App, install: &mut AppInstall) {
        let env = self.install_env(app, install).await;
        match compose::load_project(&install.docker_compose, &env) {
            Ok(project) => {
                install.container_name =
                    compose::container_names(&project, &install.container_name).join(",");
            }
            Err(e) => tracing::warn!(install = %install.name, error = %e, "load compose project failed"),
        }
    }

    /// Pulls images when asked, then `compose up`; persists `running` or `up_err`.
    pub(crate) async fn up_app(
        &self,
        t: &TaskCtx,
        install: &mut AppInstall,
        pull_images: bool,
    ) -> anyhow::Result<()> {
        let app = self.svc.db.app_of(install).await?;
        self.refresh_container_names(&app, install).await;
        if install.id > 0 {
            self.save_install(install).await?;
        }

        if pull_images && app.kind != app_type::PHP {
            let env = self.install_env(&app, install).await;
            let images = compose::get_images(&install.docker_compose, &env)?;
            for image in images {
                let image = match self.svc.config.image_prefix.as_deref() {
                    Some(prefix) if !image.starts_with(prefix) => {
                        compose::rewrite_image(&image, prefix)
                    }
                    _ => image,
                };
                let label = format!("Pull image {image}");
                t.log_start(&label).await;
                let progress = |line: &str| tracing::debug!(image = %image, "{line}");
                if let Err(e) = self.svc.container.pull_image(&image, &progress).await {
                    t.log_failed(&label, &e).await;
                    install.status = status::UP_ERR.to_string();
                    install.message = match crate::error::panel_error(&e) {
                        Some(kind)
                            if matches!(
                                kind,
                                PanelError::NoSuchHost { .. } | PanelError::ImagePullTimeOut { .. }
                            ) =>
                        {
                            format!("{}: {e}", kind.key())
                        }
                        _ => format!("{e:#}"),
                    };
                    self.save_install(install).await?;
                    return Err(e);
                }
                t.log_success(&label).await;
            }
        }

        t.log_start("Run App").await;
        let stack = self.stack(&app, install);
        if let Err(e) = self.svc.compose().up(&stack).await {
            t.log_failed("Run App", &e).await;
            install.status = status::UP_ERR.to_string();
            install.message = e.to_string();
            self.save_install(install).await?;
            return Err(e);
        }
        t.log_success("Run App").await;
        install.status = status::RUNNING.to_string();
        install.message.clear();
        self.save_install(install).await
    }

    /// Runs `scripts/<operate>.sh` of an install when the bundle ships one.
    pub(crate) async fn run_script(
        &self,
        t: &TaskCtx,
        app: &App,
        install: &AppInstall,
        operate: &str,
    ) -> anyhow::Result<()> {
        let work_dir = self.install_dir(app, &install.name);
        let script = work_dir.join("scripts").join(format!("{operate}.sh"));
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            return Ok(());
        }
        let label = format!("Execute {operate} script");
        t.log_start(&label).await;
        let spec = CommandSpec::new("bash", [script.to_string_lossy().to_string()]).in_dir(&work_dir);
        let out = self.svc.runner.run(spec, SCRIPT_TIMEOUT).await?;
        if !out.success() {
            let text = out.combined();
            let err = if text.is_empty() {
                anyhow::anyhow!("{operate}.sh exited with status {}", out.status)
            } else {
                anyhow::anyhow!("{text}")
            };
            t.log_failed(&label, &err).await;
            return Err(err);
        }
        t.log_success(&label).await;
        Ok(())
    }

    async fn install_by_id(&self, id: i64) -> anyhow::Result<AppInstall> {
        self.svc.db.must(vec![Filter::Id(id)]).await
    }

    fn ensure_idle(install: &AppInstall) -> anyhow::Result<()> {
        if status::BUSY.contains(&install.status.as_str()) {
            return Err(PanelError::Busy {
                name: install.name.clone(),
            }
            .into());
        }
        Ok(())
    }
}
