use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::AppEngine;
use crate::{
    error::PanelError,
    model::{App, AppInstall, status},
    task::{NewTask, kind, scope, task_name},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operate {
    Start,
    Stop,
    Restart,
    Rebuild,
    Sync,
}

impl Operate {
    fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Rebuild => "rebuild",
            Self::Sync => "sync",
        }
    }
}

/// Container states keyed by `"/name"`.
pub(crate) type ContainerStates = HashMap<String, String>;

/// Works out the status an install should have given the runtime's containers.
///
/// Returns `None` when the stored status and message already match.
pub(crate) fn classify(
    install: &AppInstall,
    containers: &ContainerStates,
    force: bool,
) -> Option<(String, String)> {
    let names: Vec<&str> = install
        .container_name
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();

    let (mut running, mut restarting, mut paused) = (0, 0, 0);
    let mut exited = Vec::new();
    let mut missing = Vec::new();
    for name in &names {
        match containers.get(&format!("/{name}")).map(String::as_str) {
            None => missing.push(*name),
            Some("running") => running += 1,
            Some("exited") => exited.push(*name),
            Some("restarting") => restarting += 1,
            Some("paused") => paused += 1,
            Some(_) => {}
        }
    }

    let total = names.len();
    let next = if total == 0 || missing.len() == total {
        if install.status == status::UP_ERR && !force {
            return None;
        }
        (
            status::ERROR,
            PanelError::ContainerNotFound {
                name: names.join(","),
            }
            .to_string(),
        )
    } else if exited.len() == total {
        (status::STOPPED, String::new())
    } else if running == total {
        (status::RUNNING, String::new())
    } else if restarting == total {
        (status::RESTARTING, String::new())
    } else if paused == total {
        (status::PAUSED, String::new())
    } else {
        let parts: Vec<String> = exited
            .iter()
            .map(|name| PanelError::ContainerMsg { name: name.to_string() })
            .chain(missing.iter().map(|name| PanelError::ContainerNotFound {
                name: name.to_string(),
            }))
            .map(|e| e.to_string().trim_end_matches([';', ' ']).to_string())
            .collect();
        let message = if parts.is_empty() {
            PanelError::AppWarn.to_string()
        } else {
            parts.join("; ")
        };
        (status::UNHEALTHY, message)
    };

    if install.status == next.0 && install.message == next.1 {
        return None;
    }
    Some((next.0.to_string(), next.1))
}

impl AppEngine {
    pub(crate) async fn container_states(&self) -> anyhow::Result<ContainerStates> {
        Ok(self
            .services()
            .container
            .list_all_containers()
            .await?
            .into_iter()
            .map(|c| (format!("/{}", c.name), c.state))
            .collect())
    }

    /// Applies [`classify`] to one install and persists a change. Returns whether it changed.
    pub(crate) async fn sync_install(
        &self,
        install: &mut AppInstall,
        containers: &ContainerStates,
        force: bool,
    ) -> anyhow::Result<bool> {
        let Some((next, message)) = classify(install, containers, force) else {
            return Ok(false);
        };
        tracing::debug!(install = %install.name, from = %install.status, to = %next, "install status changed");
        install.status = next;
        install.message = message;
        self.save_install(install).await?;
        Ok(true)
    }

    /// Syncs every install whose status allows it against one container listing.
    pub async fn sync_all(&self) -> anyhow::Result<usize> {
        let containers = self.container_states().await?;
        let installs: Vec<AppInstall> = self.services().db.list(vec![]).await?;
        let mut changed = 0;
        for mut install in installs {
            if status::SYNC_SUPPRESSED.contains(&install.status.as_str()) {
                continue;
            }
            if self.sync_install(&mut install, &containers, false).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Runs a lifecycle verb on an install. Rebuild runs as a task and returns its id.
    pub async fn operate(&self, install_id: i64, op: Operate) -> anyhow::Result<Option<String>> {
        let mut install = self.install_by_id(install_id).await?;
        Self::ensure_idle(&install)?;
        let app = self.services().db.app_of(&install).await?;

        match op {
            Operate::Rebuild => return self.rebuild(app, install).await.map(Some),
            Operate::Sync => {}
            Operate::Start | Operate::Stop | Operate::Restart => {
                self.services()
                    .compose()
                    .operate(&self.stack(&app, &install), op.verb())
                    .await?;
                tracing::info!(install = %install.name, op = op.verb(), "install operated");
            }
        }
        let containers = self.container_states().await?;
        self.sync_install(&mut install, &containers, true).await?;
        Ok(None)
    }

    async fn rebuild(&self, app: App, mut install: AppInstall) -> anyhow::Result<String> {
        let mut task = self
            .services()
            .tasks
            .new_task(NewTask {
                name: task_name("Rebuild", scope::APP, &install.name),
                kind: kind::REBUILD,
                scope: scope::APP,
                task_id: None,
                resource_id: install.id,
            })
            .await?;
        install.status = status::REBUILDING.to_string();
        self.save_install(&mut install).await?;

        let (engine, id) = (self.clone(), install.id);
        task.add_sub_task("Rebuild", move |t| {
            let (engine, app) = (engine.clone(), app.clone());
            async move {
                let mut install = engine.install_by_id(id).await?;
                let stack = engine.stack(&app, &install);
                let compose = engine.services().compose();
                if let Err(e) = compose.down(&stack).await {
                    return Err(engine.handle_err(&mut install, e, "").await);
                }
                if let Err(e) = compose.up(&stack).await {
                    return Err(engine.handle_err(&mut install, e, "").await);
                }
                engine.refresh_container_names(&app, &mut install).await;
                install.status = status::RUNNING.to_string();
                install.message.clear();
                engine.save_install(&mut install).await?;
                t.log(format!("Rebuild {} done", install.name)).await;
                Ok(())
            }
        });
        Ok(task.run_async())
    }
}
