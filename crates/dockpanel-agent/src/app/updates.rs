use serde::Serialize;

use super::AppEngine;
use crate::{
    db::Filter,
    model::{App, AppDetail, AppIgnoreUpgrade, AppInstall, app_type, status},
    version::{self, is_cross_version, is_newer, major_minor},
};

const MYSQL: &str = "mysql";

/// An install as listed to the user, with whether a newer version is offered.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledView {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    pub app_detail_id: i64,
    pub version: String,
    pub status: String,
    pub message: String,
    pub http_port: i64,
    pub https_port: i64,
    pub icon: String,
    pub app_name: String,
    pub app_key: String,
    pub app_type: String,
    pub path: String,
    pub created_at: String,
    pub webui: String,
    pub favorite: bool,
    pub container: String,
    pub github: String,
    pub website: String,
    pub document: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_compose: String,
    pub can_update: bool,
}

fn same_line(candidate: &str, line: &str) -> bool {
    candidate == line || candidate.starts_with(&format!("{line}."))
}

impl AppEngine {
    /// Whether update checks skip this install entirely.
    pub async fn ignore_upgrade(&self, install: &AppInstall, app: &App) -> anyhow::Result<bool> {
        if app.kind == app_type::PHP || install.status == status::INSTALLING {
            return Ok(true);
        }
        let db = &self.services().db;
        if app.key == MYSQL {
            let line = major_minor(&install.version);
            let details: Vec<AppDetail> = db.list(vec![Filter::AppId(app.id)]).await?;
            let newer_on_line = details
                .iter()
                .any(|d| same_line(&d.version, &line) && is_newer(&d.version, &install.version));
            return Ok(!newer_on_line);
        }
        let ignored = db
            .count::<AppIgnoreUpgrade>(vec![
                Filter::AppId(app.id),
                Filter::Eq("scope", "all".to_string().into()),
            ])
            .await?;
        Ok(ignored > 0)
    }

    /// Versions an install may move to, newest first.
    async fn candidate_versions(&self, install: &AppInstall, app: &App) -> anyhow::Result<Vec<String>> {
        if install.version == "latest" {
            return Ok(Vec::new());
        }
        let db = &self.services().db;
        let details: Vec<AppDetail> = db.list(vec![Filter::AppId(app.id)]).await?;
        let mut versions = Vec::new();
        for detail in details {
            let pinned = db
                .count::<AppIgnoreUpgrade>(vec![
                    Filter::Eq("app_detail_id", detail.id.into()),
                    Filter::Eq("scope", "version".to_string().into()),
                ])
                .await?;
            if pinned > 0 {
                continue;
            }
            if is_cross_version(&install.version, &detail.version) && !app.cross_version_update {
                continue;
            }
            versions.push(detail.version);
        }
        version::sort_desc(&mut versions);
        Ok(versions)
    }

    fn can_update(install: &AppInstall, app: &App, versions: &[String]) -> bool {
        let Some(mut last) = versions.first() else {
            return false;
        };
        if app.key == MYSQL {
            let line = major_minor(&install.version);
            if let Some(pinned) = versions.iter().find(|v| same_line(v, &line)) {
                last = pinned;
            }
        }
        if is_cross_version(&install.version, last) {
            app.cross_version_update
        } else {
            is_newer(last, &install.version)
        }
    }

    /// Lists installs, optionally only those with an update, optionally syncing status first.
    pub async fn list_installed(
        &self,
        updated_only: bool,
        sync: bool,
    ) -> anyhow::Result<Vec<InstalledView>> {
        let db = &self.services().db;
        let installs: Vec<AppInstall> = db.list(vec![Filter::OrderBy("created_at DESC, id DESC")]).await?;
        let containers = if sync {
            match self.container_states().await {
                Ok(states) => Some(states),
                Err(e) => {
                    tracing::warn!(error = %e, "list containers for sync failed");
                    None
                }
            }
        } else {
            None
        };

        let mut out = Vec::new();
        for mut install in installs {
            let app = db.app_of(&install).await?;
            if updated_only && self.ignore_upgrade(&install, &app).await? {
                continue;
            }
            if let Some(states) = &containers
                && !status::SYNC_SUPPRESSED.contains(&install.status.as_str())
            {
                self.sync_install(&mut install, states, false).await?;
            }

            let versions = self.candidate_versions(&install, &app).await?;
            let can_update = Self::can_update(&install, &app, &versions);
            if updated_only && !can_update {
                continue;
            }
            out.push(InstalledView {
                path: self
                    .install_dir(&app, &install.name)
                    .to_string_lossy()
                    .to_string(),
                docker_compose: if updated_only {
                    install.docker_compose.clone()
                } else {
                    String::new()
                },
                id: install.id,
                name: install.name,
                app_id: install.app_id,
                app_detail_id: install.app_detail_id,
                version: install.version,
                status: install.status,
                message: install.message,
                http_port: install.http_port,
                https_port: install.https_port,
                icon: app.icon,
                app_name: app.name,
                app_key: app.key,
                app_type: app.kind,
                created_at: install.created_at,
                webui: install.webui,
                favorite: install.favorite,
                container: install.container_name,
                github: app.github,
                website: app.website,
                document: app.document,
                can_update,
            });
        }
        Ok(out)
    }
}
