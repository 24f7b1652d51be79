//! Catalogue of apps dropped into `<resource>/apps/local` by hand.

use std::path::Path;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppEngine;
use crate::{
    db::{CatalogueChanges, CatalogueEntry},
    error::PanelError,
    model::{App, AppDetail, resource, status},
};

const LOCAL_TAG: &str = "Local";
const LOCAL_RECOMMEND: i64 = 9999;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppFile {
    #[serde(rename = "additionalProperties")]
    props: AppProps,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AppProps {
    key: String,
    name: String,
    tags: Vec<String>,
    short_desc_zh: String,
    short_desc_en: String,
    description: Description,
    #[serde(rename = "type")]
    kind: String,
    cross_version_update: bool,
    limit: i64,
    website: String,
    github: String,
    document: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Description {
    zh: String,
    en: String,
}

async fn read_required(dir: &Path, file: &str) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(dir.join(file)).await.map_err(|_| {
        PanelError::FileNotFound {
            name: file.to_string(),
        }
        .into()
    })
}

fn parse_error(name: &str, err: impl std::fmt::Display) -> anyhow::Error {
    PanelError::FileParseApp {
        name: name.to_string(),
        err: err.to_string(),
    }
    .into()
}

/// Reads the app-level `data.yml`, `logo.png` and `README.md` of one local app directory.
async fn read_local_app(dir: &Path) -> anyhow::Result<(App, Vec<String>)> {
    let raw = read_required(dir, "data.yml").await?;
    let logo = read_required(dir, "logo.png").await?;
    let file: AppFile = serde_yaml_ng::from_slice(&raw).map_err(|e| parse_error("data.yml", e))?;
    let mut props = file.props;
    if props.key.is_empty() {
        return Err(parse_error("data.yml", "additionalProperties.key is missing"));
    }

    if !props.short_desc_zh.is_empty() {
        props.description.zh = props.short_desc_zh.clone();
    }
    if !props.short_desc_en.is_empty() {
        props.description.en = props.short_desc_en.clone();
    }
    let readme = tokio::fs::read_to_string(dir.join("README.md"))
        .await
        .unwrap_or_default();

    let app = App {
        key: format!("local{}", props.key),
        name: props.name,
        short_desc_zh: props.short_desc_zh,
        short_desc_en: props.short_desc_en,
        description: serde_json::to_string(&props.description)?,
        icon: base64::engine::general_purpose::STANDARD.encode(logo),
        readme,
        kind: props.kind,
        resource: resource::LOCAL.to_string(),
        limit: props.limit,
        cross_version_update: props.cross_version_update,
        status: status::NORMAL.to_string(),
        website: props.website,
        github: props.github,
        document: props.document,
        recommend: LOCAL_RECOMMEND,
        ..Default::default()
    };
    let mut tags = props.tags;
    tags.push(LOCAL_TAG.to_string());
    Ok((app, tags))
}

/// Reads one version directory: `docker-compose.yml` plus the form schema in `data.yml`.
pub(crate) async fn read_local_version(dir: &Path) -> anyhow::Result<AppDetail> {
    let compose = read_required(dir, "docker-compose.yml").await?;
    let docker_compose = String::from_utf8(compose).map_err(|e| parse_error("docker-compose.yml", e))?;
    let raw = read_required(dir, "data.yml").await?;
    let doc: serde_yaml_ng::Value =
        serde_yaml_ng::from_slice(&raw).map_err(|e| parse_error("data.yml", e))?;
    let props = doc
        .get("additionalProperties")
        .cloned()
        .unwrap_or(serde_yaml_ng::Value::Null);
    let params: Value = serde_json::to_value(&props).map_err(|e| parse_error("data.yml", e))?;

    if let Some(fields) = params.get("formFields") {
        let fields = fields.as_array().ok_or_else(|| PanelError::AppParamKey {
            name: "formFields".to_string(),
        })?;
        for field in fields {
            let Some(field) = field.as_object() else {
                return Err(PanelError::AppParamKey {
                    name: "formFields".to_string(),
                }
                .into());
            };
            if let Some(key) = field.get("envKey").and_then(Value::as_str)
                && key.contains(' ')
            {
                return Err(PanelError::AppParamKey {
                    name: key.to_string(),
                }
                .into());
            }
            if let Some((key, _)) = field.iter().find(|(_, v)| v.is_null()) {
                return Err(PanelError::AppParamKey { name: key.clone() }.into());
            }
        }
    }

    let version = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(AppDetail {
        version,
        docker_compose,
        params: params.to_string(),
        status: status::NORMAL.to_string(),
        ..Default::default()
    })
}

async fn sub_dirs(dir: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

impl AppEngine {
    /// Rescans the local app directory and replaces the stored local catalogue.
    ///
    /// Apps or versions that fail to parse are skipped with a warning.
    pub async fn sync_local_apps(&self) -> anyhow::Result<CatalogueChanges> {
        let root = self.services().config.resource_apps_dir(resource::LOCAL);
        tokio::fs::create_dir_all(&root).await?;

        let mut entries = Vec::new();
        for app_dir in sub_dirs(&root).await? {
            let (app, tags) = match read_local_app(&app_dir).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(dir = %app_dir.display(), error = %e, "skip local app");
                    continue;
                }
            };
            let mut details = Vec::new();
            for version_dir in sub_dirs(&app_dir).await? {
                match read_local_version(&version_dir).await {
                    Ok(detail) => details.push(detail),
                    Err(e) => {
                        tracing::warn!(dir = %version_dir.display(), error = %e, "skip local app version")
                    }
                }
            }
            if details.is_empty() {
                tracing::warn!(app = %app.key, "local app has no usable version");
                continue;
            }
            entries.push(CatalogueEntry { app, details, tags });
        }

        let changes = self
            .services()
            .db
            .replace_catalogue(resource::LOCAL, entries)
            .await?;
        tracing::info!(
            added = changes.added,
            updated = changes.updated,
            removed = changes.removed,
            "local apps synced"
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Filter,
        error::panel_error,
        model::{AppTag, Tag},
        testing,
    };

    const APP_YML: &str = r#"name: Memos
additionalProperties:
  key: memos
  name: Memos
  tags:
    - Tool
  shortDescEn: Note taking
  type: tool
  crossVersionUpdate: true
  limit: 0
"#;

    const VERSION_YML: &str = r#"additionalProperties:
  formFields:
    - default: 5230
      envKey: PANEL_APP_PORT_HTTP
      required: true
      type: number
"#;

    async fn write_app(root: &Path, versions: &[(&str, &str)]) {
        let dir = root.join("memos");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("data.yml"), APP_YML).await.unwrap();
        tokio::fs::write(dir.join("logo.png"), [0x89, b'P', b'N', b'G']).await.unwrap();
        for (version, data) in versions {
            let vdir = dir.join(version);
            tokio::fs::create_dir_all(&vdir).await.unwrap();
            tokio::fs::write(vdir.join("docker-compose.yml"), "services:\n  memos:\n    image: memos\n")
                .await
                .unwrap();
            tokio::fs::write(vdir.join("data.yml"), data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn local_app_is_catalogued_with_local_tag() {
        let (svc, _fakes) = testing::services("local-sync").await;
        let engine = AppEngine::new(svc.clone());
        let root = svc.config.resource_apps_dir(resource::LOCAL);
        write_app(&root, &[("0.22.0", VERSION_YML), ("broken", "additionalProperties: [")]).await;

        let changes = engine.sync_local_apps().await.unwrap();
        assert_eq!(changes.added, 1);

        let app: App = svc
            .db
            .must(vec![Filter::Key("localmemos".to_string())])
            .await
            .unwrap();
        assert_eq!(app.resource, resource::LOCAL);
        assert_eq!(app.recommend, 9999);
        assert_eq!(app.icon, "iVBORw==");
        assert_eq!(
            serde_json::from_str::<Value>(&app.description).unwrap(),
            serde_json::json!({"zh": "", "en": "Note taking"})
        );
        let details: Vec<AppDetail> = svc.db.list(vec![Filter::AppId(app.id)]).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].version, "0.22.0");
        let params: Value = serde_json::from_str(&details[0].params).unwrap();
        assert_eq!(params["formFields"][0]["default"], 5230);

        let tags: Vec<AppTag> = svc.db.list(vec![Filter::AppId(app.id)]).await.unwrap();
        assert_eq!(tags.len(), 2);
        assert!(
            svc.db
                .first::<Tag>(vec![Filter::Key("Local".to_string())])
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            engine.detail_dir(&app, "0.22.0"),
            root.join("memos").join("0.22.0")
        );
    }

    #[tokio::test]
    async fn version_errors_name_the_culprit() {
        let dir = testing::temp_root("local-version");

        let err = read_local_version(&dir).await.unwrap_err();
        assert_eq!(
            panel_error(&err).unwrap().bag(),
            serde_json::json!({"name": "docker-compose.yml"})
        );

        tokio::fs::write(dir.join("docker-compose.yml"), "services: {}\n").await.unwrap();
        let spaced = "additionalProperties:\n  formFields:\n    - envKey: BAD KEY\n      default: 1\n";
        tokio::fs::write(dir.join("data.yml"), spaced).await.unwrap();
        let err = read_local_version(&dir).await.unwrap_err();
        assert!(matches!(
            panel_error(&err),
            Some(PanelError::AppParamKey { name }) if name == "BAD KEY"
        ));

        let null = "additionalProperties:\n  formFields:\n    - envKey: PORT\n      default:\n";
        tokio::fs::write(dir.join("data.yml"), null).await.unwrap();
        let err = read_local_version(&dir).await.unwrap_err();
        assert!(matches!(
            panel_error(&err),
            Some(PanelError::AppParamKey { name }) if name == "default"
        ));
    }

    #[tokio::test]
    async fn missing_logo_skips_app() {
        let (svc, _fakes) = testing::services("local-nologo").await;
        let engine = AppEngine::new(svc.clone());
        let root = svc.config.resource_apps_dir(resource::LOCAL);
        write_app(&root, &[("1.0", VERSION_YML)]).await;
        tokio::fs::remove_file(root.join("memos/logo.png")).await.unwrap();

        let changes = engine.sync_local_apps().await.unwrap();
        assert_eq!(changes, CatalogueChanges::default());
        assert!(read_local_app(&root.join("memos")).await.is_err());
    }
}
