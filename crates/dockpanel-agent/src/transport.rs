//! Backup transports: where snapshot and app backup archives are shipped.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;

use crate::{
    db::{Db, Filter},
    error::PanelError,
    model::BackupAccount,
};

pub const LOCAL: &str = "LOCAL";
pub const WEBDAV: &str = "WebDAV";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[async_trait]
pub trait BackupTransport: Send + Sync {
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<bool>;
    async fn delete(&self, remote: &str) -> anyhow::Result<bool>;
    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()>;
    async fn exist(&self, remote: &str) -> anyhow::Result<bool>;
    async fn size(&self, remote: &str) -> anyhow::Result<i64>;
}

/// A resolved backup account ready to use.
#[derive(Clone)]
pub struct BackupClient {
    pub id: i64,
    pub name: String,
    pub backup_path: String,
    pub client: Arc<dyn BackupTransport>,
}

impl BackupClient {
    /// `<backup_path>/<parts...>` with single separators.
    pub fn remote_path(&self, parts: &[&str]) -> String {
        let mut out = self.backup_path.trim_end_matches('/').to_string();
        for part in parts {
            let part = part.trim_matches('/');
            if part.is_empty() {
                continue;
            }
            out.push('/');
            out.push_str(part);
        }
        out
    }
}

/// Copies into a directory on this host. Absolute remote paths are used as is.
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote)
    }
}

#[async_trait]
impl BackupTransport for LocalTransport {
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<bool> {
        let target = self.resolve(remote);
        if target == local {
            return Ok(true);
        }
        crate::archive::copy_file(local, &target).await?;
        Ok(true)
    }

    async fn delete(&self, remote: &str) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.resolve(remote)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete {remote}")),
        }
    }

    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()> {
        crate::archive::copy_file(&self.resolve(remote), local).await
    }

    async fn exist(&self, remote: &str) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(remote)).await?)
    }

    async fn size(&self, remote: &str) -> anyhow::Result<i64> {
        let meta = tokio::fs::metadata(self.resolve(remote))
            .await
            .with_context(|| format!("stat {remote}"))?;
        Ok(meta.len() as i64)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WebDavVars {
    address: String,
    port: Option<u16>,
}

/// WebDAV over `reqwest` with basic auth. Parent collections are created with `MKCOL`.
pub struct WebDavTransport {
    http: reqwest::Client,
    base: url::Url,
    username: String,
    password: String,
}

impl WebDavTransport {
    pub fn new(
        http: reqwest::Client,
        address: &str,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Self> {
        let mut base = url::Url::parse(address).context("parse webdav address")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http,
            base,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, remote: &str) -> anyhow::Result<url::Url> {
        self.base
            .join(remote.trim_start_matches('/'))
            .with_context(|| format!("join webdav path {remote}"))
    }

    fn request(&self, method: Method, url: url::Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url).timeout(HTTP_TIMEOUT);
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn mkcol_parents(&self, remote: &str) -> anyhow::Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL").context("mkcol method")?;
        let segments = remote
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let mut path = String::new();
        for seg in segments.iter().take(segments.len().saturating_sub(1)) {
            path.push_str(seg);
            path.push('/');
            let resp = self
                .request(mkcol.clone(), self.url(&path)?)
                .send()
                .await
                .with_context(|| format!("mkcol {path}"))?;
            let status = resp.status();
            if !(status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED) {
                return Err(anyhow::anyhow!("mkcol {path}: {status}"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackupTransport for WebDavTransport {
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<bool> {
        self.mkcol_parents(remote).await?;
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("open {}", local.display()))?;
        let resp = self
            .request(Method::PUT, self.url(remote)?)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .with_context(|| format!("put {remote}"))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("put {remote}: {}", resp.status()));
        }
        Ok(true)
    }

    async fn delete(&self, remote: &str) -> anyhow::Result<bool> {
        let resp = self
            .request(Method::DELETE, self.url(remote)?)
            .send()
            .await
            .with_context(|| format!("delete {remote}"))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(anyhow::anyhow!("delete {remote}: {s}")),
        }
    }

    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()> {
        let mut resp = self
            .request(Method::GET, self.url(remote)?)
            .send()
            .await
            .with_context(|| format!("get {remote}"))?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("get {remote}: {}", resp.status()));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(local)
            .await
            .with_context(|| format!("create {}", local.display()))?;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn exist(&self, remote: &str) -> anyhow::Result<bool> {
        let resp = self.request(Method::HEAD, self.url(remote)?).send().await?;
        Ok(resp.status().is_success())
    }

    async fn size(&self, remote: &str) -> anyhow::Result<i64> {
        let resp = self.request(Method::HEAD, self.url(remote)?).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("head {remote}: {}", resp.status()));
        }
        Ok(resp.content_length().unwrap_or(0) as i64)
    }
}

/// Builds transports from stored backup accounts.
#[derive(Clone)]
pub struct TransportRegistry {
    db: Db,
    http: reqwest::Client,
}

impl TransportRegistry {
    pub fn new(db: Db, http: reqwest::Client) -> Self {
        Self { db, http }
    }

    pub fn build(&self, account: &BackupAccount) -> anyhow::Result<Arc<dyn BackupTransport>> {
        match account.kind.as_str() {
            k if k.eq_ignore_ascii_case(LOCAL) => Ok(Arc::new(LocalTransport::new("/"))),
            k if k.eq_ignore_ascii_case(WEBDAV) => {
                let vars: WebDavVars = if account.vars.trim().is_empty() {
                    WebDavVars::default()
                } else {
                    serde_json::from_str(&account.vars).context("parse webdav vars")?
                };
                let mut address = vars.address;
                if let Some(port) = vars.port
                    && let Ok(mut url) = url::Url::parse(&address)
                    && url.port().is_none()
                    && url.set_port(Some(port)).is_ok()
                {
                    address = url.to_string();
                }
                Ok(Arc::new(WebDavTransport::new(
                    self.http.clone(),
                    &address,
                    &account.access_key,
                    &account.credential,
                )?))
            }
            other => Err(anyhow::anyhow!("unsupported backup account type {other}")),
        }
    }

    /// Resolves account ids in the given order; an unknown id fails the whole lookup.
    pub async fn new_backup_client_map(&self, ids: &[String]) -> anyhow::Result<Vec<BackupClient>> {
        let mut out = Vec::with_capacity(ids.len());
        for raw in ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let id = raw
                .parse::<i64>()
                .map_err(|_| PanelError::RecordNotFound)?;
            let account: BackupAccount = self
                .db
                .first(vec![Filter::Id(id)])
                .await?
                .ok_or(PanelError::RecordNotFound)?;
            out.push(BackupClient {
                id,
                name: account.name.clone(),
                backup_path: account.backup_path.clone(),
                client: self.build(&account)?,
            });
        }
        Ok(out)
    }
}

/// Splits a stored `1,2,3` account list.
pub fn split_ids(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dockpanel-{tag}-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn local_transport_round_trip() {
        let root = temp_root("transport");
        let src = root.join("snap.tar.gz");
        std::fs::write(&src, b"archive").unwrap();

        let t = LocalTransport::new(root.join("remote"));
        assert!(t.upload(&src, "system_snapshot/snap.tar.gz").await.unwrap());
        assert!(t.exist("system_snapshot/snap.tar.gz").await.unwrap());
        assert_eq!(t.size("system_snapshot/snap.tar.gz").await.unwrap(), 7);

        let back = root.join("back.tar.gz");
        t.download("system_snapshot/snap.tar.gz", &back).await.unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"archive");

        assert!(t.delete("system_snapshot/snap.tar.gz").await.unwrap());
        assert!(!t.delete("system_snapshot/snap.tar.gz").await.unwrap());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn webdav_urls_keep_base_path() {
        let t = WebDavTransport::new(reqwest::Client::new(), "https://dav.example.com/remote.php/dav", "u", "p")
            .unwrap();
        assert_eq!(
            t.url("/backup/system_snapshot/a.tar.gz").unwrap().as_str(),
            "https://dav.example.com/remote.php/dav/backup/system_snapshot/a.tar.gz"
        );
    }

    #[test]
    fn remote_path_joins_segments() {
        let client = BackupClient {
            id: 1,
            name: "local".to_string(),
            backup_path: "/opt/backup/".to_string(),
            client: Arc::new(LocalTransport::new("/")),
        };
        assert_eq!(
            client.remote_path(&["system_snapshot", "a.tar.gz"]),
            "/opt/backup/system_snapshot/a.tar.gz"
        );
    }

    #[tokio::test]
    async fn unknown_account_id_fails_lookup() {
        let db = Db::open(Path::new(":memory:")).await.unwrap();
        let local = db
            .create(BackupAccount {
                name: "localhost".to_string(),
                kind: LOCAL.to_string(),
                backup_path: "/opt/backup".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let registry = TransportRegistry::new(db, reqwest::Client::new());

        let clients = registry
            .new_backup_client_map(&split_ids(&format!("{}", local.id)))
            .await
            .unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "localhost");

        let err = registry
            .new_backup_client_map(&split_ids(&format!("{},99", local.id)))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            crate::error::panel_error(&err),
            Some(PanelError::RecordNotFound)
        ));
    }
}
