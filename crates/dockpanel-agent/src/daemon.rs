//! Single writer for the container engine's `daemon.json`.
//!
//! Every change goes through [`DaemonJsonActor::apply`], which holds a mutex across the whole
//! read-modify-write-validate-restart cycle.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::runner::{CommandRunner, CommandSpec};

const CMD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "key")]
pub enum DaemonChange {
    Registries {
        value: String,
    },
    Mirrors {
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Ipv6 {
        /// `enable` or `disable`.
        value: String,
        #[serde(default)]
        fixed_cidr_v6: String,
        #[serde(default)]
        ip6tables: bool,
        #[serde(default)]
        experimental: bool,
    },
    #[serde(rename_all = "camelCase")]
    LogOption {
        #[serde(default)]
        value: String,
        #[serde(default)]
        log_max_file: String,
        #[serde(default)]
        log_max_size: String,
    },
    LiveRestore {
        value: String,
    },
    #[serde(rename = "IPtables")]
    IpTables {
        value: String,
    },
    Driver {
        value: String,
    },
    #[serde(rename = "http-proxy")]
    HttpProxy {
        value: String,
    },
    #[serde(rename = "https-proxy")]
    HttpsProxy {
        value: String,
    },
    #[serde(rename = "socks5-proxy")]
    Socks5Proxy {
        value: String,
    },
    #[serde(rename = "close-proxy")]
    CloseProxy {
        #[serde(default)]
        value: String,
    },
    /// Whole-file replacement.
    File {
        file: String,
    },
}

impl DaemonChange {
    fn reason(&self) -> &'static str {
        match self {
            Self::Registries { .. } => "Registries",
            Self::Mirrors { .. } => "Mirrors",
            Self::Ipv6 { .. } => "Ipv6",
            Self::LogOption { .. } => "LogOption",
            Self::LiveRestore { .. } => "LiveRestore",
            Self::IpTables { .. } => "IPtables",
            Self::Driver { .. } => "Driver",
            Self::HttpProxy { .. } => "http-proxy",
            Self::HttpsProxy { .. } => "https-proxy",
            Self::Socks5Proxy { .. } => "socks5-proxy",
            Self::CloseProxy { .. } => "close-proxy",
            Self::File { .. } => "File",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupMeta<'a> {
    created_at: String,
    reason: &'a str,
}

pub struct DaemonJsonActor {
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
    poll_tick: Duration,
    poll_deadline: Duration,
}

impl DaemonJsonActor {
    pub fn new(path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.into(),
            runner,
            lock: Mutex::new(()),
            poll_tick: Duration::from_secs(3),
            poll_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_poll(mut self, tick: Duration, deadline: Duration) -> Self {
        self.poll_tick = tick;
        self.poll_deadline = deadline;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change`; returns `false` when the file already had the requested content.
    pub async fn apply(&self, change: DaemonChange) -> anyhow::Result<bool> {
        let _held = self.lock.lock().await;

        self.create_if_missing().await?;
        let current = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))?;

        let next = match &change {
            DaemonChange::File { file } => file.clone(),
            other => {
                let mut map: Map<String, Value> = serde_json::from_str(&current).unwrap_or_default();
                mutate(&mut map, other);
                to_tab_json(&Value::Object(map))?
            }
        };
        if next == current {
            return Ok(false);
        }

        self.backup(&current, change.reason()).await?;
        tokio::fs::write(&self.path, &next)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), reason = change.reason(), "daemon.json updated");

        self.validate().await?;
        self.restart().await?;
        self.wait_active().await?;
        Ok(true)
    }

    /// Current content as a JSON map; a missing or empty file reads as `{}`.
    pub async fn load(&self) -> anyhow::Result<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if !text.trim().is_empty() => {
                serde_json::from_str(&text).context("parse daemon.json")
            }
            Ok(_) => Ok(Map::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e).context("read daemon.json"),
        }
    }

    async fn create_if_missing(&self) -> anyhow::Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, "").await?;
        Ok(())
    }

    async fn backup(&self, content: &str, reason: &str) -> anyhow::Result<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        let dir = parent.join("backups");
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = time::OffsetDateTime::now_utc().unix_timestamp();
        let file = dir.join(format!("daemon.json_backup_{stamp}.backup"));
        tokio::fs::write(&file, content)
            .await
            .with_context(|| format!("write {}", file.display()))?;
        let meta = BackupMeta {
            created_at: crate::ids::now_rfc3339()?,
            reason,
        };
        let meta_path = dir.join(format!("daemon.json_backup_{stamp}.meta"));
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;
        Ok(())
    }

    async fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<crate::runner::CommandOutput> {
        self.runner
            .run(CommandSpec::new(program, args.iter().copied()), CMD_TIMEOUT)
            .await
    }

    async fn validate(&self) -> anyhow::Result<()> {
        let which = self.run("which", &["dockerd"]).await?;
        if !which.success() {
            return Ok(());
        }
        let out = self.run("dockerd", &["--validate"]).await?;
        let text = out.combined();
        if text.contains("unknown flag: --validate") {
            return Ok(());
        }
        let trimmed = text.trim();
        if !out.success() || (!trimmed.is_empty() && trimmed != "configuration OK") {
            return Err(anyhow::anyhow!(
                "docker configuration validation failed: {trimmed}"
            ));
        }
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        let which = self.run("which", &["docker"]).await?;
        let manager = if which.stdout.contains("snap") {
            "snap"
        } else {
            "systemctl"
        };
        tracing::info!(manager, "restart docker");
        let out = self.run(manager, &["restart", "docker"]).await?;
        if !out.success() {
            return Err(anyhow::anyhow!("failed to restart docker: {}", out.combined()));
        }
        Ok(())
    }

    async fn wait_active(&self) -> anyhow::Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            let out = self.run("systemctl", &["is-active", "docker"]).await?;
            if out.stdout.trim() == "active" {
                return Ok(());
            }
            if started.elapsed() >= self.poll_deadline {
                return Err(anyhow::anyhow!("docker did not become active after restart"));
            }
            tokio::time::sleep(self.poll_tick).await;
        }
    }
}

pub(crate) fn to_tab_json(value: &Value) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf)?)
}

fn split_list(value: &str) -> Vec<Value> {
    value
        .trim_end_matches(',')
        .split(',')
        .map(|s| Value::String(s.to_string()))
        .collect()
}

fn mutate(map: &mut Map<String, Value>, change: &DaemonChange) {
    match change {
        DaemonChange::Registries { value } => {
            if value.trim_end_matches(',').is_empty() {
                map.remove("insecure-registries");
            } else {
                map.insert("insecure-registries".into(), Value::Array(split_list(value)));
            }
        }
        DaemonChange::Mirrors { value } => {
            if value.trim_end_matches(',').is_empty() {
                map.remove("registry-mirrors");
            } else {
                map.insert("registry-mirrors".into(), Value::Array(split_list(value)));
            }
        }
        DaemonChange::Ipv6 {
            value,
            fixed_cidr_v6,
            ip6tables,
            experimental,
        } => {
            if value == "disable" {
                for key in ["ipv6", "fixed-cidr-v6", "ip6tables", "experimental"] {
                    map.remove(key);
                }
            } else {
                map.insert("ipv6".into(), Value::Bool(true));
                map.insert("fixed-cidr-v6".into(), Value::String(fixed_cidr_v6.clone()));
                if *ip6tables {
                    map.insert("ip6tables".into(), Value::Bool(true));
                }
                if *experimental {
                    map.insert("experimental".into(), Value::Bool(true));
                }
            }
        }
        DaemonChange::LogOption {
            value,
            log_max_file,
            log_max_size,
        } => {
            if value == "disable" {
                map.remove("log-opts");
            } else {
                change_log_option(map, log_max_file, log_max_size);
            }
        }
        DaemonChange::LiveRestore { value } => {
            if value == "disable" {
                map.remove("live-restore");
            } else {
                map.insert("live-restore".into(), Value::Bool(true));
            }
        }
        DaemonChange::IpTables { value } => {
            if value == "enable" {
                map.remove("iptables");
            } else {
                map.insert("iptables".into(), Value::Bool(false));
            }
        }
        DaemonChange::Driver { value } => {
            let driver = format!("native.cgroupdriver={value}");
            match map.get_mut("exec-opts") {
                Some(Value::Array(opts)) => {
                    if let Some(slot) = opts.iter_mut().find(|o| {
                        o.as_str()
                            .is_some_and(|s| s.starts_with("native.cgroupdriver="))
                    }) {
                        *slot = Value::String(driver);
                    }
                }
                Some(_) => {}
                None => {
                    if value == "systemd" {
                        map.insert("exec-opts".into(), json!([driver]));
                    }
                }
            }
        }
        DaemonChange::HttpProxy { value } | DaemonChange::HttpsProxy { value } => {
            map.remove("proxies");
            if !value.is_empty() {
                let key = if matches!(change, DaemonChange::HttpProxy { .. }) {
                    "http-proxy"
                } else {
                    "https-proxy"
                };
                map.insert("proxies".into(), json!({ key: value }));
            }
        }
        DaemonChange::Socks5Proxy { value } | DaemonChange::CloseProxy { value } => {
            map.remove("proxies");
            if !value.is_empty() {
                map.insert(
                    "proxies".into(),
                    json!({ "http-proxy": value, "https-proxy": value }),
                );
            }
        }
        DaemonChange::File { .. } => {}
    }
}

fn change_log_option(map: &mut Map<String, Value>, max_file: &str, max_size: &str) {
    if !max_file.is_empty() || !max_size.is_empty() {
        map.insert("log-driver".into(), Value::String("json-file".to_string()));
    }
    let mut opts = match map.remove("log-opts") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    for (key, value) in [("max-file", max_file), ("max-size", max_size)] {
        if value.is_empty() {
            opts.remove(key);
        } else {
            opts.insert(key.into(), Value::String(value.to_string()));
        }
    }
    if !opts.is_empty() {
        map.insert("log-opts".into(), Value::Object(opts));
    }
}
