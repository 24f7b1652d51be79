use std::{path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub http_addr: String,
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub db_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub systemd_dir: PathBuf,
    pub openresty_dir: Option<PathBuf>,
    pub compose_bin: String,
    pub docker_bin: String,
    pub image_prefix: Option<String>,
    pub daemon_json_path: PathBuf,
    pub version: String,
    pub arch: String,
    pub snapshot_step_timeout: Duration,
    pub snapshot_retry: u32,
    pub sync_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let http_addr =
            std::env::var("DOCKPANEL_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:9999".to_string());

        let base_dir = env_path("DOCKPANEL_BASE_DIR").unwrap_or_else(|| PathBuf::from("/opt"));
        let data_dir = env_path("DOCKPANEL_DATA_DIR").unwrap_or_else(|| base_dir.join("dockpanel"));
        let resource_dir =
            env_path("DOCKPANEL_RESOURCE_DIR").unwrap_or_else(|| data_dir.join("resource"));
        let backup_dir = env_path("DOCKPANEL_BACKUP_DIR").unwrap_or_else(|| data_dir.join("backup"));
        let tmp_dir = env_path("DOCKPANEL_TMP_DIR").unwrap_or_else(|| data_dir.join("tmp"));
        let db_dir = env_path("DOCKPANEL_DB_DIR").unwrap_or_else(|| data_dir.join("db"));
        let bin_dir = env_path("DOCKPANEL_BIN_DIR").unwrap_or_else(|| PathBuf::from("/usr/local/bin"));
        let systemd_dir =
            env_path("DOCKPANEL_SYSTEMD_DIR").unwrap_or_else(|| PathBuf::from("/etc/systemd/system"));
        let openresty_dir = env_path("DOCKPANEL_OPENRESTY_DIR");

        let compose_bin =
            std::env::var("DOCKPANEL_COMPOSE_BIN").unwrap_or_else(|_| "docker".to_string());
        let docker_bin =
            std::env::var("DOCKPANEL_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        let image_prefix = std::env::var("DOCKPANEL_IMAGE_PREFIX")
            .ok()
            .and_then(non_empty)
            .map(|v| v.trim_end_matches('/').to_string());

        let daemon_json_path =
            env_path("DOCKPANEL_DAEMON_JSON").unwrap_or_else(default_daemon_json_path);

        let version = match std::env::var("DOCKPANEL_VERSION") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => format!("v{}", env!("CARGO_PKG_VERSION")),
        };
        let arch = match std::env::var("DOCKPANEL_ARCH") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => normalize_arch(std::env::consts::ARCH),
        };

        let snapshot_step_timeout = std::env::var("DOCKPANEL_SNAPSHOT_STEP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30 * 60));

        let snapshot_retry = std::env::var("DOCKPANEL_SNAPSHOT_RETRY")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(3);

        let sync_interval_seconds = std::env::var("DOCKPANEL_SYNC_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(60);
        if sync_interval_seconds < 10 {
            return Err(anyhow::anyhow!(
                "DOCKPANEL_SYNC_INTERVAL_SECONDS must be >= 10"
            ));
        }

        Ok(Self {
            http_addr,
            base_dir,
            data_dir,
            resource_dir,
            backup_dir,
            tmp_dir,
            db_dir,
            bin_dir,
            systemd_dir,
            openresty_dir,
            compose_bin,
            docker_bin,
            image_prefix,
            daemon_json_path,
            version,
            arch,
            snapshot_step_timeout,
            snapshot_retry,
            sync_interval_seconds,
        })
    }

    /// Layout rooted at `data_dir`, used by tests and by callers that relocate the panel.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            http_addr: "127.0.0.1:0".to_string(),
            base_dir: data_dir.join("base"),
            resource_dir: data_dir.join("resource"),
            backup_dir: data_dir.join("backup"),
            tmp_dir: data_dir.join("tmp"),
            db_dir: data_dir.join("db"),
            bin_dir: data_dir.join("bin"),
            systemd_dir: data_dir.join("systemd"),
            openresty_dir: None,
            compose_bin: "docker".to_string(),
            docker_bin: "docker".to_string(),
            image_prefix: None,
            daemon_json_path: data_dir.join("docker").join("daemon.json"),
            version: "v2.0.0".to_string(),
            arch: "amd64".to_string(),
            snapshot_step_timeout: Duration::from_secs(60),
            snapshot_retry: 0,
            sync_interval_seconds: 60,
            data_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join("agent.db")
    }

    pub fn app_install_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }

    pub fn local_app_install_dir(&self) -> PathBuf {
        self.app_install_dir().join("local")
    }

    pub fn resource_apps_dir(&self, resource: &str) -> PathBuf {
        self.resource_dir.join("apps").join(resource)
    }

    pub fn app_backup_dir(&self, app_key: &str, install_name: &str) -> PathBuf {
        self.backup_dir.join("app").join(app_key).join(install_name)
    }

    pub fn uploads_dir(&self, app_key: &str, install_name: &str) -> PathBuf {
        self.base_dir
            .join("dockpanel/uploads/app")
            .join(app_key)
            .join(install_name)
    }

    pub fn snapshot_root_dir(&self) -> PathBuf {
        self.tmp_dir.join("system")
    }

    pub fn snapshot_staging_dir(&self, name: &str) -> PathBuf {
        self.snapshot_root_dir().join(name)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().and_then(non_empty).map(PathBuf::from)
}

fn non_empty(v: String) -> Option<String> {
    if v.trim().is_empty() { None } else { Some(v) }
}

pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn default_daemon_json_path() -> PathBuf {
    match std::env::consts::OS {
        "windows" => PathBuf::from(r"C:\ProgramData\docker\config\daemon.json"),
        "macos" => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".docker").join("daemon.json"))
            .unwrap_or_else(|_| PathBuf::from("/etc/docker/daemon.json")),
        _ => PathBuf::from("/etc/docker/daemon.json"),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "arm" => "armv7".to_string(),
        "powerpc64" => "ppc64le".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_forms() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn rooted_layout_derives_paths() {
        let cfg = Config::rooted_at("/srv/panel");
        assert_eq!(cfg.db_path(), PathBuf::from("/srv/panel/db/agent.db"));
        assert_eq!(
            cfg.app_backup_dir("mysql", "mysql-1"),
            PathBuf::from("/srv/panel/backup/app/mysql/mysql-1")
        );
        assert_eq!(
            cfg.snapshot_staging_dir("snap"),
            PathBuf::from("/srv/panel/tmp/system/snap")
        );
    }

    #[test]
    fn arch_is_normalized() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("s390x"), "s390x");
    }
}
