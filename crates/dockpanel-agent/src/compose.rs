//! Compose documents as the app engine reads and rewrites them.
//!
//! Documents are handled as `serde_yaml_ng` mappings so key order survives every rewrite.
//! Interpolation only touches scalar strings after parsing; unresolved `${VAR}` placeholders are
//! left in place so callers can tell a templated value from a concrete one.

use std::{collections::HashSet, sync::LazyLock};

use anyhow::Context as _;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};

use crate::{env_file::EnvMap, error::PanelError};

pub const CPUS: &str = "CPUS";
pub const MEMORY_LIMIT: &str = "MEMORY_LIMIT";
pub const HOST_IP: &str = "HOST_IP";
pub const CONTAINER_NAME: &str = "CONTAINER_NAME";

const SKIP_STATUS_CHECK_LABEL: &str = "skipStatusCheck";

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid variable regex")
});

static MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)([A-Za-z]+)").expect("valid memory regex"));

/// Container settings shared by install requests and upgrades.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerConfig {
    pub advanced: bool,
    pub cpu_quota: f64,
    pub memory_limit: f64,
    pub memory_unit: String,
    pub allow_port: bool,
    #[serde(rename = "specifyIP")]
    pub specify_ip: String,
    pub container_name: String,
    #[serde(rename = "gpuConfig")]
    pub gpu: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeService {
    pub name: String,
    pub image: Option<String>,
    pub container_name: Option<String>,
    pub labels: Vec<(String, String)>,
}

impl ComposeService {
    fn skips_status_check(&self) -> bool {
        self.labels.iter().any(|(k, _)| k == SKIP_STATUS_CHECK_LABEL)
    }
}

#[derive(Clone, Debug)]
pub struct ComposeProject {
    pub services: Vec<ComposeService>,
}

pub fn parse_document(compose: &str) -> anyhow::Result<Mapping> {
    let value: Value = serde_yaml_ng::from_str(compose).map_err(|e| PanelError::FileParse {
        detail: format!("docker-compose.yml: {e}"),
    })?;
    match value {
        Value::Mapping(map) => Ok(map),
        _ => Err(PanelError::FileParse {
            detail: "docker-compose.yml: top level is not a mapping".to_string(),
        }
        .into()),
    }
}

pub fn to_yaml(doc: &Mapping) -> anyhow::Result<String> {
    serde_yaml_ng::to_string(doc).context("serialize compose")
}

fn services(doc: &Mapping) -> anyhow::Result<&Mapping> {
    doc.get("services")
        .and_then(Value::as_mapping)
        .ok_or_else(missing_services)
}

fn services_mut(doc: &mut Mapping) -> anyhow::Result<&mut Mapping> {
    doc.get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(missing_services)
}

fn missing_services() -> anyhow::Error {
    PanelError::FileParse {
        detail: "docker-compose.yml: missing services".to_string(),
    }
    .into()
}

pub fn service_names(doc: &Mapping) -> anyhow::Result<Vec<String>> {
    Ok(services(doc)?
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect())
}

/// First service key of a compose text, used as an install's `service_name`.
pub fn first_service_name(compose: &str) -> anyhow::Result<String> {
    let doc = parse_document(compose)?;
    service_names(&doc)?
        .into_iter()
        .next()
        .ok_or_else(missing_services)
}

/// Expands `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR` against `env`.
pub fn interpolate(input: &str, env: &EnvMap) -> String {
    VAR_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if whole == "$$" {
                return "$".to_string();
            }
            if let Some(bare) = caps.get(4) {
                return env
                    .get(bare.as_str())
                    .cloned()
                    .unwrap_or_else(|| whole.to_string());
            }
            let Some(name) = caps.get(1) else {
                return whole.to_string();
            };
            let value = env.get(name.as_str());
            match caps.get(2).map(|m| m.as_str()) {
                Some(":-") => match value {
                    Some(v) if !v.is_empty() => v.clone(),
                    _ => caps.get(3).map(|m| m.as_str()).unwrap_or_default().to_string(),
                },
                Some("-") => match value {
                    Some(v) => v.clone(),
                    None => caps.get(3).map(|m| m.as_str()).unwrap_or_default().to_string(),
                },
                _ => value.cloned().unwrap_or_else(|| whole.to_string()),
            }
        })
        .into_owned()
}

fn interpolate_value(value: &mut Value, env: &EnvMap) {
    match value {
        Value::String(s) => *s = interpolate(s, env),
        Value::Sequence(items) => items.iter_mut().for_each(|v| interpolate_value(v, env)),
        Value::Mapping(map) => map.values_mut().for_each(|v| interpolate_value(v, env)),
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env),
        _ => {}
    }
}

/// Parses and interpolates a compose document into its service list.
pub fn load_project(compose: &str, env: &EnvMap) -> anyhow::Result<ComposeProject> {
    let mut doc = parse_document(compose)?;
    if let Some(svcs) = doc.get_mut("services") {
        interpolate_value(svcs, env);
    }
    let mut out = Vec::new();
    for (key, svc) in services(&doc)? {
        let Some(name) = key.as_str() else {
            continue;
        };
        let field = |k: &str| svc.get(k).and_then(Value::as_str).map(str::to_string);
        out.push(ComposeService {
            name: name.to_string(),
            image: field("image"),
            container_name: field("container_name"),
            labels: parse_labels(svc.get("labels")),
        });
    }
    Ok(ComposeProject { services: out })
}

fn parse_labels(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let k = k.as_str()?;
                let v = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => serde_yaml_ng::to_string(other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                Some((k.to_string(), v))
            })
            .collect(),
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.to_string(), String::new()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Image references of every service, in service order, without duplicates.
pub fn get_images(compose: &str, env: &EnvMap) -> anyhow::Result<Vec<String>> {
    let project = load_project(compose, env)?;
    let mut seen = HashSet::new();
    Ok(project
        .services
        .into_iter()
        .filter_map(|s| s.image)
        .filter(|image| !image.is_empty() && seen.insert(image.clone()))
        .collect())
}

/// Container names an install is expected to run.
///
/// Services with an empty or still-templated `container_name`, and services labelled
/// `skipStatusCheck`, are left out. Order is first encounter; duplicates are dropped. When nothing
/// remains the install's stored name is returned.
pub fn container_names(project: &ComposeProject, fallback: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for svc in &project.services {
        let Some(name) = svc.container_name.as_deref() else {
            continue;
        };
        if name.is_empty() || name.contains("${") || svc.skips_status_check() {
            continue;
        }
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    if out.is_empty() && !fallback.is_empty() {
        out.push(fallback.to_string());
    }
    out
}

/// Moves an image onto a mirror: keeps the segment after the last `/` and prefixes it.
pub fn rewrite_image(image: &str, prefix: &str) -> String {
    let tail = image.rsplit_once('/').map(|(_, t)| t).unwrap_or(image);
    format!("{}/{}", prefix.trim_end_matches('/'), tail)
}

/// Applies the panel-owned parts of an app's compose file.
///
/// Every image is moved under `image_prefix` when set. The service `service_name` gets
/// `deploy.resources.limits` bound to `${CPUS}` / `${MEMORY_LIMIT}`, an nvidia reservation when
/// `cfg.gpu`, and `H:C` ports bound to `${HOST_IP}`. The matching env values are written to `env`.
pub fn mutate_for_install(
    doc: &mut Mapping,
    service_name: &str,
    cfg: &ContainerConfig,
    image_prefix: Option<&str>,
    env: &mut EnvMap,
) -> anyhow::Result<()> {
    let services = services_mut(doc)?;

    if let Some(prefix) = image_prefix.filter(|p| !p.is_empty()) {
        for svc in services.values_mut() {
            if let Some(image) = svc.get_mut("image")
                && let Some(current) = image.as_str()
            {
                *image = Value::String(rewrite_image(current, prefix));
            }
        }
    }

    let service = services
        .get_mut(service_name)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| PanelError::FileParse {
            detail: format!("docker-compose.yml: service {service_name} not found"),
        })?;

    let deploy = mapping_entry(service, "deploy")?;
    let resources = mapping_entry(deploy, "resources")?;
    let mut limits = Mapping::new();
    limits.insert("cpus".into(), "${CPUS}".into());
    limits.insert("memory".into(), "${MEMORY_LIMIT}".into());
    resources.insert("limits".into(), Value::Mapping(limits));
    if cfg.gpu {
        let mut device = Mapping::new();
        device.insert("driver".into(), "nvidia".into());
        device.insert("count".into(), "all".into());
        device.insert(
            "capabilities".into(),
            Value::Sequence(vec![Value::String("gpu".to_string())]),
        );
        let mut reservations = Mapping::new();
        reservations.insert(
            "devices".into(),
            Value::Sequence(vec![Value::Mapping(device)]),
        );
        resources.insert("reservations".into(), Value::Mapping(reservations));
    }

    let mut has_ports = false;
    if let Some(Value::Sequence(ports)) = service.get_mut("ports") {
        has_ports = true;
        for port in ports.iter_mut() {
            let Some(text) = port.as_str() else {
                continue;
            };
            let parts = text.split(':').collect::<Vec<_>>();
            if parts.len() == 2 {
                *port = Value::String(format!("${{{HOST_IP}}}:{text}"));
            }
        }
    }

    env.insert(CPUS.to_string(), "0".to_string());
    env.insert(MEMORY_LIMIT.to_string(), "0".to_string());
    if cfg.advanced {
        if cfg.cpu_quota > 0.0 {
            env.insert(CPUS.to_string(), format_float(cfg.cpu_quota));
        }
        if cfg.memory_limit > 0.0 {
            env.insert(
                MEMORY_LIMIT.to_string(),
                format!("{}{}", format_float(cfg.memory_limit), cfg.memory_unit),
            );
        }
    }
    if has_ports {
        let host = if cfg.advanced && cfg.allow_port && !cfg.specify_ip.is_empty() {
            cfg.specify_ip.clone()
        } else if cfg.advanced && cfg.allow_port {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        };
        env.insert(HOST_IP.to_string(), host);
    }
    Ok(())
}

fn mapping_entry<'a>(map: &'a mut Mapping, key: &str) -> anyhow::Result<&'a mut Mapping> {
    if !matches!(map.get(key), Some(Value::Mapping(_))) {
        map.insert(key.into(), Value::Mapping(Mapping::new()));
    }
    map.get_mut(key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| anyhow::anyhow!("compose key {key} is not a mapping"))
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Reads back the container settings an install was created with.
pub fn app_common_config(env: &EnvMap) -> ContainerConfig {
    let mut cfg = ContainerConfig::default();
    match env.get(HOST_IP) {
        Some(ip) => {
            cfg.allow_port = ip != "127.0.0.1";
            cfg.specify_ip = ip.clone();
        }
        None => cfg.allow_port = true,
    }
    cfg.cpu_quota = env
        .get(CPUS)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    cfg.memory_unit = "M".to_string();
    if let Some(mem) = env.get(MEMORY_LIMIT)
        && let Some(caps) = MEMORY_RE.captures(mem)
        && let Ok(num) = caps[1].parse::<f64>()
    {
        cfg.memory_limit = num;
        cfg.memory_unit = caps[2].to_string();
    }
    if let Some(name) = env.get(CONTAINER_NAME) {
        cfg.container_name = name.clone();
    }
    cfg
}

/// Builds the compose text for upgrading an install onto a new template.
///
/// The new template must keep the installed service count. A single service is renamed to
/// `service_name`, the installed `deploy` block is carried over and the install's container
/// settings are re-applied. Returns the new compose text; `env` is updated in place.
pub fn mutate_for_upgrade(
    installed_compose: &str,
    template_compose: &str,
    service_name: &str,
    install_container_name: &str,
    image_prefix: Option<&str>,
    env: &mut EnvMap,
) -> anyhow::Result<String> {
    let old_doc = parse_document(installed_compose)?;
    let mut doc = parse_document(template_compose)?;

    let old_services = services(&old_doc)?;
    let new_count = services(&doc)?.len();
    if old_services.len() != new_count {
        return Err(PanelError::ServiceCountChanged {
            old: old_services.len(),
            new: new_count,
        }
        .into());
    }

    let services = services_mut(&mut doc)?;
    if services.len() == 1 {
        let renamed = services
            .iter()
            .map(|(_, v)| (Value::String(service_name.to_string()), v.clone()))
            .collect::<Mapping>();
        *services = renamed;
    }

    let old_deploy = old_services
        .get(service_name)
        .and_then(|svc| svc.get("deploy"))
        .filter(|d| !d.is_null())
        .cloned();
    let service = services
        .get_mut(service_name)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| PanelError::FileParse {
            detail: format!("docker-compose.yml: service {service_name} not found"),
        })?;
    if let Some(deploy) = old_deploy {
        service.insert("deploy".into(), deploy);
    }

    let mut cfg = app_common_config(env);
    if cfg.container_name.is_empty() {
        cfg.container_name = install_container_name.to_string();
        env.insert(
            CONTAINER_NAME.to_string(),
            install_container_name.to_string(),
        );
    }
    cfg.advanced = true;
    mutate_for_install(&mut doc, service_name, &cfg, image_prefix, env)?;
    to_yaml(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const MYSQL: &str = r#"
services:
  mysql:
    image: mysql:${VERSION:-8.0.35}
    container_name: ${CONTAINER_NAME}
    ports:
      - "${PANEL_APP_PORT_HTTP}:3306"
      - "127.0.0.1:9104:9104"
    labels:
      createdBy: "Apps"
"#;

    #[test]
    fn interpolation_rules() {
        let e = env(&[("A", "1"), ("EMPTY", "")]);
        assert_eq!(interpolate("${A}-${B}", &e), "1-${B}");
        assert_eq!(interpolate("${EMPTY:-x}|${EMPTY-x}|${B-y}", &e), "x||y");
        assert_eq!(interpolate("$A $$A", &e), "1 $A");
    }

    #[test]
    fn install_mutation_binds_ports_and_limits() {
        let mut doc = parse_document(MYSQL).unwrap();
        let mut e = EnvMap::new();
        let cfg = ContainerConfig {
            advanced: true,
            cpu_quota: 1.5,
            memory_limit: 512.0,
            memory_unit: "M".to_string(),
            gpu: true,
            ..Default::default()
        };
        mutate_for_install(&mut doc, "mysql", &cfg, Some("mirror.local/lib"), &mut e).unwrap();

        let svc = &doc["services"]["mysql"];
        assert_eq!(svc["image"].as_str(), Some("mirror.local/lib/mysql:${VERSION:-8.0.35}"));
        assert_eq!(svc["deploy"]["resources"]["limits"]["cpus"].as_str(), Some("${CPUS}"));
        assert_eq!(
            svc["deploy"]["resources"]["reservations"]["devices"][0]["driver"].as_str(),
            Some("nvidia")
        );
        let ports = svc["ports"].as_sequence().unwrap();
        assert_eq!(ports[0].as_str(), Some("${HOST_IP}:${PANEL_APP_PORT_HTTP}:3306"));
        assert_eq!(ports[1].as_str(), Some("127.0.0.1:9104:9104"));
        assert_eq!(e[CPUS], "1.5");
        assert_eq!(e[MEMORY_LIMIT], "512M");
        assert_eq!(e[HOST_IP], "127.0.0.1");
    }

    #[test]
    fn install_mutation_rejects_unknown_service() {
        let mut doc = parse_document(MYSQL).unwrap();
        let err = mutate_for_install(
            &mut doc,
            "db",
            &ContainerConfig::default(),
            None,
            &mut EnvMap::new(),
        )
        .unwrap_err();
        assert!(matches!(
            crate::error::panel_error(&err),
            Some(PanelError::FileParse { .. })
        ));
    }

    #[test]
    fn allow_port_uses_specified_ip() {
        let mut doc = parse_document(MYSQL).unwrap();
        let mut e = EnvMap::new();
        let cfg = ContainerConfig {
            advanced: true,
            allow_port: true,
            specify_ip: "10.0.0.5".to_string(),
            ..Default::default()
        };
        mutate_for_install(&mut doc, "mysql", &cfg, None, &mut e).unwrap();
        assert_eq!(e[HOST_IP], "10.0.0.5");
        let back = app_common_config(&e);
        assert!(back.allow_port);
        assert_eq!(back.specify_ip, "10.0.0.5");
    }

    #[test]
    fn container_names_skip_placeholders_and_labels() {
        let compose = r#"
services:
  web:
    image: nginx
    container_name: ${CONTAINER_NAME}
  worker:
    image: worker
    container_name: dp-app-worker
  sidecar:
    image: busybox
    container_name: dp-app-sidecar
    labels:
      - skipStatusCheck=true
  again:
    image: worker
    container_name: dp-app-worker
"#;
        let project = load_project(compose, &EnvMap::new()).unwrap();
        assert_eq!(container_names(&project, "fallback"), vec!["dp-app-worker"]);

        let project = load_project(compose, &env(&[("CONTAINER_NAME", "dp-app-web")])).unwrap();
        assert_eq!(
            container_names(&project, "fallback"),
            vec!["dp-app-web", "dp-app-worker"]
        );

        let empty = ComposeProject { services: vec![] };
        assert_eq!(container_names(&empty, "dp-x"), vec!["dp-x"]);
    }

    #[test]
    fn images_are_interpolated_in_order() {
        let images = get_images(MYSQL, &env(&[("VERSION", "8.4.0")])).unwrap();
        assert_eq!(images, vec!["mysql:8.4.0"]);
        let images = get_images(MYSQL, &EnvMap::new()).unwrap();
        assert_eq!(images, vec!["mysql:8.0.35"]);
    }

    #[test]
    fn upgrade_renames_single_service_and_keeps_deploy() {
        let installed = r#"
services:
  mysql-1:
    image: mysql:5.7
    container_name: ${CONTAINER_NAME}
    deploy:
      resources:
        limits:
          cpus: ${CPUS}
          memory: ${MEMORY_LIMIT}
"#;
        let template = r#"
services:
  mysql:
    image: mysql:8.0
    container_name: ${CONTAINER_NAME}
    ports:
      - "${PANEL_APP_PORT_HTTP}:3306"
"#;
        let mut e = env(&[("CPUS", "2"), ("MEMORY_LIMIT", "1G"), ("HOST_IP", "127.0.0.1")]);
        let out =
            mutate_for_upgrade(installed, template, "mysql-1", "dp-mysql-abcd", None, &mut e)
                .unwrap();
        let doc = parse_document(&out).unwrap();
        assert_eq!(service_names(&doc).unwrap(), vec!["mysql-1"]);
        let svc = &doc["services"]["mysql-1"];
        assert_eq!(svc["image"].as_str(), Some("mysql:8.0"));
        assert_eq!(svc["ports"][0].as_str(), Some("${HOST_IP}:${PANEL_APP_PORT_HTTP}:3306"));
        assert_eq!(e[CONTAINER_NAME], "dp-mysql-abcd");
        assert_eq!(e[CPUS], "2");
        assert_eq!(e[MEMORY_LIMIT], "1G");
    }

    #[test]
    fn upgrade_rejects_service_count_change() {
        let installed = "services:\n  app:\n    image: a\n";
        let template = "services:\n  app:\n    image: a\n  db:\n    image: b\n";
        let err = mutate_for_upgrade(installed, template, "app", "c", None, &mut EnvMap::new())
            .unwrap_err();
        assert!(matches!(
            crate::error::panel_error(&err),
            Some(PanelError::ServiceCountChanged { old: 1, new: 2 })
        ));
    }

    #[test]
    fn common_config_defaults() {
        let cfg = app_common_config(&EnvMap::new());
        assert!(cfg.allow_port);
        assert_eq!(cfg.memory_unit, "M");
        assert_eq!(cfg.cpu_quota, 0.0);
    }
}
