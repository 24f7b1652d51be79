use serde_json::{Map, Value};

use super::AppEngine;
use crate::{
    db::Filter,
    error::PanelError,
    model::{AppInstall, Runtime, WebsiteDomain},
};

/// Reads a port param: a number (floats round up) or a numeric string. Anything else is `0`.
pub(crate) fn port_param(key: &str, params: &Map<String, Value>) -> i64 {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_f64().map(|f| f.ceil() as i64).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f.ceil() as i64).unwrap_or(0),
        _ => 0,
    }
}

fn as_port(port: i64) -> anyhow::Result<u16> {
    u16::try_from(port).map_err(|_| anyhow::anyhow!("invalid port {port}"))
}

impl AppEngine {
    /// Validates the port carried by `params[key]` and returns it (`0` when absent).
    ///
    /// A port already bound by another install is `ErrPortInOtherApp`; a port open on the host is
    /// `ErrPortInUsed`.
    pub async fn check_port(&self, key: &str, params: &Map<String, Value>) -> anyhow::Result<i64> {
        let port = port_param(key, params);
        if port <= 0 {
            return Ok(port);
        }
        let p = as_port(port)?;
        let holders: Vec<AppInstall> = self.services().db.list(vec![Filter::Port(port)]).await?;
        if !holders.is_empty() {
            return Err(PanelError::PortInOtherApp {
                port: p,
                apps: holders.into_iter().map(|i| i.name).collect(),
            }
            .into());
        }
        if self.services().ports.in_use(p) {
            return Err(PanelError::PortInUsed { port: p }.into());
        }
        Ok(port)
    }

    /// Checks every claimant of `port` in turn: installs, runtimes, website domains, then the host.
    pub async fn check_port_exist(&self, port: i64) -> anyhow::Result<()> {
        let p = as_port(port)?;
        let db = &self.services().db;
        let exist = |kind: &str, name: String| PanelError::PortExist {
            port: p,
            kind: kind.to_string(),
            name,
        };
        if let Some(install) = db.first::<AppInstall>(vec![Filter::Port(port)]).await? {
            return Err(exist("App", install.name).into());
        }
        if let Some(runtime) = db.first::<Runtime>(vec![Filter::Port(port)]).await? {
            return Err(exist("Runtime", runtime.name).into());
        }
        if let Some(domain) = db.first::<WebsiteDomain>(vec![Filter::Port(port)]).await? {
            return Err(exist("Domain", domain.domain).into());
        }
        if self.services().ports.in_use(p) {
            return Err(PanelError::PortInUsed { port: p }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{error::panel_error, testing};

    fn params(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn port_params_are_coerced() {
        let p = params(json!({"A": 8080, "B": "9090", "C": 80.2, "D": "abc", "E": true}));
        assert_eq!(port_param("A", &p), 8080);
        assert_eq!(port_param("B", &p), 9090);
        assert_eq!(port_param("C", &p), 81);
        assert_eq!(port_param("D", &p), 0);
        assert_eq!(port_param("E", &p), 0);
        assert_eq!(port_param("missing", &p), 0);
    }

    #[tokio::test]
    async fn port_held_by_install_is_rejected_with_names() {
        let (svc, _fakes) = testing::services("port-other").await;
        let engine = AppEngine::new(svc.clone());
        svc.db
            .create(AppInstall {
                name: "mysql-1".to_string(),
                http_port: 3306,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = engine
            .check_port("PANEL_APP_PORT_HTTP", &params(json!({"PANEL_APP_PORT_HTTP": 3306})))
            .await
            .unwrap_err();
        let kind = panel_error(&err).unwrap();
        assert_eq!(kind.key(), "ErrPortInOtherApp");
        assert_eq!(kind.bag(), json!({"port": 3306, "apps": ["mysql-1"]}));
    }

    #[tokio::test]
    async fn open_host_port_is_in_use() {
        let (svc, fakes) = testing::services("port-used").await;
        fakes.ports.used.lock().unwrap().insert(8080);
        let engine = AppEngine::new(svc);
        let err = engine
            .check_port("PANEL_APP_PORT_HTTP", &params(json!({"PANEL_APP_PORT_HTTP": "8080"})))
            .await
            .unwrap_err();
        assert!(matches!(panel_error(&err), Some(PanelError::PortInUsed { port: 8080 })));
        assert_eq!(
            engine.check_port("PANEL_APP_PORT_HTTP", &Map::new()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn port_exist_checks_runtimes_then_domains() {
        let (svc, _fakes) = testing::services("port-exist").await;
        let engine = AppEngine::new(svc.clone());
        svc.db
            .create(Runtime {
                name: "node-app".to_string(),
                port: 3000,
                ..Default::default()
            })
            .await
            .unwrap();
        svc.db
            .create(WebsiteDomain {
                domain: "example.com".to_string(),
                port: 8443,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = engine.check_port_exist(3000).await.unwrap_err();
        assert_eq!(
            panel_error(&err).unwrap().bag(),
            json!({"port": 3000, "type": "Runtime", "name": "node-app"})
        );
        let err = engine.check_port_exist(8443).await.unwrap_err();
        assert_eq!(panel_error(&err).unwrap().bag()["type"], "Domain");
        engine.check_port_exist(9000).await.unwrap();
    }
}
