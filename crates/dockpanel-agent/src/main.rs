#![forbid(unsafe_code)]

mod api;
mod app;
mod archive;
mod compose;
mod compose_runner;
mod config;
mod container;
mod daemon;
mod db;
mod env_file;
mod error;
mod hooks;
mod ids;
mod model;
mod ports;
mod provisioner;
mod runner;
mod snapshot;
mod state;
mod task;
mod transport;
mod version;

#[cfg(test)]
mod testing;

use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    app::AppEngine,
    config::Config,
    db::Db,
    state::{AppState, Services},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dockpanel=info,dockpanel_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db = Db::open(&config.db_path()).await?;
    hooks::run_boot_hooks(&db).await?;

    let bind = config.http_addr.clone();
    let interval = Duration::from_secs(config.sync_interval_seconds);
    let services = Services::for_host(config, db)?;
    let state = AppState::new(services);

    tokio::spawn(status_sync_loop(state.apps.clone(), interval));

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "dockpanel agent listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Reconciles install statuses with the runtime on a fixed interval.
async fn status_sync_loop(apps: AppEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match apps.sync_all().await {
            Ok(0) => {}
            Ok(changed) => tracing::debug!(changed, "install statuses synced"),
            Err(e) => tracing::warn!(error = %e, "install status sync failed"),
        }
    }
}
