use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{BusKind, Config};
use dbus_interface::{RollcallBus, BUS_NAME, OBJECT_PATH};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db_path = %config.db_path.display(),
        threshold = config.similarity_threshold,
        embedding_dim = config.embedding_dim,
        late_cutoff = %config.late_cutoff,
        allow_reentry = config.allow_reentry,
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path, config.store_timeout)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let engine = engine::spawn_engine(
        Arc::new(store),
        config.service_config(),
        config.audit_log_limit,
    )?;

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallBus::new(engine))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
