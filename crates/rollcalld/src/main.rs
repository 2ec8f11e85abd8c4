use anyhow::{Context, Result};
use rollcall_core::Config;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        db = %config.db_path.display(),
        threshold = config.recognition_threshold,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config).context("failed to start recognition engine")?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
