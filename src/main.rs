//! ==============================================================================
//! main.rs - sensor host daemon
//! ==============================================================================
//!
//! purpose:
//!     loads host.toml, starts one polling controller per device, and keeps
//!     them running until ctrl-c.
//!
//! architecture:
//!     ┌────────────────────────────────────────────────────────────────────┐
//!     │                         sensor-host (tokio)                        │
//!     │                                                                    │
//!     │  ┌──────────────┐ ┌──────────────┐ ┌────────────┐ ┌─────────────┐  │
//!     │  │ controller   │ │ controller   │ │ status api │ │ hot reload  │  │
//!     │  │ (per device) │ │ (edge task)  │ │ (axum)     │ │ (notify)    │  │
//!     │  └──────┬───────┘ └──────┬───────┘ └────────────┘ └──────┬──────┘  │
//!     │         │ bus locks      │                      reconfigure       │
//!     │         ▼                ▼                               │         │
//!     │  ┌───────────────────────────────┐   ┌──────────────────────────┐  │
//!     │  │ hal (rppal or mock)           │   │ sink (memory / influxdb) │  │
//!     │  └───────────────────────────────┘   └──────────────────────────┘  │
//!     └────────────────────────────────────────────────────────────────────┘
//!
//! shutdown:
//!     ctrl-c stops every controller cooperatively and waits for each to
//!     report Stopped. actions already spawned by a firing are not awaited.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use sensor_host::actions::Collaborators;
use sensor_host::api::{self, ApiState};
use sensor_host::config::{HostConfig, SinkKind};
use sensor_host::controller::{ControllerDeps, PollingController};
use sensor_host::hal;
use sensor_host::lock::LockManager;
use sensor_host::sink::{InfluxSink, MemorySink, SampleSink};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  sensor-host");
    println!("===========================================================");

    // step 1: configuration and logging
    let (config, config_path) = HostConfig::load_or_default();
    init_tracing(&config.logging.level);
    config.log_summary();

    // step 2: shared services
    let hal = hal::default_provider();
    let locks = Arc::new(
        LockManager::new(&config.locks)
            .with_context(|| format!("failed to prepare lock dir {}", config.locks.dir.display()))?,
    );
    let sink: Arc<dyn SampleSink> = match config.sink.kind {
        SinkKind::Memory => Arc::new(MemorySink::new()),
        SinkKind::Influx => Arc::new(InfluxSink::new(&config.sink).context("failed to build influx client")?),
    };
    let deps = ControllerDeps {
        hal: hal.clone(),
        locks,
        sink,
        collaborators: Collaborators::from_host(hal, &config.relays, &config.cameras, &config.smtp),
        hourly_max: config.smtp.hourly_max,
        tick: config.polling.tick(),
    };

    // step 3: one controller per device. a bad device does not take the others down.
    let mut controllers = Vec::new();
    for device in &config.devices {
        match PollingController::new(device.clone(), deps.clone()).and_then(|c| c.spawn()) {
            Ok(handle) => controllers.push(handle),
            Err(e) => tracing::error!(device = %device.id, "controller failed to start: {e}"),
        }
    }
    if controllers.is_empty() {
        tracing::warn!("no controllers running");
    } else {
        tracing::info!(count = controllers.len(), "controllers running");
    }

    // step 4: status api
    if config.api.enabled {
        let state = ApiState::new(controllers.clone());
        state.spawn_collectors();
        let bind = config.api.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&bind, state).await {
                tracing::error!("status api failed: {e:#}");
            }
        });
    }

    // step 5: hot reload
    let (stop_tx, stop_rx) = watch::channel(false);
    let reload = match &config_path {
        Some(path) => match sensor_host::watch::ConfigWatcher::new(path) {
            Ok(watcher) => Some(sensor_host::watch::spawn(watcher, controllers.clone(), &config, stop_rx)),
            Err(e) => {
                tracing::warn!(path = %path.display(), "hot reload disabled: {e}");
                None
            }
        },
        None => None,
    };

    // step 6: run until ctrl-c
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    let _ = stop_tx.send(true);

    let mut stopping = JoinSet::new();
    for handle in controllers {
        stopping.spawn(async move { handle.stop().await });
    }
    while stopping.join_next().await.is_some() {}
    if let Some(task) = reload {
        let _ = task.await;
    }
    tracing::info!("all controllers stopped");
    Ok(())
}

/// RUST_LOG wins; otherwise the level from host.toml
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
