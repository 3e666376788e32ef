//! host.toml hot reload.
//!
//! notify reports raw filesystem events on the config's directory (editors
//! often replace the file instead of writing it). an event only counts when
//! the file's mtime moved past the last one seen. each accepted change is
//! re-read and validated; controllers whose rules differ get a
//! reconfiguration request. device-level edits need a restart.

use crate::config::{DeviceConfig, HostConfig};
use crate::controller::ControllerHandle;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub reconfigured: Vec<String>,
    pub unchanged: Vec<String>,
    /// device record itself changed, or the device was added/removed
    pub needs_restart: Vec<String>,
}

/// push rule changes in `next` to the running controllers
pub async fn apply(
    next: &HostConfig,
    controllers: &[ControllerHandle],
    running: &mut HashMap<String, DeviceConfig>,
) -> ReloadSummary {
    let mut summary = ReloadSummary::default();

    for device in &next.devices {
        let Some(handle) = controllers.iter().find(|c| c.device_id() == device.id) else {
            tracing::warn!(device = %device.id, "new device in config, restart to start it");
            summary.needs_restart.push(device.id.clone());
            continue;
        };

        if let Some(current) = running.get(&device.id) {
            if current.without_rules() != device.without_rules() {
                tracing::warn!(device = %device.id, "device settings changed, restart to apply");
                summary.needs_restart.push(device.id.clone());
            }
        }

        if handle.rules().same_rules(&device.rules) {
            summary.unchanged.push(device.id.clone());
            continue;
        }
        match handle.reconfigure(device.rules.clone()).await {
            Ok(version) => {
                tracing::info!(device = %device.id, version, "rules reloaded");
                running
                    .entry(device.id.clone())
                    .and_modify(|d| d.rules = device.rules.clone());
                summary.reconfigured.push(device.id.clone());
            }
            Err(e) => tracing::warn!(device = %device.id, "reconfiguration failed: {e}"),
        }
    }

    for handle in controllers {
        if !next.devices.iter().any(|d| d.id == handle.device_id()) {
            tracing::warn!(device = handle.device_id(), "device removed from config, restart to stop it");
            summary.needs_restart.push(handle.device_id().to_string());
        }
    }
    summary
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    events: mpsc::UnboundedReceiver<Event>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => tracing::warn!("config watch error: {e}"),
        })?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            path: path.to_path_buf(),
            last_modified: modified(path),
            events,
            _watcher: watcher,
        })
    }

    fn touches_config(&self, event: &Event) -> bool {
        event.paths.iter().any(|p| p.file_name() == self.path.file_name())
    }

    /// wait for the next real change. `None` once the watcher is gone.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            let event = self.events.recv().await?;
            if !self.touches_config(&event) {
                continue;
            }
            // let the writer finish, then collapse the burst
            tokio::time::sleep(SETTLE).await;
            while self.events.try_recv().is_ok() {}

            let current = modified(&self.path);
            if current.is_some() && current > self.last_modified {
                self.last_modified = current;
                return Some(());
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// watch `path` and reload until `stop` flips
pub fn spawn(
    mut watcher: ConfigWatcher,
    controllers: Vec<ControllerHandle>,
    initial: &HostConfig,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut running: HashMap<String, DeviceConfig> =
        initial.devices.iter().map(|d| (d.id.clone(), d.clone())).collect();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = watcher.changed() => {
                    if changed.is_none() {
                        break;
                    }
                    match HostConfig::load(watcher.path()) {
                        Ok(next) => {
                            let summary = apply(&next, &controllers, &mut running).await;
                            tracing::info!(
                                reconfigured = summary.reconfigured.len(),
                                unchanged = summary.unchanged.len(),
                                needs_restart = summary.needs_restart.len(),
                                "config reloaded"
                            );
                        }
                        Err(e) => tracing::warn!(path = %watcher.path().display(), "ignoring config change: {e}"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
