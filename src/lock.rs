//! ==============================================================================
//! lock.rs - named hardware-bus locks shared by every controller on the host
//! ==============================================================================
//!
//! purpose:
//!     multiplexers and analog converters sit on shared i2c buses. only one
//!     controller (in this process or any other) may drive one at a time.
//!
//! mechanism:
//!     one lock file per bus resource under `[locks] dir`, created with
//!     O_EXCL and holding the owner token. acquisition polls at a fixed short
//!     interval until the timeout, then (policy permitting) breaks the stale
//!     lock and retries exactly once.
//!
//! KNOWN HAZARD:
//!     breaking after the timeout favours liveness over exclusivity. a holder
//!     that is merely slow (not dead) loses its lock. set
//!     `break_on_timeout = false` to get strict exclusivity with a hard error.
//!
//! ordering:
//!     resources carry a rank (multiplexer before converter). `acquire_ordered`
//!     always takes them in rank order and releases in reverse.
//!
//! ==============================================================================

use crate::config::LockConfig;
use crate::error::LockError;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusKind {
    Multiplexer,
    Converter,
}

impl BusKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Multiplexer => "mux",
            Self::Converter => "adc",
        }
    }
}

/// one lockable channel, identified by bus kind + bus number + device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusResource {
    pub kind: BusKind,
    pub bus: u8,
    pub address: u8,
}

impl BusResource {
    pub fn multiplexer(bus: u8, address: u8) -> Self {
        Self { kind: BusKind::Multiplexer, bus, address }
    }

    pub fn converter(bus: u8, address: u8) -> Self {
        Self { kind: BusKind::Converter, bus, address }
    }

    /// deterministic across processes, e.g. `sensor-host_mux_bus1_0x70`
    pub fn name(&self) -> String {
        format!("sensor-host_{}_bus{}_0x{:02X}", self.kind.tag(), self.bus, self.address)
    }

    /// acquisition order; lower ranks are always taken first
    pub fn rank(&self) -> u8 {
        match self.kind {
            BusKind::Multiplexer => 0,
            BusKind::Converter => 1,
        }
    }
}

pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    poll: Duration,
    break_on_timeout: bool,
    forced_breaks: AtomicU64,
}

impl LockManager {
    pub fn new(config: &LockConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            dir: config.dir.clone(),
            timeout: Duration::from_secs_f64(config.timeout_secs),
            poll: Duration::from_millis(config.poll_ms),
            break_on_timeout: config.break_on_timeout,
            forced_breaks: AtomicU64::new(0),
        })
    }

    pub fn lock_path(&self, resource: &BusResource) -> PathBuf {
        self.dir.join(format!("{}.lock", resource.name()))
    }

    /// number of locks this manager has broken since startup
    pub fn forced_breaks(&self) -> u64 {
        self.forced_breaks.load(Ordering::Relaxed)
    }

    pub async fn acquire(&self, resource: &BusResource) -> Result<LockGuard, LockError> {
        self.acquire_with_timeout(resource, self.timeout).await
    }

    pub async fn acquire_with_timeout(
        &self,
        resource: &BusResource,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let name = resource.name();
        let path = self.lock_path(resource);
        let token = format!(
            "{}:{}",
            std::process::id(),
            NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
        );
        let started = Instant::now();

        debug!(resource = %name, "acquiring lock");
        loop {
            if try_create(&path, &token).map_err(|e| LockError::io(&name, e))? {
                debug!(resource = %name, waited_ms = started.elapsed().as_millis() as u64, "acquired lock");
                return Ok(LockGuard::new(name, path, token, false));
            }
            if started.elapsed() >= timeout {
                break;
            }
            tokio::time::sleep(self.poll).await;
        }

        if !self.break_on_timeout {
            warn!(resource = %name, waited = ?timeout, "lock timeout");
            return Err(LockError::Timeout { resource: name, waited: timeout });
        }

        let holder = std::fs::read_to_string(&path).unwrap_or_default();
        warn!(
            resource = %name,
            waited = ?timeout,
            holder = %holder.trim(),
            "lock still held after timeout, breaking it"
        );
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::io(&name, e)),
        }
        self.forced_breaks.fetch_add(1, Ordering::Relaxed);

        if try_create(&path, &token).map_err(|e| LockError::io(&name, e))? {
            Ok(LockGuard::new(name, path, token, true))
        } else {
            Err(LockError::Contended {
                resource: name,
                reason: "another owner re-took the lock during the break".to_string(),
            })
        }
    }

    /// take several locks in rank order. on failure the ones already held are released.
    pub async fn acquire_ordered(&self, resources: &[BusResource]) -> Result<LockSet, LockError> {
        let mut ordered = resources.to_vec();
        ordered.sort_by_key(|r| r.rank());
        ordered.dedup();

        let mut set = LockSet { guards: Vec::with_capacity(ordered.len()) };
        for resource in &ordered {
            set.guards.push(self.acquire(resource).await?);
        }
        Ok(set)
    }
}

fn try_create(path: &Path, token: &str) -> std::io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(token.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// ownership of one bus lock. released on drop, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    resource: String,
    path: PathBuf,
    token: String,
    forced: bool,
}

impl LockGuard {
    fn new(resource: String, path: PathBuf, token: String, forced: bool) -> Self {
        Self { resource, path, token, forced }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// true when this guard was obtained by breaking someone else's lock
    pub fn was_forced(&self) -> bool {
        self.forced
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                debug!(resource = %self.resource, "releasing lock");
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(resource = %self.resource, "failed to remove lock file: {e}");
                }
            }
            Ok(owner) => {
                // our lock was broken and re-taken; the file is not ours to delete
                warn!(resource = %self.resource, owner = %owner.trim(), "lock was taken over before release");
            }
            Err(e) => {
                warn!(resource = %self.resource, "lock file vanished before release: {e}");
            }
        }
    }
}

/// locks taken by `acquire_ordered`, released in reverse acquisition order
#[derive(Debug)]
pub struct LockSet {
    guards: Vec<LockGuard>,
}

impl LockSet {
    pub fn resources(&self) -> Vec<&str> {
        self.guards.iter().map(|g| g.resource()).collect()
    }

    pub fn any_forced(&self) -> bool {
        self.guards.iter().any(|g| g.was_forced())
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
