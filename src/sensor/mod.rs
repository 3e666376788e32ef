//! ==============================================================================
//! sensor - measurement sources
//! ==============================================================================
//!
//! purpose:
//!     turns one DeviceConfig into a `MeasurementSource` that yields one
//!     `Sample` (or an `AcquisitionError`) per call to `next()`.
//!
//! structure:
//!     - DeviceKind: parsed once from the config string. unknown kinds fail
//!       controller construction.
//!     - SensorDriver: sum type over the supported driver families.
//!     - MeasurementSource: driver + optional multiplexer route + the bus
//!       locks that guard them.
//!     - FailureTracker: hysteresis so one-off read errors do not flood logs.
//!
//! relationships:
//!     - uses: hal.rs (hardware access), lock.rs (bus exclusivity)
//!     - used by: controller.rs
//!
//! ==============================================================================

pub mod convert;

use crate::config::{parse_address, DeviceConfig, EdgeConfig};
use crate::error::{AcquisitionError, ControllerError};
use crate::hal::HardwareProvider;
use crate::lock::{BusResource, LockManager};
use convert::AnalogConversion;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// escalate to a warning after this many consecutive failed reads
pub const ESCALATE_AFTER: u32 = 3;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// get current timestamp in milliseconds (unix epoch)
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// one successful acquisition: measurement name -> value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub values: BTreeMap<String, f64>,
}

impl Sample {
    pub fn now(values: BTreeMap<String, f64>) -> Self {
        Self { timestamp_ms: now_ms(), values }
    }

    pub fn single(measurement: &str, value: f64) -> Self {
        Self::now(BTreeMap::from([(measurement.to_string(), value)]))
    }

    pub fn get(&self, measurement: &str) -> Option<f64> {
        self.values.get(measurement).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ads1x15,
    Dht22,
    CpuTemp,
    CpuLoad,
    FreeSpace,
    Command,
    Edge,
}

impl FromStr for DeviceKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ads1x15" | "ads1115" => Ok(Self::Ads1x15),
            "dht22" | "am2302" => Ok(Self::Dht22),
            "cpu_temp" | "rpi" => Ok(Self::CpuTemp),
            "cpu_load" | "rpicpuload" => Ok(Self::CpuLoad),
            "free_space" | "rpifreespace" => Ok(Self::FreeSpace),
            "command" | "linuxcommand" => Ok(Self::Command),
            "edge" => Ok(Self::Edge),
            _ => Err(ControllerError::UnknownDeviceKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdcDriver {
    pub bus: u8,
    pub address: u8,
    pub channel: u8,
    pub gain: u8,
    pub measurement: String,
    pub conversion: AnalogConversion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxRoute {
    pub bus: u8,
    pub address: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorDriver {
    Adc(AdcDriver),
    Dht22 { pin: u8 },
    CpuTemp,
    CpuLoad,
    FreeSpace { mount: PathBuf },
    Command { command: String, measurement: String },
    /// interrupt driven; never polled
    Edge { pin: u8, edge: EdgeConfig },
}

impl SensorDriver {
    pub fn from_config(device: &DeviceConfig) -> Result<Self, ControllerError> {
        let kind: DeviceKind = device.kind.parse()?;
        let invalid = |reason: &str| ControllerError::InvalidDevice {
            device: device.id.clone(),
            reason: reason.to_string(),
        };
        let pin = || {
            device
                .location
                .trim()
                .parse::<u8>()
                .map_err(|_| invalid("location must be a gpio pin number"))
        };

        Ok(match kind {
            DeviceKind::Ads1x15 => {
                let adc = device.adc.as_ref().ok_or_else(|| invalid("missing [adc] section"))?;
                let address =
                    parse_address(&device.location).map_err(|e| invalid(&e.to_string()))?;
                Self::Adc(AdcDriver {
                    bus: device.i2c_bus,
                    address,
                    channel: adc.channel,
                    gain: adc.gain,
                    measurement: adc.measurement.clone(),
                    conversion: adc.conversion(),
                })
            }
            DeviceKind::Dht22 => Self::Dht22 { pin: pin()? },
            DeviceKind::CpuTemp => Self::CpuTemp,
            DeviceKind::CpuLoad => Self::CpuLoad,
            DeviceKind::FreeSpace => {
                let mount = if device.location.is_empty() { "/" } else { device.location.as_str() };
                Self::FreeSpace { mount: PathBuf::from(mount) }
            }
            DeviceKind::Command => {
                let cmd = device
                    .command
                    .as_ref()
                    .ok_or_else(|| invalid("missing [command] section"))?;
                Self::Command { command: cmd.command.clone(), measurement: cmd.measurement.clone() }
            }
            DeviceKind::Edge => {
                let edge = device.edge.clone().ok_or_else(|| invalid("missing [edge] section"))?;
                Self::Edge { pin: pin()?, edge }
            }
        })
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, Self::Edge { .. })
    }

    async fn read(&self, hal: &Arc<dyn HardwareProvider>) -> Result<BTreeMap<String, f64>, AcquisitionError> {
        match self {
            Self::Adc(adc) => {
                let (bus, address, channel, gain) = (adc.bus, adc.address, adc.channel, adc.gain);
                let hal = hal.clone();
                let volts =
                    blocking(move || hal.read_adc_voltage(bus, address, channel, gain)).await?;
                Ok(BTreeMap::from([
                    ("voltage".to_string(), volts),
                    (adc.measurement.clone(), adc.conversion.convert(volts)),
                ]))
            }
            Self::Dht22 { pin } => {
                let pin = *pin;
                let hal = hal.clone();
                let (t, h) = blocking(move || hal.read_dht22(pin)).await?;
                let (t, h) = (t as f64, h as f64);
                Ok(BTreeMap::from([
                    ("temperature".to_string(), t),
                    ("humidity".to_string(), h),
                    ("dew_point".to_string(), dew_point(t, h)),
                ]))
            }
            Self::CpuTemp => {
                let hal = hal.clone();
                let t = blocking(move || hal.get_cpu_temp()).await?;
                Ok(BTreeMap::from([("temperature".to_string(), t as f64)]))
            }
            Self::CpuLoad => {
                let load = sysinfo::System::load_average();
                Ok(BTreeMap::from([
                    ("load_1min".to_string(), load.one),
                    ("load_5min".to_string(), load.five),
                    ("load_15min".to_string(), load.fifteen),
                ]))
            }
            Self::FreeSpace { mount } => {
                let disks = sysinfo::Disks::new_with_refreshed_list();
                let disk = disks
                    .list()
                    .iter()
                    .find(|d| d.mount_point() == mount.as_path())
                    .ok_or_else(|| {
                        AcquisitionError::NoReading(format!("no disk mounted at {}", mount.display()))
                    })?;
                let mib = disk.available_space() as f64 / (1024.0 * 1024.0);
                Ok(BTreeMap::from([("disk_space".to_string(), mib)]))
            }
            Self::Command { command, measurement } => {
                let value = run_command_sensor(command).await?;
                Ok(BTreeMap::from([(measurement.clone(), value)]))
            }
            Self::Edge { .. } => Err(AcquisitionError::NoReading(
                "edge devices are interrupt driven".to_string(),
            )),
        }
    }
}

/// magnus formula, good to ~0.35C between -45C and 60C
pub fn dew_point(temp_c: f64, humidity: f64) -> f64 {
    const B: f64 = 17.62;
    const C: f64 = 243.12;
    let gamma = (humidity.max(0.01) / 100.0).ln() + B * temp_c / (C + temp_c);
    C * gamma / (B - gamma)
}

async fn run_command_sensor(command: &str) -> Result<f64, AcquisitionError> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        tokio::process::Command::new("sh").arg("-c").arg(command).output(),
    )
    .await
    .map_err(|_| AcquisitionError::NoReading(format!("command timed out after {COMMAND_TIMEOUT:?}")))?
    .map_err(|e| AcquisitionError::Hardware(format!("failed to run command: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AcquisitionError::NoReading(format!(
            "command exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .parse::<f64>()
        .map_err(|e| AcquisitionError::Parse(format!("{e} (got: {})", stdout.trim())))
}

/// offload blocking hal io to a dedicated thread
async fn blocking<T, F>(f: F) -> Result<T, AcquisitionError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AcquisitionError::Hardware(format!("task join error: {e}")))?
        .map_err(|e| AcquisitionError::Hardware(format!("{e:#}")))
}

/// a driver plus the bus plumbing needed to reach it
pub struct MeasurementSource {
    driver: SensorDriver,
    mux: Option<MuxRoute>,
    hal: Arc<dyn HardwareProvider>,
    locks: Arc<LockManager>,
}

impl MeasurementSource {
    pub fn from_config(
        device: &DeviceConfig,
        hal: Arc<dyn HardwareProvider>,
        locks: Arc<LockManager>,
    ) -> Result<Self, ControllerError> {
        let driver = SensorDriver::from_config(device)?;
        let mux = match &device.multiplexer {
            Some(m) => Some(MuxRoute {
                bus: m.bus,
                address: parse_address(&m.address).map_err(|e| ControllerError::InvalidDevice {
                    device: device.id.clone(),
                    reason: e.to_string(),
                })?,
                channel: m.channel,
            }),
            None => None,
        };
        Ok(Self { driver, mux, hal, locks })
    }

    pub fn driver(&self) -> &SensorDriver {
        &self.driver
    }

    /// bus locks this source needs, in acquisition order
    pub fn bus_resources(&self) -> Vec<BusResource> {
        let mut resources = Vec::new();
        if let Some(mux) = &self.mux {
            resources.push(BusResource::multiplexer(mux.bus, mux.address));
        }
        if let SensorDriver::Adc(adc) = &self.driver {
            resources.push(BusResource::converter(adc.bus, adc.address));
        }
        resources
    }

    /// acquire one sample. bus locks are held for the whole read and released
    /// when `_locks` drops, whatever the outcome.
    pub async fn next(&self) -> Result<Sample, AcquisitionError> {
        let resources = self.bus_resources();
        let _locks = if resources.is_empty() {
            None
        } else {
            let set = self.locks.acquire_ordered(&resources).await?;
            tracing::trace!(locks = ?set.resources(), forced = set.any_forced(), "bus locks held");
            Some(set)
        };

        if let Some(route) = self.mux {
            let hal = self.hal.clone();
            blocking(move || hal.select_mux_channel(route.bus, route.address, route.channel)).await?;
        }

        let values = self.driver.read(&self.hal).await?;
        Ok(Sample::now(values))
    }

    /// release device resources before the controller stops
    pub fn stop(&self) {
        if let SensorDriver::Edge { pin, .. } = &self.driver {
            if let Err(e) = self.hal.unwatch_edges(*pin) {
                tracing::warn!(pin, "failed to release edge detection: {e:#}");
            }
        }
    }
}

/// consecutive-failure hysteresis: one warning per `ESCALATE_AFTER` failures in a row
#[derive(Debug, Default, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    escalations: u64,
}

impl FailureTracker {
    /// returns true when this failure should be escalated to a warning
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= ESCALATE_AFTER {
            self.consecutive = 0;
            self.escalations += 1;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn escalations(&self) -> u64 {
        self.escalations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdcConfig, LockConfig, MultiplexerConfig};
    use crate::hal::MockHal;
    use proptest::prelude::*;

    fn device(kind: &str, location: &str) -> DeviceConfig {
        DeviceConfig {
            id: "dev".into(),
            name: String::new(),
            kind: kind.into(),
            location: location.into(),
            i2c_bus: 1,
            period_secs: 60.0,
            pre_relay_id: None,
            pre_relay_secs: 0.0,
            multiplexer: None,
            adc: None,
            edge: None,
            command: None,
            rules: Vec::new(),
        }
    }

    fn adc_device() -> DeviceConfig {
        DeviceConfig {
            multiplexer: Some(MultiplexerConfig { address: "0x70".into(), bus: 1, channel: 3 }),
            adc: Some(AdcConfig {
                channel: 0,
                gain: 1,
                measurement: "moisture".into(),
                volts_min: 0.0,
                volts_max: 3.3,
                units_min: 0.0,
                units_max: 100.0,
                inverse: false,
            }),
            ..device("ads1x15", "0x48")
        }
    }

    #[test]
    fn test_unknown_kind_fails() {
        let err = SensorDriver::from_config(&device("flux-capacitor", "")).unwrap_err();
        assert!(matches!(err, ControllerError::UnknownDeviceKind(k) if k == "flux-capacitor"));
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!("ADS1x15".parse::<DeviceKind>().unwrap(), DeviceKind::Ads1x15);
        assert_eq!("RPi".parse::<DeviceKind>().unwrap(), DeviceKind::CpuTemp);
        assert_eq!("LinuxCommand".parse::<DeviceKind>().unwrap(), DeviceKind::Command);
    }

    #[test]
    fn test_missing_sections_are_invalid() {
        assert!(matches!(
            SensorDriver::from_config(&device("ads1x15", "0x48")),
            Err(ControllerError::InvalidDevice { .. })
        ));
        assert!(matches!(
            SensorDriver::from_config(&device("dht22", "not-a-pin")),
            Err(ControllerError::InvalidDevice { .. })
        ));
    }

    #[tokio::test]
    async fn test_adc_read_holds_locks_and_converts() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(
            LockManager::new(&LockConfig { dir: dir.path().to_path_buf(), ..LockConfig::default() })
                .unwrap(),
        );
        let hal = Arc::new(MockHal::new());
        hal.push_voltage(Some(1.65));
        let source = MeasurementSource::from_config(&adc_device(), hal.clone(), locks).unwrap();

        let sample = source.next().await.unwrap();
        assert!((sample.get("moisture").unwrap() - 50.0).abs() < 1e-9);
        assert_eq!(sample.get("voltage"), Some(1.65));
        assert_eq!(hal.mux_selects(), vec![(1, 0x70, 3)]);
        // both locks released
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_read_still_releases_locks() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(
            LockManager::new(&LockConfig { dir: dir.path().to_path_buf(), ..LockConfig::default() })
                .unwrap(),
        );
        let hal = Arc::new(MockHal::new());
        hal.push_voltage(None);
        let source = MeasurementSource::from_config(&adc_device(), hal, locks).unwrap();

        assert!(matches!(source.next().await, Err(AcquisitionError::Hardware(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_command_sensor_parses_stdout() {
        assert_eq!(run_command_sensor("echo 21.5").await.unwrap(), 21.5);
        assert!(matches!(run_command_sensor("echo nope").await, Err(AcquisitionError::Parse(_))));
        assert!(matches!(run_command_sensor("exit 3").await, Err(AcquisitionError::NoReading(_))));
    }

    #[test]
    fn test_dew_point() {
        // 25C at 50% RH is about 13.9C dew point
        assert!((dew_point(25.0, 50.0) - 13.85).abs() < 0.1);
    }

    #[test]
    fn test_failure_tracker_escalates_on_third() {
        let mut tracker = FailureTracker::default();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
        assert_eq!(tracker.consecutive(), 0);
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert_eq!(tracker.escalations(), 1);
    }

    proptest! {
        #[test]
        fn prop_escalations_match_failure_runs(outcomes in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut tracker = FailureTracker::default();
            let mut expected = 0u64;
            let mut run = 0u32;
            for ok in &outcomes {
                if *ok {
                    tracker.record_success();
                    expected += (run / ESCALATE_AFTER) as u64;
                    run = 0;
                } else {
                    tracker.record_failure();
                }
                if !*ok { run += 1; }
            }
            expected += (run / ESCALATE_AFTER) as u64;
            prop_assert_eq!(tracker.escalations(), expected);
        }
    }
}
