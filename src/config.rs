//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - PollingConfig: tick cadence shared by every controller.
//!     - LockConfig: where bus lock files live and how long to wait for them.
//!     - SinkConfig: where processed samples go.
//!     - SmtpConfig: mail transport settings and the hourly notification cap.
//!     - RelayConfig / CameraConfig: actuators referenced by rule actions.
//!     - DeviceConfig: one entry per physical sensor, with its rules inline.
//!
//! ==============================================================================

use crate::error::ConfigError;
use crate::rules::{Action, ConditionalRule};
use crate::sensor::convert::AnalogConversion;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// env var that overrides the config search path
pub const CONFIG_ENV: &str = "SENSOR_HOST_CONFIG";

/// upper bound for every configured duration (one year)
pub const MAX_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { tick_ms: default_tick_ms() }
    }
}

impl PollingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_ms: u64,
    /// break a lock that is still held after `timeout_secs`.
    /// this trades strict exclusivity for liveness; see DESIGN.md.
    #[serde(default = "default_true")]
    pub break_on_timeout: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            timeout_secs: default_lock_timeout(),
            poll_ms: default_lock_poll_ms(),
            break_on_timeout: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Memory,
    Influx,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default = "default_influx_db")]
    pub database: String,
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Memory,
            url: default_influx_url(),
            database: default_influx_db(),
            timeout_secs: default_sink_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    /// notifications allowed per rule per rolling hour
    #[serde(default = "default_hourly_max")]
    pub hourly_max: u32,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            user: String::new(),
            password: String::new(),
            from: String::new(),
            hourly_max: default_hourly_max(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub id: String,
    pub gpio_pin: u8,
    /// sainsmart style boards switch on when the input goes LOW
    #[serde(default = "default_true")]
    pub active_low: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub id: String,
    /// placeholders: {output} (file to write), {duration} (seconds, video only)
    #[serde(default = "default_photo_command")]
    pub photo_command: String,
    #[serde(default = "default_video_command")]
    pub video_command: String,
    #[serde(default = "default_capture_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MultiplexerConfig {
    /// hex string, e.g. "0x70"
    pub address: String,
    #[serde(default = "default_i2c_bus")]
    pub bus: u8,
    pub channel: u8,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AdcConfig {
    pub channel: u8,
    #[serde(default = "default_gain")]
    pub gain: u8,
    /// name the converted value is stored under
    pub measurement: String,
    pub volts_min: f64,
    pub volts_max: f64,
    pub units_min: f64,
    pub units_max: f64,
    #[serde(default)]
    pub inverse: bool,
}

impl AdcConfig {
    pub fn conversion(&self) -> AnalogConversion {
        AnalogConversion {
            volts_min: self.volts_min,
            volts_max: self.volts_max,
            units_min: self.units_min,
            units_max: self.units_max,
            inverse: self.inverse,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicy {
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EdgeConfig {
    pub edge: EdgePolicy,
    #[serde(default = "default_bounce_ms")]
    pub bounce_ms: u64,
    #[serde(default = "default_reset_secs")]
    pub reset_secs: f64,
}

impl EdgeConfig {
    pub fn reset_period(&self) -> Duration {
        Duration::from_secs_f64(self.reset_secs.max(0.0))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommandSensorConfig {
    pub command: String,
    pub measurement: String,
}

/// immutable description of one sensor instance
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// parsed into a driver at controller construction
    pub kind: String,
    /// gpio pin, i2c address, mount point... depends on `kind`
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(default = "default_period")]
    pub period_secs: f64,
    #[serde(default)]
    pub pre_relay_id: Option<String>,
    #[serde(default)]
    pub pre_relay_secs: f64,
    #[serde(default)]
    pub multiplexer: Option<MultiplexerConfig>,
    #[serde(default)]
    pub adc: Option<AdcConfig>,
    #[serde(default)]
    pub edge: Option<EdgeConfig>,
    #[serde(default)]
    pub command: Option<CommandSensorConfig>,
    #[serde(default)]
    pub rules: Vec<ConditionalRule>,
}

impl DeviceConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs.max(0.0))
    }

    /// pre-action relay and how long it stays on, when both are configured
    pub fn pre_relay(&self) -> Option<(&str, Duration)> {
        match &self.pre_relay_id {
            Some(id) if self.pre_relay_secs > 0.0 => {
                Some((id.as_str(), Duration::from_secs_f64(self.pre_relay_secs)))
            }
            _ => None,
        }
    }

    /// the device record without its rules, used to detect device-level edits
    pub fn without_rules(&self) -> DeviceConfig {
        DeviceConfig { rules: Vec::new(), ..self.clone() }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// parse "0x70" / "70" / "112" style i2c addresses
pub fn parse_address(raw: &str) -> Result<u8, ConfigError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => u8::from_str_radix(trimmed, 16),
    };
    parsed.map_err(|_| ConfigError::Invalid(format!("'{raw}' is not an i2c address")))
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// first existing config file: $SENSOR_HOST_CONFIG, config/host.toml, ../config/host.toml
    pub fn locate() -> Option<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(env_path));
        }
        paths.push(PathBuf::from("config").join("host.toml"));
        paths.push(PathBuf::from("..").join("config").join("host.toml"));
        paths.into_iter().find(|p| p.exists())
    }

    /// Load with default fallback
    ///
    /// runs before the tracing subscriber exists, so it reports on stdout.
    pub fn load_or_default() -> (Self, Option<PathBuf>) {
        if let Some(path) = Self::locate() {
            match Self::load(&path) {
                Ok(config) => {
                    println!("[CONFIG] Loaded from {}", path.display());
                    return (config, Some(path));
                }
                Err(e) => {
                    println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                }
            }
        }
        println!("[CONFIG] Warning: No config file found - using defaults");
        (Self::default(), None)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.tick_ms == 0 {
            return Err(invalid("polling.tick_ms must be > 0"));
        }
        if self.locks.poll_ms == 0 {
            return Err(invalid("locks.poll_ms must be > 0"));
        }
        check_secs("locks.timeout_secs", self.locks.timeout_secs, true)?;

        let relay_ids: HashSet<&str> = self.relays.iter().map(|r| r.id.as_str()).collect();
        let camera_ids: HashSet<&str> = self.cameras.iter().map(|c| c.id.as_str()).collect();
        let mut device_ids = HashSet::new();

        for device in &self.devices {
            if device.id.is_empty() {
                return Err(invalid("device id must not be empty"));
            }
            if !device_ids.insert(device.id.as_str()) {
                return Err(invalid(format!("duplicate device id '{}'", device.id)));
            }
            check_secs(&format!("device {}: period_secs", device.id), device.period_secs, false)?;
            check_secs(&format!("device {}: pre_relay_secs", device.id), device.pre_relay_secs, true)?;
            if let Some(edge) = &device.edge {
                check_secs(&format!("device {}: edge.reset_secs", device.id), edge.reset_secs, true)?;
            }
            if let Some(relay) = &device.pre_relay_id {
                if !relay_ids.contains(relay.as_str()) {
                    return Err(invalid(format!(
                        "device {}: unknown pre_relay_id '{}'",
                        device.id, relay
                    )));
                }
            }
            if let Some(mux) = &device.multiplexer {
                parse_address(&mux.address)?;
                if mux.channel > 7 {
                    return Err(invalid(format!(
                        "device {}: multiplexer channel {} out of range 0-7",
                        device.id, mux.channel
                    )));
                }
            }
            if let Some(adc) = &device.adc {
                adc.conversion()
                    .validate()
                    .map_err(|e| invalid(format!("device {}: {}", device.id, e)))?;
            }

            let mut rule_ids = HashSet::new();
            for rule in &device.rules {
                if rule.id.is_empty() {
                    return Err(invalid(format!("device {}: rule id must not be empty", device.id)));
                }
                if !rule_ids.insert(rule.id.as_str()) {
                    return Err(invalid(format!(
                        "device {}: duplicate rule id '{}'",
                        device.id, rule.id
                    )));
                }
                check_secs(&format!("rule {}: period_secs", rule.id), rule.period_secs, false)?;
                for action in &rule.actions {
                    match action {
                        Action::Relay { duration_secs: Some(secs), .. } | Action::Video { duration_secs: secs, .. } => {
                            check_secs(&format!("rule {}: {} duration_secs", rule.id, action.label()), *secs, true)?;
                        }
                        _ => {}
                    }
                    match action {
                        Action::Relay { relay_id, .. } if !relay_ids.contains(relay_id.as_str()) => {
                            return Err(invalid(format!(
                                "rule {}: unknown relay id '{}'",
                                rule.id, relay_id
                            )));
                        }
                        Action::Photo { camera_id } | Action::Video { camera_id, .. }
                            if !camera_ids.contains(camera_id.as_str()) =>
                        {
                            return Err(invalid(format!(
                                "rule {}: unknown camera id '{}'",
                                rule.id, camera_id
                            )));
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            tick_ms = self.polling.tick_ms,
            lock_dir = %self.locks.dir.display(),
            sink = ?self.sink.kind,
            devices = self.devices.len(),
            relays = self.relays.len(),
            cameras = self.cameras.len(),
            "host configuration"
        );
        for device in &self.devices {
            tracing::info!(
                device = %device.id,
                kind = %device.kind,
                period_secs = device.period_secs,
                rules = device.rules.len(),
                "configured device"
            );
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// finite, within `MAX_SECONDS`, and > 0 unless `allow_zero`
fn check_secs(what: &str, secs: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let in_range = secs.is_finite() && secs <= MAX_SECONDS && (secs > 0.0 || (allow_zero && secs == 0.0));
    if in_range {
        Ok(())
    } else if allow_zero {
        Err(invalid(format!("{what} must be between 0 and {MAX_SECONDS}, got {secs}")))
    } else {
        Err(invalid(format!("{what} must be > 0 and at most {MAX_SECONDS}, got {secs}")))
    }
}

fn default_level() -> String { "info".to_string() }
fn default_tick_ms() -> u64 { 100 }
fn default_lock_dir() -> PathBuf { PathBuf::from("/var/lock") }
fn default_lock_timeout() -> f64 { 60.0 }
fn default_lock_poll_ms() -> u64 { 100 }
fn default_true() -> bool { true }
fn default_influx_url() -> String { "http://localhost:8086".to_string() }
fn default_influx_db() -> String { "sensor_host".to_string() }
fn default_sink_timeout() -> u64 { 5 }
fn default_smtp_port() -> u16 { 465 }
fn default_hourly_max() -> u32 { 2 }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }
fn default_photo_command() -> String { "libcamera-still -n -o {output}".to_string() }
fn default_video_command() -> String {
    "libcamera-vid -n -t {duration}000 -o {output}".to_string()
}
fn default_capture_dir() -> PathBuf { PathBuf::from("/tmp/sensor-host") }
fn default_i2c_bus() -> u8 { 1 }
fn default_period() -> f64 { 15.0 }
fn default_gain() -> u8 { 1 }
fn default_bounce_ms() -> u64 { 50 }
fn default_reset_secs() -> f64 { 1.0 }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Direction, Trigger};

    const SAMPLE: &str = r#"
[polling]
tick_ms = 100

[locks]
dir = "/tmp/locks"
timeout_secs = 60

[smtp]
host = "smtp.example.com"
hourly_max = 3

[[relays]]
id = "fan"
gpio_pin = 17

[[devices]]
id = "greenhouse"
kind = "dht22"
location = "4"
period_secs = 60

[[devices.rules]]
id = "too-hot"
period_secs = 60
trigger = { type = "threshold", measurement = "temperature", direction = "above", setpoint = 30.0 }

[[devices.rules.actions]]
type = "relay"
relay_id = "fan"
state = "on"
duration_secs = 30

[[devices.rules.actions]]
type = "email"
recipient = "me@example.com"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = HostConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.devices.len(), 1);
        let device = &config.devices[0];
        assert_eq!(device.period(), Duration::from_secs(60));
        assert_eq!(device.rules.len(), 1);
        let rule = &device.rules[0];
        assert!(rule.activated);
        match &rule.trigger {
            Trigger::Threshold { measurement, direction, setpoint } => {
                assert_eq!(measurement, "temperature");
                assert_eq!(*direction, Direction::Above);
                assert_eq!(*setpoint, 30.0);
            }
            other => panic!("unexpected trigger {other:?}"),
        }
        assert_eq!(rule.actions.len(), 2);
        assert_eq!(config.smtp.hourly_max, 3);
        assert_eq!(config.sink.kind, SinkKind::Memory);
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::from_toml("").unwrap();
        assert_eq!(config.polling.tick_ms, 100);
        assert_eq!(config.locks.timeout_secs, 60.0);
        assert!(config.locks.break_on_timeout);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_rejects_unknown_relay() {
        let broken = SAMPLE.replace("relay_id = \"fan\"", "relay_id = \"pump\"");
        let err = HostConfig::from_toml(&broken).unwrap_err();
        assert!(err.to_string().contains("unknown relay id"));
    }

    #[test]
    fn test_rejects_bad_adc_range() {
        let toml = r#"
[[devices]]
id = "soil"
kind = "ads1x15"
location = "0x48"
[devices.adc]
channel = 0
measurement = "moisture"
volts_min = 3.3
volts_max = 0.0
units_min = 0
units_max = 100
"#;
        assert!(matches!(HostConfig::from_toml(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        let device = |extra: &str| {
            format!(
                "[[relays]]\nid = \"fan\"\ngpio_pin = 17\n\n[[cameras]]\nid = \"cam0\"\n\n[[devices]]\nid = \"gh\"\nkind = \"dht22\"\nlocation = \"4\"\n{extra}\n"
            )
        };
        let rule = |extra: &str| {
            device(&format!(
                "\n[[devices.rules]]\nid = \"hot\"\ntrigger = {{ type = \"threshold\", measurement = \"temperature\", direction = \"above\", setpoint = 30.0 }}\n{extra}"
            ))
        };

        for bad in [
            device("period_secs = 1.8e19"),
            device("period_secs = nan"),
            device("period_secs = inf"),
            device("pre_relay_id = \"fan\"\npre_relay_secs = -1.0"),
            device("pre_relay_id = \"fan\"\npre_relay_secs = inf"),
            device("edge = { edge = \"both\", reset_secs = nan }"),
            rule("period_secs = 0.0"),
            rule("period_secs = 1e12"),
            rule("[[devices.rules.actions]]\ntype = \"relay\"\nrelay_id = \"fan\"\nstate = \"on\"\nduration_secs = inf"),
            rule("[[devices.rules.actions]]\ntype = \"video\"\ncamera_id = \"cam0\"\nduration_secs = -5.0"),
        ] {
            assert!(matches!(HostConfig::from_toml(&bad), Err(ConfigError::Invalid(_))), "accepted:\n{bad}");
        }

        assert!(HostConfig::from_toml(&device("period_secs = 86400.0\npre_relay_id = \"fan\"\npre_relay_secs = 0.0")).is_ok());
    }

    #[test]
    fn test_rejects_non_finite_lock_timeout() {
        let toml = "[locks]\ntimeout_secs = inf\n";
        assert!(matches!(HostConfig::from_toml(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_kind_is_not_a_config_error() {
        // unknown kinds are rejected when the controller is built, not when parsing
        let toml = "[[devices]]\nid = \"x\"\nkind = \"flux-capacitor\"\n";
        assert!(HostConfig::from_toml(toml).is_ok());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x70").unwrap(), 0x70);
        assert_eq!(parse_address("48").unwrap(), 0x48);
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_pre_relay_requires_duration() {
        let mut device = HostConfig::from_toml(SAMPLE).unwrap().devices.remove(0);
        device.pre_relay_id = Some("fan".into());
        assert!(device.pre_relay().is_none());
        device.pre_relay_secs = 2.5;
        assert_eq!(device.pre_relay(), Some(("fan", Duration::from_millis(2500))));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = HostConfig::from_toml(include_str!("../config/host.toml")).unwrap();
        assert_eq!(config.devices.len(), 4);
        assert_eq!(config.sink.kind, SinkKind::Influx);
        let soil = &config.devices[1];
        assert_eq!(soil.pre_relay(), Some(("probe-power", Duration::from_secs(2))));
        assert_eq!(soil.multiplexer.as_ref().map(|m| m.bus), Some(1));
    }
}
