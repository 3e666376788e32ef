//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the hardware the sensor drivers touch
//!     (I2C multiplexer + converter, GPIO levels and edges, DHT22, CPU temp).
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using the scriptable mock).
//!
//! design philosophy:
//!     - "Compile Anywhere": the host builds and tests on any Linux/Mac box.
//!     - "Blocking by contract": every call may block; async callers wrap them
//!       in `spawn_blocking`.
//!     - bus exclusivity is NOT handled here. callers hold the matching
//!       `lock::LockGuard` for the whole transaction.
//!
//! relationships:
//!     - used by: sensor.rs (drivers), actions.rs (gpio relays), edge.rs
//!     - uses: rppal (on feature="hardware")
//!     - uses: std::process::Command (python DHT22 helper until ported)
//!
//! ==============================================================================

use crate::config::EdgePolicy;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// receives the pin level sampled right after each accepted transition
pub type EdgeReceiver = mpsc::UnboundedReceiver<bool>;

pub trait HardwareProvider: Send + Sync {
    /// route the i2c multiplexer at `address` to `channel`
    fn select_mux_channel(&self, bus: u8, address: u8, channel: u8) -> Result<()>;
    /// single-shot conversion on an analog converter channel, in volts
    fn read_adc_voltage(&self, bus: u8, address: u8, channel: u8, gain: u8) -> Result<f64>;
    fn read_gpio(&self, pin: u8) -> Result<bool>;
    fn write_gpio(&self, pin: u8, level: bool) -> Result<()>;
    /// register an interrupt on `pin`. transitions arrive on the returned channel.
    fn watch_edges(&self, pin: u8, edge: EdgePolicy, bounce: Duration) -> Result<EdgeReceiver>;
    fn unwatch_edges(&self, pin: u8) -> Result<()>;
    /// (temperature C, relative humidity %)
    fn read_dht22(&self, pin: u8) -> Result<(f32, f32)>;
    fn get_cpu_temp(&self) -> Result<f32>;
}

/// the provider for the current build: rppal with `hardware`, mock otherwise
pub fn default_provider() -> Arc<dyn HardwareProvider> {
    #[cfg(feature = "hardware")]
    {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        Arc::new(rpi::RpiHal::new())
    }
    #[cfg(not(feature = "hardware"))]
    {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Arc::new(MockHal::new())
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Builds and Tests)
// ==============================================================================================

#[derive(Default)]
struct MockState {
    voltages: VecDeque<Option<f64>>,
    default_voltage: Option<f64>,
    dht22: VecDeque<Option<(f32, f32)>>,
    default_dht22: Option<(f32, f32)>,
    levels: HashMap<u8, bool>,
    writes: Vec<(u8, bool)>,
    mux_selects: Vec<(u8, u8, u8)>,
    edge_senders: HashMap<u8, mpsc::UnboundedSender<bool>>,
    cpu_temp: f32,
}

/// scriptable stand-in for the pi. queued readings are consumed first, then
/// the defaults apply; `None` in a queue or default means "read failed".
pub struct MockHal {
    state: Mutex<MockState>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                default_voltage: Some(1.65),
                default_dht22: Some((25.0, 50.0)),
                cpu_temp: 45.0,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_voltage(&self, reading: Option<f64>) {
        self.state().voltages.push_back(reading);
    }

    pub fn set_default_voltage(&self, reading: Option<f64>) {
        self.state().default_voltage = reading;
    }

    pub fn push_dht22(&self, reading: Option<(f32, f32)>) {
        self.state().dht22.push_back(reading);
    }

    pub fn set_default_dht22(&self, reading: Option<(f32, f32)>) {
        self.state().default_dht22 = reading;
    }

    pub fn set_level(&self, pin: u8, level: bool) {
        self.state().levels.insert(pin, level);
    }

    /// simulate a transition on a watched pin. returns false when nobody listens.
    pub fn inject_edge(&self, pin: u8, level: bool) -> bool {
        let mut state = self.state();
        state.levels.insert(pin, level);
        match state.edge_senders.get(&pin) {
            Some(tx) => tx.send(level).is_ok(),
            None => false,
        }
    }

    pub fn is_watching(&self, pin: u8) -> bool {
        self.state().edge_senders.contains_key(&pin)
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.state().writes.clone()
    }

    pub fn mux_selects(&self) -> Vec<(u8, u8, u8)> {
        self.state().mux_selects.clone()
    }
}

impl HardwareProvider for MockHal {
    fn select_mux_channel(&self, bus: u8, address: u8, channel: u8) -> Result<()> {
        tracing::debug!("[MOCK I2C] bus {} mux 0x{:02X} -> channel {}", bus, address, channel);
        self.state().mux_selects.push((bus, address, channel));
        Ok(())
    }

    fn read_adc_voltage(&self, bus: u8, address: u8, channel: u8, _gain: u8) -> Result<f64> {
        let mut state = self.state();
        let reading = match state.voltages.pop_front() {
            Some(queued) => queued,
            None => state.default_voltage,
        };
        tracing::debug!(
            "[MOCK ADC] bus {} 0x{:02X} ch {} -> {:?}",
            bus, address, channel, reading
        );
        reading.ok_or_else(|| anyhow::anyhow!("mock adc read failed"))
    }

    fn read_gpio(&self, pin: u8) -> Result<bool> {
        Ok(self.state().levels.get(&pin).copied().unwrap_or(false))
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} write {}", pin, level);
        let mut state = self.state();
        state.levels.insert(pin, level);
        state.writes.push((pin, level));
        Ok(())
    }

    fn watch_edges(&self, pin: u8, edge: EdgePolicy, bounce: Duration) -> Result<EdgeReceiver> {
        tracing::debug!("[MOCK GPIO] Pin {} watching {:?} edges (bounce {:?})", pin, edge, bounce);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().edge_senders.insert(pin, tx);
        Ok(rx)
    }

    fn unwatch_edges(&self, pin: u8) -> Result<()> {
        self.state().edge_senders.remove(&pin);
        Ok(())
    }

    fn read_dht22(&self, pin: u8) -> Result<(f32, f32)> {
        let mut state = self.state();
        let reading = match state.dht22.pop_front() {
            Some(queued) => queued,
            None => state.default_dht22,
        };
        tracing::debug!("[MOCK DHT22] Reading pin {} -> {:?}", pin, reading);
        reading.ok_or_else(|| anyhow::anyhow!("Sensor returned null"))
    }

    fn get_cpu_temp(&self) -> Result<f32> {
        Ok(self.state().cpu_temp)
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
mod rpi {
    use super::{EdgeReceiver, HardwareProvider};
    use crate::config::EdgePolicy;
    use anyhow::{anyhow, Result};
    use rppal::gpio::{Gpio, InputPin, Level, Trigger};
    use rppal::i2c::I2c;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    // ADS1115 registers
    const REG_CONVERSION: u8 = 0x00;
    const REG_CONFIG: u8 = 0x01;

    pub struct RpiHal {
        // interrupt pins must stay alive for their callbacks to fire
        watched: Mutex<HashMap<u8, InputPin>>,
    }

    impl RpiHal {
        pub fn new() -> Self {
            Self { watched: Mutex::new(HashMap::new()) }
        }
    }

    /// (PGA bits, full scale volts) for the adafruit style gain numbers
    fn pga(gain: u8) -> (u16, f64) {
        match gain {
            1 => (0b001, 4.096),
            2 => (0b010, 2.048),
            4 => (0b011, 1.024),
            8 => (0b100, 0.512),
            16 => (0b101, 0.256),
            _ => (0b000, 6.144),
        }
    }

    impl HardwareProvider for RpiHal {
        fn select_mux_channel(&self, bus: u8, address: u8, channel: u8) -> Result<()> {
            let mut i2c = I2c::with_bus(bus)?;
            i2c.set_slave_address(address as u16)?;
            i2c.write(&[1u8 << channel])?;
            Ok(())
        }

        fn read_adc_voltage(&self, bus: u8, address: u8, channel: u8, gain: u8) -> Result<f64> {
            if channel > 3 {
                return Err(anyhow!("ads1x15 has no channel {}", channel));
            }
            let (pga_bits, full_scale) = pga(gain);
            let config: u16 = (1 << 15)                      // start single conversion
                | ((0b100 | channel as u16) << 12)           // single-ended AINx
                | (pga_bits << 9)
                | (1 << 8)                                   // single-shot mode
                | (0b100 << 5)                               // 128 SPS
                | 0b11; // comparator off

            let mut i2c = I2c::with_bus(bus)?;
            i2c.set_slave_address(address as u16)?;
            i2c.write(&[REG_CONFIG, (config >> 8) as u8, config as u8])?;
            std::thread::sleep(Duration::from_millis(9));
            i2c.write(&[REG_CONVERSION])?;
            let mut buf = [0u8; 2];
            i2c.read(&mut buf)?;
            let raw = i16::from_be_bytes(buf);
            Ok(raw as f64 * full_scale / 32768.0)
        }

        fn read_gpio(&self, pin: u8) -> Result<bool> {
            // a watched pin is owned by its interrupt handle; Gpio::get would fail with PinUsed
            let watched = self
                .watched
                .lock()
                .map_err(|_| anyhow!("edge registry poisoned"))?
                .get(&pin)
                .map(|input| input.read());
            let level = match watched {
                Some(level) => level,
                None => Gpio::new()?.get(pin)?.into_input().read(),
            };
            Ok(level == Level::High)
        }

        fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
            let gpio = Gpio::new()?;
            let mut p = gpio.get(pin)?.into_output();
            // keep the level after the handle drops, otherwise relays flip back
            p.set_reset_on_drop(false);
            if level { p.set_high(); } else { p.set_low(); }
            Ok(())
        }

        fn watch_edges(&self, pin: u8, edge: EdgePolicy, bounce: Duration) -> Result<EdgeReceiver> {
            let trigger = match edge {
                EdgePolicy::Rising => Trigger::RisingEdge,
                EdgePolicy::Falling => Trigger::FallingEdge,
                EdgePolicy::Both => Trigger::Both,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let mut input = Gpio::new()?.get(pin)?.into_input();
            input.set_async_interrupt(trigger, Some(bounce), move |event| {
                let _ = tx.send(event.trigger == Trigger::RisingEdge);
            })?;
            self.watched
                .lock()
                .map_err(|_| anyhow!("edge registry poisoned"))?
                .insert(pin, input);
            Ok(rx)
        }

        fn unwatch_edges(&self, pin: u8) -> Result<()> {
            let removed = self
                .watched
                .lock()
                .map_err(|_| anyhow!("edge registry poisoned"))?
                .remove(&pin);
            if let Some(mut input) = removed {
                input.clear_async_interrupt()?;
            }
            Ok(())
        }

        fn read_dht22(&self, pin: u8) -> Result<(f32, f32)> {
            // DHT22 needs microsecond bit-banging; the adafruit helper handles
            // retries and timing compensation better than userspace rust can.
            use std::process::Command;
            let script = format!(
                r#"
import adafruit_dht, board, json, sys
try:
    dht = adafruit_dht.DHT22(board.D{})
    try:
        t, h = dht.temperature, dht.humidity
        print(json.dumps({{"t": t, "h": h}}) if t is not None and h is not None else "null")
    finally:
        dht.exit()
except Exception as e:
    print(str(e), file=sys.stderr)
    sys.exit(1)
"#,
                pin
            );
            let output = Command::new("python3").args(["-c", &script]).output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("Python error: {}", stderr.trim());
            }
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout == "null" || stdout.is_empty() {
                anyhow::bail!("Sensor returned null");
            }
            let v: serde_json::Value = serde_json::from_str(&stdout)?;
            let temp = v["t"].as_f64().ok_or_else(|| anyhow!("Missing temp"))?;
            let humidity = v["h"].as_f64().ok_or_else(|| anyhow!("Missing humidity"))?;
            Ok((temp as f32, humidity as f32))
        }

        fn get_cpu_temp(&self) -> Result<f32> {
            // millidegrees celsius, e.g. 45000 = 45.0C
            let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp")?;
            Ok(raw.trim().parse::<f32>()? / 1000.0)
        }
    }
}
