//! analog voltage -> unit conversion for converter-backed sensors.
//!
//! the raw voltage is clamped into the calibrated span, mapped linearly
//! (optionally inverted) onto the unit span, and the result clamped again so
//! the output never leaves `[units_min, units_max]`.

/// calibration of one analog channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogConversion {
    pub volts_min: f64,
    pub volts_max: f64,
    pub units_min: f64,
    pub units_max: f64,
    /// higher voltage means a lower unit value (e.g. capacitive soil probes)
    pub inverse: bool,
}

impl AnalogConversion {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.volts_max > self.volts_min) {
            return Err(format!(
                "volts_max ({}) must be greater than volts_min ({})",
                self.volts_max, self.volts_min
            ));
        }
        if !(self.units_max >= self.units_min) {
            return Err(format!(
                "units_max ({}) must not be below units_min ({})",
                self.units_max, self.units_min
            ));
        }
        Ok(())
    }

    pub fn convert(&self, raw_volts: f64) -> f64 {
        let clamped = raw_volts.clamp(self.volts_min, self.volts_max);
        let percent = (clamped - self.volts_min) / (self.volts_max - self.volts_min);
        let span = self.units_max - self.units_min;
        let unit = if self.inverse {
            self.units_max - percent * span
        } else {
            self.units_min + percent * span
        };
        unit.clamp(self.units_min, self.units_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn soil() -> AnalogConversion {
        AnalogConversion {
            volts_min: 0.5,
            volts_max: 2.5,
            units_min: 0.0,
            units_max: 100.0,
            inverse: false,
        }
    }

    #[test]
    fn test_linear_midpoint() {
        assert!((soil().convert(1.5) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_scale() {
        let conv = AnalogConversion { inverse: true, ..soil() };
        assert!((conv.convert(0.5) - 100.0).abs() < 1e-9);
        assert!((conv.convert(2.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamps_out_of_range_voltage() {
        assert_eq!(soil().convert(-3.0), 0.0);
        assert_eq!(soil().convert(12.0), 100.0);
    }

    #[test]
    fn test_validate() {
        assert!(soil().validate().is_ok());
        let flat = AnalogConversion { volts_max: 0.5, ..soil() };
        assert!(flat.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_output_within_unit_span(
            volts in -1.0e6f64..1.0e6,
            vmin in -10.0f64..10.0,
            vspan in 0.001f64..20.0,
            umin in -1000.0f64..1000.0,
            uspan in 0.0f64..2000.0,
            inverse in any::<bool>(),
        ) {
            let conv = AnalogConversion {
                volts_min: vmin,
                volts_max: vmin + vspan,
                units_min: umin,
                units_max: umin + uspan,
                inverse,
            };
            let unit = conv.convert(volts);
            prop_assert!(unit >= conv.units_min && unit <= conv.units_max);
            // clamping is idempotent: converting an extreme twice lands on the same bound
            prop_assert_eq!(conv.convert(volts.max(conv.volts_max)), conv.convert(conv.volts_max));
        }
    }
}
