use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

/// Voltage/current pair for one output channel. Only a `Setpoint<Validated>`
/// can be turned into instrument commands.
#[derive(Debug, Clone, Copy)]
pub struct Setpoint<State = Unvalidated> {
    voltage: f64,
    current: f64,
    _state: PhantomData<State>,
}

/// Electrical range of a DCP405 output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub min_current: f64,
    pub max_current: f64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            min_voltage: 0.0,
            max_voltage: 40.0,
            min_current: 0.05,
            max_current: 5.0,
        }
    }
}

impl OutputLimits {
    pub fn clamp_voltage(&self, volts: f64) -> f64 {
        volts.clamp(self.min_voltage, self.max_voltage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetpointViolation {
    NonFinite { voltage: f64, current: f64 },
    VoltageAboveLimit { requested: f64, limit: f64 },
    VoltageBelowLimit { requested: f64, limit: f64 },
    CurrentAboveLimit { requested: f64, limit: f64 },
    CurrentBelowLimit { requested: f64, limit: f64 },
}

impl Setpoint<Unvalidated> {
    pub fn new(voltage: f64, current: f64) -> Self {
        Self {
            voltage,
            current,
            _state: PhantomData,
        }
    }

    pub fn validate(self, limits: &OutputLimits) -> Result<Setpoint<Validated>, SetpointViolation> {
        if !self.voltage.is_finite() || !self.current.is_finite() {
            return Err(SetpointViolation::NonFinite {
                voltage: self.voltage,
                current: self.current,
            });
        }

        if self.voltage > limits.max_voltage {
            return Err(SetpointViolation::VoltageAboveLimit {
                requested: self.voltage,
                limit: limits.max_voltage,
            });
        }
        if self.voltage < limits.min_voltage {
            return Err(SetpointViolation::VoltageBelowLimit {
                requested: self.voltage,
                limit: limits.min_voltage,
            });
        }

        if self.current > limits.max_current {
            return Err(SetpointViolation::CurrentAboveLimit {
                requested: self.current,
                limit: limits.max_current,
            });
        }
        if self.current < limits.min_current {
            return Err(SetpointViolation::CurrentBelowLimit {
                requested: self.current,
                limit: limits.min_current,
            });
        }

        Ok(Setpoint {
            voltage: self.voltage,
            current: self.current,
            _state: PhantomData,
        })
    }
}

impl Setpoint<Validated> {
    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn current(&self) -> f64 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nan_voltage() {
        let res = Setpoint::new(f64::NAN, 0.1).validate(&OutputLimits::default());
        assert!(matches!(res, Err(SetpointViolation::NonFinite { .. })));
    }

    #[test]
    fn rejects_current_below_minimum() {
        let res = Setpoint::new(5.0, 0.01).validate(&OutputLimits::default());
        assert!(matches!(
            res,
            Err(SetpointViolation::CurrentBelowLimit { .. })
        ));
    }

    #[test]
    fn accepts_full_scale() {
        let res = Setpoint::new(40.0, 5.0).validate(&OutputLimits::default());
        assert!(res.is_ok());
    }

    #[test]
    fn clamps_into_output_range() {
        let limits = OutputLimits::default();
        assert_eq!(limits.clamp_voltage(-3.0), 0.0);
        assert_eq!(limits.clamp_voltage(55.0), 40.0);
        assert_eq!(limits.clamp_voltage(12.5), 12.5);
    }
}
