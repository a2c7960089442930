use crate::error::ConfigError;
use crate::setpoint::OutputLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parameters of one follower run. Read-only while the loop is running;
/// changing any field means restarting the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Current limit applied to the follower output, in amps.
    pub target_current: f64,
    /// Added to the source voltage, in volts.
    pub voltage_offset: f64,
    /// Poll period, in seconds.
    pub sample_interval_s: f64,
    /// Maximum follower voltage change, in volts per second.
    pub max_slew_rate: Option<f64>,
    pub recovery_retry_limit: u32,
    /// Consecutive unreachable cycles tolerated before aborting.
    pub disconnect_limit: u32,
    /// Extra attempts per channel read within one cycle.
    pub transport_retry_limit: u32,
    pub transport_retry_backoff_ms: u64,
    /// Changes smaller than this are not written to the instrument.
    pub setpoint_tolerance: f64,
    pub output_limits: OutputLimits,
    /// Model string both channels must report, e.g. `DCP405`.
    pub expected_model: Option<String>,
    pub disable_ovp_on_start: bool,
    pub disable_output_on_stop: bool,
    /// Emit a status summary every N cycles; 0 disables it.
    pub status_log_every: u32,
    pub max_cycles: Option<u64>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            target_current: 0.1,
            voltage_offset: 0.0,
            sample_interval_s: 0.5,
            max_slew_rate: None,
            recovery_retry_limit: 3,
            disconnect_limit: 5,
            transport_retry_limit: 2,
            transport_retry_backoff_ms: 20,
            setpoint_tolerance: 0.005,
            output_limits: OutputLimits::default(),
            expected_model: Some("DCP405".to_string()),
            disable_ovp_on_start: false,
            disable_output_on_stop: true,
            status_log_every: 10,
            max_cycles: None,
        }
    }
}

impl FollowerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Zero for a negative or NaN interval, saturating for one too large to
    /// represent. `validate` rejects both.
    pub fn sample_interval(&self) -> Duration {
        if !(self.sample_interval_s > 0.0) {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.sample_interval_s).unwrap_or(Duration::MAX)
    }

    pub fn transport_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_retry_backoff_ms)
    }

    /// Largest voltage step allowed in one cycle, if slew limiting is on.
    pub fn max_step_per_cycle(&self) -> Option<f64> {
        self.max_slew_rate.map(|rate| rate * self.sample_interval_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.output_limits;
        if !(limits.min_voltage < limits.max_voltage) || !(limits.min_current <= limits.max_current) {
            return Err(ConfigError::InvalidLimits(format!("{limits:?}")));
        }
        if !(self.sample_interval_s > 0.0) {
            return Err(ConfigError::NonPositiveInterval(self.sample_interval_s));
        }
        if Duration::try_from_secs_f64(self.sample_interval_s).is_err() {
            return Err(ConfigError::IntervalTooLarge(self.sample_interval_s));
        }
        if !(self.setpoint_tolerance >= 0.0) {
            return Err(ConfigError::NegativeTolerance(self.setpoint_tolerance));
        }
        if let Some(rate) = self.max_slew_rate {
            if !(rate > 0.0) {
                return Err(ConfigError::NonPositiveSlewRate(rate));
            }
        }
        if !(limits.min_current..=limits.max_current).contains(&self.target_current) {
            return Err(ConfigError::CurrentOutOfRange {
                current: self.target_current,
                min: limits.min_current,
                max: limits.max_current,
            });
        }
        if !self.voltage_offset.is_finite() || self.voltage_offset.abs() > limits.max_voltage {
            return Err(ConfigError::OffsetOutOfRange {
                offset: self.voltage_offset,
                max: limits.max_voltage,
            });
        }
        Ok(())
    }
}
