//! Channel state queries and reply parsing.
//!
//! The reader never retries: a timeout or a malformed reply is returned to
//! the caller, which owns the retry policy.

use crate::channel::{ChannelId, ChannelReading};
use crate::commands::Command;
use crate::error::TransportError;
use crate::setpoint::OutputLimits;
use crate::transport::Session;

/// Slack allowed around the output range before a measurement is considered garbage.
pub const READ_MARGIN_V: f64 = 0.5;
pub const READ_MARGIN_A: f64 = 0.05;

pub struct ChannelReader<'a, S: Session + ?Sized> {
    session: &'a mut S,
    limits: OutputLimits,
}

impl<'a, S: Session + ?Sized> ChannelReader<'a, S> {
    pub fn new(session: &'a mut S, limits: OutputLimits) -> Self {
        Self { session, limits }
    }

    pub fn read(&mut self, channel: ChannelId, timestamp_us: u64) -> Result<ChannelReading, TransportError> {
        self.session.send(&Command::SelectChannel(channel))?;

        let measured_voltage = self.query_number(Command::MeasureVoltage)?;
        check_range(
            Command::MeasureVoltage,
            measured_voltage,
            -READ_MARGIN_V,
            self.limits.max_voltage * 1.05 + READ_MARGIN_V,
        )?;
        let measured_current = self.query_number(Command::MeasureCurrent)?;
        check_range(
            Command::MeasureCurrent,
            measured_current,
            -READ_MARGIN_A,
            self.limits.max_current * 1.05 + READ_MARGIN_A,
        )?;

        let output_enabled = self.query_flag(Command::QueryOutput)?;
        let ovp_tripped = self.query_flag(Command::QueryVoltageProtectionTripped)?;
        let ocp_tripped = self.query_flag(Command::QueryCurrentProtectionTripped)?;

        Ok(ChannelReading {
            channel,
            measured_voltage,
            measured_current,
            output_enabled,
            protection_tripped: ovp_tripped || ocp_tripped,
            timestamp_us,
        })
    }

    /// Module model string reported by a channel.
    pub fn model(&mut self, channel: ChannelId) -> Result<String, TransportError> {
        self.session.send(&Command::SelectChannel(channel))?;
        let reply = self.session.query_command(&Command::QueryModel)?;
        Ok(reply.trim().trim_matches('"').to_string())
    }

    fn query_number(&mut self, command: Command) -> Result<f64, TransportError> {
        let reply = self.session.query_command(&command)?;
        parse_number(&command, &reply)
    }

    fn query_flag(&mut self, command: Command) -> Result<bool, TransportError> {
        let reply = self.session.query_command(&command)?;
        parse_flag(&command, &reply)
    }
}

pub fn parse_number(command: &Command, reply: &str) -> Result<f64, TransportError> {
    match reply.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(TransportError::malformed(command.to_string(), reply)),
    }
}

pub fn parse_flag(command: &Command, reply: &str) -> Result<bool, TransportError> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(TransportError::malformed(command.to_string(), reply)),
    }
}

fn check_range(command: Command, value: f64, min: f64, max: f64) -> Result<(), TransportError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(TransportError::malformed(command.to_string(), value.to_string()))
    }
}
