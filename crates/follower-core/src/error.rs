//! Error taxonomy for the follower loop.
//!
//! Transport failures are retried locally and then escalate to the
//! `Disconnected` fault state. Protection faults are handled by the recovery
//! policy. Only [`FatalAbort`] terminates a run.

use crate::channel::ChannelId;
use crate::controller::ControllerState;
use crate::scheduler::LoopStats;
use crate::setpoint::SetpointViolation;
use std::fmt;
use thiserror::Error;

/// I/O-level failure talking to the instrument.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("no reply to `{command}` within timeout")]
    Timeout { command: String },
    #[error("malformed reply to `{command}`: {reply:?}")]
    Malformed { command: String, reply: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

impl TransportError {
    pub fn malformed(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::Malformed {
            command: command.into(),
            reply: reply.into(),
        }
    }
}

/// Device-level fault: channel protection latched while output was commanded on.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("{channel} protection tripped (occurrence {occurrence}) holding {setpoint_voltage:.3} V")]
pub struct ProtectionFault {
    pub channel: ChannelId,
    pub occurrence: u32,
    pub setpoint_voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sample interval must be positive, got {0} s")]
    NonPositiveInterval(f64),
    #[error("sample interval {0} s is too large")]
    IntervalTooLarge(f64),
    #[error("setpoint tolerance must be non-negative, got {0} V")]
    NegativeTolerance(f64),
    #[error("max slew rate must be positive, got {0} V/s")]
    NonPositiveSlewRate(f64),
    #[error("target current {current} A outside [{min}, {max}] A")]
    CurrentOutOfRange { current: f64, min: f64, max: f64 },
    #[error("voltage offset {offset} V exceeds the {max} V output range")]
    OffsetOutOfRange { offset: f64, max: f64 },
    #[error("invalid output limits: {0}")]
    InvalidLimits(String),
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn follower thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a run terminated abnormally.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    RecoveryLimitExceeded { attempts: u32 },
    DisconnectLimitExceeded { cycles: u32 },
    InvalidSetpoint(SetpointViolation),
    IncompatibleModule { channel: ChannelId, model: String },
    InvalidConfig(ConfigError),
    Startup(TransportError),
    LoopPanicked,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecoveryLimitExceeded { attempts } => write!(
                f,
                "protection kept tripping after {attempts} recovery attempts"
            ),
            Self::DisconnectLimitExceeded { cycles } => {
                write!(f, "instrument unreachable for {cycles} consecutive cycles")
            }
            Self::InvalidSetpoint(violation) => write!(f, "invalid setpoint: {violation:?}"),
            Self::IncompatibleModule { channel, model } => {
                write!(f, "{channel} reports incompatible module {model:?}")
            }
            Self::InvalidConfig(err) => write!(f, "invalid configuration: {err}"),
            Self::Startup(err) => write!(f, "startup failed: {err}"),
            Self::LoopPanicked => write!(f, "control loop thread panicked"),
        }
    }
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecoveryLimitExceeded { .. } => "recovery_limit_exceeded",
            Self::DisconnectLimitExceeded { .. } => "disconnect_limit_exceeded",
            Self::InvalidSetpoint(_) => "invalid_setpoint",
            Self::IncompatibleModule { .. } => "incompatible_module",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Startup(_) => "startup",
            Self::LoopPanicked => "loop_panicked",
        }
    }
}

/// Terminal failure, carrying the controller state at the moment of abort.
#[derive(Debug, Clone, Error)]
#[error("follower aborted after {} cycles: {reason}", .stats.cycles_executed)]
pub struct FatalAbort {
    pub reason: AbortReason,
    pub state: ControllerState,
    pub stats: LoopStats,
}
