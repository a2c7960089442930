use crate::channel::ChannelReading;
use crate::controller::ControllerState;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    #[default]
    Healthy,
    ProtectionTripped,
    Disconnected,
}

impl FaultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::ProtectionTripped => "protection_tripped",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::ProtectionTripped => 1.0,
            Self::Disconnected => 2.0,
        }
    }
}

/// Classify the follower channel for this cycle.
///
/// A latched protection flag wins over `output_enabled`: the firmware keeps
/// reporting the output as on while protection holds it off. A trip only
/// counts once the controller has commanded the output on, so a channel that
/// was never enabled is not a fault.
pub fn classify(
    reading: Result<&ChannelReading, &TransportError>,
    state: &ControllerState,
) -> FaultState {
    match reading {
        Err(_) => FaultState::Disconnected,
        Ok(reading) if reading.protection_tripped && state.output_commanded() => {
            FaultState::ProtectionTripped
        }
        Ok(_) => FaultState::Healthy,
    }
}
