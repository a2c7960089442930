use serde::{Deserialize, Serialize};
use std::fmt;

/// One output of the power supply. Channel 1 is the measured source,
/// channel 2 the follower output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    Source,
    Follower,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::Source, ChannelId::Follower];

    /// Instrument channel number as used by `INST:NSEL`.
    pub fn number(self) -> u8 {
        match self {
            Self::Source => 1,
            Self::Follower => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Source),
            2 => Some(Self::Follower),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.number())
    }
}

/// State of one channel sampled during a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    pub channel: ChannelId,
    pub measured_voltage: f64,
    pub measured_current: f64,
    pub output_enabled: bool,
    pub protection_tripped: bool,
    /// Monotonic microseconds since loop start.
    pub timestamp_us: u64,
}
