use follower_core::{tags, StatusSnapshot};
use serde::{Deserialize, Serialize};

pub const STATUS_TAGS: &[tags::Tag] = tags::STATUS_TAGS;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// A missing version deserializes as 0.0 and is treated as v1.
    pub fn is_supported(&self) -> bool {
        self.major == 1 || (self.major == 0 && self.minor == 0)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub cycle_count: u64,
    pub loop_state: &'static str,
    pub fault_state: &'static str,
    pub source_voltage: f64,
    pub follower_voltage: f64,
    pub follower_current: f64,
    pub follower_output_enabled: bool,
    pub commanded_voltage: Option<f64>,
    pub commanded_current: Option<f64>,
    pub consecutive_fault_count: u32,
    pub recovery_in_progress: bool,
    pub recoveries_attempted: u32,
}

impl StatusMsg {
    pub fn from_snapshot(snapshot: &StatusSnapshot, sequence: u64, unix_us: u64) -> Self {
        Self {
            msg_type: "status",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            timestamp_us: snapshot.timestamp_us,
            unix_us,
            cycle_count: snapshot.cycle_count,
            loop_state: snapshot.loop_state.as_str(),
            fault_state: snapshot.fault_state.as_str(),
            source_voltage: snapshot.source_voltage,
            follower_voltage: snapshot.follower_voltage,
            follower_current: snapshot.follower_current,
            follower_output_enabled: snapshot.follower_output_enabled,
            commanded_voltage: snapshot.commanded_voltage,
            commanded_current: snapshot.commanded_current,
            consecutive_fault_count: snapshot.consecutive_fault_count,
            recovery_in_progress: snapshot.recovery_in_progress,
            recoveries_attempted: snapshot.recoveries_attempted,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Stop(StopMsg),
}

impl IncomingMessage {
    /// Returns `None` for anything that is not a well-formed, known message.
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "hello" => serde_json::from_value(value).ok().map(IncomingMessage::Hello),
            "stop" => serde_json::from_value(value).ok().map(IncomingMessage::Stop),
            _ => None,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::Hello(hello) => hello.protocol_version,
            Self::Stop(stop) => stop.protocol_version,
        }
    }
}
