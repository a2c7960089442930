//! SCPI vocabulary understood by DCP405 modules in an EEZ BB3 chassis.

use crate::channel::ChannelId;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SelectChannel(ChannelId),
    MeasureVoltage,
    MeasureCurrent,
    QueryOutput,
    QueryVoltageProtectionTripped,
    QueryCurrentProtectionTripped,
    QueryModel,
    SetVoltage(f64),
    SetCurrent(f64),
    SetOutput(bool),
    ClearProtection,
    SetVoltageProtectionState(bool),
}

impl Command {
    /// Parse a single SCPI line back into a command.
    ///
    /// Accepts the forms produced by `Display` plus their long spellings, which
    /// is what the simulated instrument needs.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (header, arg) = match line.split_once(char::is_whitespace) {
            Some((h, a)) => (h, Some(a.trim())),
            None => (line, None),
        };
        let header = header.to_ascii_uppercase();
        let flag = |a: Option<&str>| match a.map(str::to_ascii_uppercase).as_deref() {
            Some("1") | Some("ON") => Some(true),
            Some("0") | Some("OFF") => Some(false),
            _ => None,
        };
        let number = |a: Option<&str>| a.and_then(|v| v.parse::<f64>().ok());

        match header.as_str() {
            "INST:NSEL" | "INSTRUMENT:NSELECT" => arg
                .and_then(|a| a.parse::<u8>().ok())
                .and_then(ChannelId::from_number)
                .map(Self::SelectChannel),
            "MEAS:VOLT?" | "MEASURE:VOLTAGE?" => Some(Self::MeasureVoltage),
            "MEAS:CURR?" | "MEASURE:CURRENT?" => Some(Self::MeasureCurrent),
            "OUTP?" | "OUTPUT?" => Some(Self::QueryOutput),
            "VOLT:PROT:TRIP?" | "VOLTAGE:PROTECTION:TRIPPED?" => {
                Some(Self::QueryVoltageProtectionTripped)
            }
            "CURR:PROT:TRIP?" | "CURRENT:PROTECTION:TRIPPED?" => {
                Some(Self::QueryCurrentProtectionTripped)
            }
            "SYST:CHAN:MOD?" | "SYSTEM:CHANNEL:MODEL?" => Some(Self::QueryModel),
            "VOLT" | "VOLTAGE" => number(arg).map(Self::SetVoltage),
            "CURR" | "CURRENT" => number(arg).map(Self::SetCurrent),
            "OUTP" | "OUTPUT" => flag(arg).map(Self::SetOutput),
            "OUTP:PROT:CLE" | "OUTPUT:PROTECTION:CLEAR" => Some(Self::ClearProtection),
            "VOLT:PROT:STAT" | "VOLTAGE:PROTECTION:STATE" => {
                flag(arg).map(Self::SetVoltageProtectionState)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |b: bool| if b { 1 } else { 0 };
        match self {
            Self::SelectChannel(ch) => write!(f, "INST:NSEL {}", ch.number()),
            Self::MeasureVoltage => f.write_str("MEAS:VOLT?"),
            Self::MeasureCurrent => f.write_str("MEAS:CURR?"),
            Self::QueryOutput => f.write_str("OUTP?"),
            Self::QueryVoltageProtectionTripped => f.write_str("VOLT:PROT:TRIP?"),
            Self::QueryCurrentProtectionTripped => f.write_str("CURR:PROT:TRIP?"),
            Self::QueryModel => f.write_str("SYST:CHAN:MOD?"),
            Self::SetVoltage(v) => write!(f, "VOLT {v:.3}"),
            Self::SetCurrent(i) => write!(f, "CURR {i:.3}"),
            Self::SetOutput(on) => write!(f, "OUTP {}", on_off(*on)),
            Self::ClearProtection => f.write_str("OUTP:PROT:CLE"),
            Self::SetVoltageProtectionState(on) => write!(f, "VOLT:PROT:STAT {}", on_off(*on)),
        }
    }
}
