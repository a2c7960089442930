use crate::channel::ChannelId;
use crate::commands::Command;
use crate::error::TransportError;
use crate::timebase::TimeBase;
use crate::transport::{Connector, Session};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Voltage presented to the source channel's sense input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceProfile {
    Steady(f64),
    Triangle { min: f64, max: f64, period_s: f64 },
}

impl SourceProfile {
    pub fn voltage_at(&self, t_s: f64) -> f64 {
        match *self {
            Self::Steady(v) => v,
            Self::Triangle { min, max, period_s } => {
                if period_s <= 0.0 {
                    return min;
                }
                let phase = (t_s / period_s).fract();
                let ramp = if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 };
                min + (max - min) * ramp
            }
        }
    }
}

/// Observable state of one simulated output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOutput {
    pub set_voltage: f64,
    pub set_current: f64,
    pub output_enabled: bool,
    pub ovp_enabled: bool,
    pub ovp_tripped: bool,
    pub ocp_tripped: bool,
}

#[derive(Debug, Clone)]
struct SimChannel {
    model: String,
    output: SimOutput,
    ovp_level: f64,
}

impl SimChannel {
    fn new(ovp_level: f64) -> Self {
        Self {
            model: "DCP405".to_string(),
            output: SimOutput {
                set_voltage: 0.0,
                set_current: 0.0,
                output_enabled: false,
                ovp_enabled: true,
                ovp_tripped: false,
                ocp_tripped: false,
            },
            ovp_level,
        }
    }

    fn tripped(&self) -> bool {
        self.output.ovp_tripped || self.output.ocp_tripped
    }

    fn live(&self) -> bool {
        self.output.output_enabled && !self.tripped()
    }

    fn evaluate_protection(&mut self) {
        let out = &mut self.output;
        if out.ovp_enabled && out.output_enabled && out.set_voltage > self.ovp_level {
            out.ovp_tripped = true;
        }
    }
}

#[derive(Debug)]
struct SimState {
    channels: [SimChannel; 2],
    selected: ChannelId,
    source: SourceProfile,
    load_ohms: f64,
    reports_running_when_tripped: bool,
    connected: bool,
    fail_next: u32,
    trip_at_follower_poll: Option<u64>,
    follower_polls: u64,
    transactions: u64,
    writes: Vec<String>,
    timebase: TimeBase,
}

impl SimState {
    fn channel(&self, id: ChannelId) -> &SimChannel {
        &self.channels[usize::from(id.number() - 1)]
    }

    fn channel_mut(&mut self, id: ChannelId) -> &mut SimChannel {
        &mut self.channels[usize::from(id.number() - 1)]
    }
}

/// In-process stand-in for a BB3 chassis with two DCP405 modules.
///
/// Channel 1 measures an external source described by a [`SourceProfile`].
/// Channel 2 has a latching overvoltage protection and, like the real
/// firmware, keeps answering `OUTP?` with `1` while the latch holds the
/// output off. Clones share the same instrument, so a test can keep a handle
/// while the loop owns another.
#[derive(Debug, Clone)]
pub struct SimulatedSupply {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedSupply {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                channels: [SimChannel::new(40.5), SimChannel::new(40.5)],
                selected: ChannelId::Source,
                source: SourceProfile::Steady(0.0),
                load_ohms: 100.0,
                reports_running_when_tripped: true,
                connected: true,
                fail_next: 0,
                trip_at_follower_poll: None,
                follower_polls: 0,
                transactions: 0,
                writes: Vec::new(),
                timebase: TimeBase::new(),
            })),
        }
    }

    pub fn with_source(self, profile: SourceProfile) -> Self {
        self.set_source(profile);
        self
    }

    /// Overvoltage protection level of the follower channel.
    pub fn with_ovp_level(self, volts: f64) -> Self {
        self.lock().channel_mut(ChannelId::Follower).ovp_level = volts;
        self
    }

    pub fn with_model(self, channel: ChannelId, model: &str) -> Self {
        self.lock().channel_mut(channel).model = model.to_string();
        self
    }

    pub fn with_load_ohms(self, ohms: f64) -> Self {
        self.lock().load_ohms = ohms;
        self
    }

    /// Whether `OUTP?` keeps reporting `1` while protection holds the output off.
    pub fn reports_running_when_tripped(self, enabled: bool) -> Self {
        self.lock().reports_running_when_tripped = enabled;
        self
    }

    pub fn set_source(&self, profile: SourceProfile) {
        self.lock().source = profile;
    }

    /// Latch the follower's overvoltage protection now.
    pub fn trip_follower(&self) {
        self.lock().channel_mut(ChannelId::Follower).output.ovp_tripped = true;
    }

    /// Latch the follower's protection just before its `n`-th voltage measurement.
    pub fn trip_at_follower_poll(&self, n: u64) {
        self.lock().trip_at_follower_poll = Some(n);
    }

    /// Make the next `n` transactions time out.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn output(&self, channel: ChannelId) -> SimOutput {
        self.lock().channel(channel).output
    }

    /// Every non-query command received, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn transactions(&self) -> u64 {
        self.lock().transactions
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_link(state: &mut SimState, command: &str) -> Result<(), TransportError> {
        state.transactions += 1;
        if !state.connected {
            return Err(TransportError::ConnectionLost("simulated link down".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Timeout {
                command: command.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SimulatedSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for SimulatedSupply {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let mut state = self.lock();
        Self::check_link(&mut state, command)?;

        let no_reply = || TransportError::Timeout {
            command: command.to_string(),
        };
        let parsed = Command::parse(command).ok_or_else(no_reply)?;

        let selected = state.selected;
        if parsed == Command::MeasureVoltage && selected == ChannelId::Follower {
            state.follower_polls += 1;
            if state.trip_at_follower_poll == Some(state.follower_polls) {
                let ch = state.channel_mut(ChannelId::Follower);
                if ch.output.output_enabled {
                    ch.output.ovp_tripped = true;
                }
            }
        }

        let t_s = state.timebase.elapsed_s();
        let load_ohms = state.load_ohms;
        let reports_running = state.reports_running_when_tripped;
        let ch = state.channel(selected);
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();

        let reply = match parsed {
            Command::MeasureVoltage => match selected {
                ChannelId::Source => format!("{:.4}", state.source.voltage_at(t_s)),
                ChannelId::Follower if ch.live() => format!("{:.4}", ch.output.set_voltage),
                ChannelId::Follower => "0.0000".to_string(),
            },
            Command::MeasureCurrent => {
                if selected == ChannelId::Follower && ch.live() && load_ohms > 0.0 {
                    format!("{:.4}", (ch.output.set_voltage / load_ohms).min(ch.output.set_current))
                } else {
                    "0.0000".to_string()
                }
            }
            Command::QueryOutput => {
                flag(ch.output.output_enabled && (reports_running || !ch.tripped()))
            }
            Command::QueryVoltageProtectionTripped => flag(ch.output.ovp_tripped),
            Command::QueryCurrentProtectionTripped => flag(ch.output.ocp_tripped),
            Command::QueryModel => format!("\"{}\"", ch.model),
            // Unknown queries and set commands produce no reply on the real instrument.
            _ => return Err(no_reply()),
        };
        Ok(reply)
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check_link(&mut state, command)?;
        state.writes.push(command.to_string());

        let selected = state.selected;
        match Command::parse(command) {
            Some(Command::SelectChannel(ch)) => state.selected = ch,
            Some(Command::SetVoltage(v)) => {
                let ch = state.channel_mut(selected);
                ch.output.set_voltage = v;
                ch.evaluate_protection();
            }
            Some(Command::SetCurrent(i)) => state.channel_mut(selected).output.set_current = i,
            Some(Command::SetOutput(on)) => {
                let ch = state.channel_mut(selected);
                ch.output.output_enabled = on;
                ch.evaluate_protection();
            }
            Some(Command::ClearProtection) => {
                let ch = state.channel_mut(selected);
                ch.output.ovp_tripped = false;
                ch.output.ocp_tripped = false;
                ch.evaluate_protection();
            }
            Some(Command::SetVoltageProtectionState(on)) => {
                state.channel_mut(selected).output.ovp_enabled = on;
            }
            // The instrument queues an error for anything else and carries on.
            _ => {}
        }
        Ok(())
    }
}

impl Connector for SimulatedSupply {
    type Session = SimulatedSupply;

    fn connect(&self, _address: &str) -> Result<Self::Session, TransportError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_profile_spans_range() {
        let p = SourceProfile::Triangle {
            min: 2.0,
            max: 10.0,
            period_s: 4.0,
        };
        assert_eq!(p.voltage_at(0.0), 2.0);
        assert_eq!(p.voltage_at(2.0), 10.0);
        assert_eq!(p.voltage_at(1.0), 6.0);
        assert_eq!(p.voltage_at(4.0), 2.0);
    }

    #[test]
    fn ovp_latch_reports_running() {
        let mut sim = SimulatedSupply::new().with_ovp_level(10.0);
        sim.write("INST:NSEL 2").unwrap();
        sim.write("VOLT 12.000").unwrap();
        sim.write("OUTP 1").unwrap();

        assert_eq!(sim.query("VOLT:PROT:TRIP?").unwrap(), "1");
        assert_eq!(sim.query("OUTP?").unwrap(), "1");
        assert_eq!(sim.query("MEAS:VOLT?").unwrap(), "0.0000");
    }

    #[test]
    fn clear_holds_when_below_level() {
        let mut sim = SimulatedSupply::new();
        sim.write("INST:NSEL 2").unwrap();
        sim.write("VOLT 5.000").unwrap();
        sim.write("OUTP 1").unwrap();
        sim.trip_follower();
        assert_eq!(sim.query("MEAS:VOLT?").unwrap(), "0.0000");

        sim.write("OUTP:PROT:CLE").unwrap();
        assert_eq!(sim.query("VOLT:PROT:TRIP?").unwrap(), "0");
        assert_eq!(sim.query("MEAS:VOLT?").unwrap(), "5.0000");
    }

    #[test]
    fn connected_sessions_share_one_instrument() {
        let sim = SimulatedSupply::new();
        let mut session = sim.connect("sim://bench").unwrap();
        session.write("INST:NSEL 2").unwrap();
        session.write("OUTP 1").unwrap();
        assert!(sim.output(ChannelId::Follower).output_enabled);
        assert_eq!(sim.writes(), vec!["INST:NSEL 2", "OUTP 1"]);
    }

    #[test]
    fn injected_failures_time_out() {
        let mut sim = SimulatedSupply::new();
        sim.fail_next(1);
        assert!(matches!(
            sim.query("MEAS:VOLT?"),
            Err(TransportError::Timeout { .. })
        ));
        assert!(sim.query("MEAS:VOLT?").is_ok());

        sim.set_connected(false);
        assert!(matches!(
            sim.write("OUTP 0"),
            Err(TransportError::ConnectionLost(_))
        ));
    }
}
