use crate::channel::{ChannelId, ChannelReading};
use crate::commands::Command;
use crate::config::FollowerConfig;
use crate::controller::{self, Action, ControllerState};
use crate::detector::{classify, FaultState};
use crate::error::{AbortReason, FatalAbort, ProtectionFault, TransportError};
use crate::reader::ChannelReader;
use crate::status::{LoopState, StatusExchange, StatusSnapshot};
use crate::timebase::TimeBase;
use crate::transport::Session;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep between cycles, so a stop request is seen promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Default, Debug, PartialEq, Serialize)]
pub struct LoopStats {
    pub cycles_executed: u64,
    pub cycles_overrun: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
    pub transport_retries: u64,
    pub unreachable_cycles: u64,
    pub command_failures: u64,
    pub setpoints_written: u64,
    pub protection_trips: u64,
    pub recoveries_attempted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    OperatorRequest,
    CycleLimitReached,
}

/// Outcome of a run that ended without a fault.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub reason: StopReason,
    pub state: ControllerState,
    pub stats: LoopStats,
}

/// Drives reader, detector and controller once per sample interval against a
/// single instrument session. One cycle at a time, never concurrently.
pub struct PollLoop<S: Session> {
    session: S,
    config: FollowerConfig,
    exchange: Arc<StatusExchange>,
    timebase: TimeBase,
    state: ControllerState,
    stats: LoopStats,
    snapshot: StatusSnapshot,
}

impl<S: Session> PollLoop<S> {
    pub fn new(session: S, config: FollowerConfig, exchange: Arc<StatusExchange>, timebase: TimeBase) -> Self {
        Self {
            session,
            config,
            exchange,
            timebase,
            state: ControllerState::default(),
            stats: LoopStats::default(),
            snapshot: StatusSnapshot::default(),
        }
    }

    /// Run until stopped, aborted, or the configured cycle limit is reached.
    pub fn run(&mut self) -> Result<StopReport, FatalAbort> {
        self.state = ControllerState::default();
        self.stats = LoopStats::default();
        self.transition(LoopState::Running);

        let outcome = self
            .config
            .validate()
            .map_err(AbortReason::InvalidConfig)
            .and_then(|()| self.prepare())
            .and_then(|()| self.cycle_until_stopped());

        self.shutdown();

        match outcome {
            Ok(reason) => {
                info!(
                    "Follower stopped ({reason:?}) after {} cycles",
                    self.stats.cycles_executed
                );
                Ok(StopReport {
                    reason,
                    state: self.state,
                    stats: self.stats,
                })
            }
            Err(reason) => {
                error!("Follower aborted: {reason}");
                Err(FatalAbort {
                    reason,
                    state: self.state,
                    stats: self.stats,
                })
            }
        }
    }

    fn prepare(&mut self) -> Result<(), AbortReason> {
        if let Some(expected) = self.config.expected_model.clone() {
            let mut reader = ChannelReader::new(&mut self.session, self.config.output_limits);
            for channel in ChannelId::ALL {
                let model = reader.model(channel).map_err(AbortReason::Startup)?;
                if !model.contains(expected.as_str()) {
                    return Err(AbortReason::IncompatibleModule { channel, model });
                }
                info!("{channel} module: {model}");
            }
        }

        if self.config.disable_ovp_on_start {
            self.session
                .send(&Command::SelectChannel(ChannelId::Follower))
                .and_then(|()| self.session.send(&Command::SetVoltageProtectionState(false)))
                .map_err(AbortReason::Startup)?;
            warn!("Overvoltage protection disabled on {}", ChannelId::Follower);
        }

        info!(
            "Following {} -> {}: offset {:+.3} V, current {:.3} A, interval {:.3} s",
            ChannelId::Source,
            ChannelId::Follower,
            self.config.voltage_offset,
            self.config.target_current,
            self.config.sample_interval_s
        );
        Ok(())
    }

    fn cycle_until_stopped(&mut self) -> Result<StopReason, AbortReason> {
        let interval = self.config.sample_interval();

        loop {
            if self.exchange.stop_requested() {
                info!("Stop requested");
                return Ok(StopReason::OperatorRequest);
            }
            if let Some(max_cycles) = self.config.max_cycles {
                if self.stats.cycles_executed >= max_cycles {
                    return Ok(StopReason::CycleLimitReached);
                }
            }

            let cycle_start = Instant::now();
            let timestamp_us = self.timebase.now_us();

            let source = self.read_with_retry(ChannelId::Source, timestamp_us);
            let follower = match &source {
                Ok(_) => self.read_with_retry(ChannelId::Follower, timestamp_us),
                Err(err) => Err(err.clone()),
            };
            if let Err(err) = &follower {
                self.stats.unreachable_cycles += 1;
                warn!("Instrument unreachable: {err}");
            }

            let fault = classify(follower.as_ref(), &self.state);
            if fault == FaultState::ProtectionTripped {
                self.stats.protection_trips += 1;
                let trip = ProtectionFault {
                    channel: ChannelId::Follower,
                    occurrence: self.state.consecutive_fault_count + 1,
                    setpoint_voltage: self.state.last_commanded_voltage.unwrap_or_default(),
                };
                warn!("{trip}");
            }

            let action = controller::step(source.as_ref().ok(), fault, &self.config, &mut self.state);
            debug!("cycle {} fault={} action={action:?}", self.stats.cycles_executed, fault.as_str());

            if let Action::Abort(reason) = &action {
                self.stats.cycles_executed += 1;
                self.publish_cycle(timestamp_us, fault, source.as_ref().ok(), follower.as_ref().ok());
                return Err(reason.clone());
            }

            if let Err(err) = self.execute(&action) {
                self.stats.command_failures += 1;
                self.state.mark_unconfirmed();
                warn!("Failed to apply {}: {err}", action.as_str());
            }

            self.stats.cycles_executed += 1;
            let elapsed = cycle_start.elapsed();
            let cycle_us = elapsed.as_micros() as u64;
            self.stats.last_cycle_us = cycle_us;
            self.stats.max_cycle_us = self.stats.max_cycle_us.max(cycle_us);
            if elapsed >= interval {
                self.stats.cycles_overrun += 1;
            }
            self.publish_cycle(timestamp_us, fault, source.as_ref().ok(), follower.as_ref().ok());
            self.log_status();

            if let Some(remaining) = interval.checked_sub(elapsed) {
                self.sleep(remaining);
            }
        }
    }

    fn read_with_retry(&mut self, channel: ChannelId, timestamp_us: u64) -> Result<ChannelReading, TransportError> {
        let mut attempt = 0;
        loop {
            let result = ChannelReader::new(&mut self.session, self.config.output_limits)
                .read(channel, timestamp_us);
            match result {
                Ok(reading) => return Ok(reading),
                Err(err) if attempt < self.config.transport_retry_limit && !self.exchange.stop_requested() => {
                    attempt += 1;
                    self.stats.transport_retries += 1;
                    debug!("{channel} read failed (attempt {attempt}): {err}");
                    self.sleep(self.config.transport_retry_backoff());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn execute(&mut self, action: &Action) -> Result<(), TransportError> {
        match *action {
            Action::SetOutput {
                voltage,
                current,
                enable,
            } => {
                self.session.send(&Command::SelectChannel(ChannelId::Follower))?;
                self.session.send(&Command::SetCurrent(current))?;
                self.session.send(&Command::SetVoltage(voltage))?;
                if enable {
                    self.session.send(&Command::SetOutput(true))?;
                    info!("{} output enabled at {voltage:.3} V / {current:.3} A", ChannelId::Follower);
                }
                self.stats.setpoints_written += 1;
            }
            Action::ClearProtectionAndReenable { voltage, current } => {
                self.stats.recoveries_attempted += 1;
                self.session.send(&Command::SelectChannel(ChannelId::Follower))?;
                self.session.send(&Command::ClearProtection)?;
                self.session.send(&Command::SetCurrent(current))?;
                self.session.send(&Command::SetVoltage(voltage))?;
                self.session.send(&Command::SetOutput(true))?;
                warn!(
                    "Cleared {} protection, reasserted {voltage:.3} V / {current:.3} A",
                    ChannelId::Follower
                );
            }
            Action::NoOp | Action::Abort(_) => {}
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.transition(LoopState::Stopping);
        if self.config.disable_output_on_stop && self.state.output_commanded() {
            let result = self
                .session
                .send(&Command::SelectChannel(ChannelId::Follower))
                .and_then(|()| self.session.send(&Command::SetOutput(false)));
            match result {
                Ok(()) => info!("{} output disabled", ChannelId::Follower),
                Err(err) => warn!("Could not disable {} output: {err}", ChannelId::Follower),
            }
        }
        self.transition(LoopState::Stopped);
    }

    fn sleep(&self, mut remaining: Duration) {
        while !remaining.is_zero() && !self.exchange.stop_requested() {
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn transition(&mut self, next: LoopState) {
        debug!("Loop state {} -> {}", self.snapshot.loop_state.as_str(), next.as_str());
        self.snapshot.loop_state = next;
        self.snapshot.timestamp_us = self.timebase.now_us();
        self.exchange.publish(self.snapshot);
    }

    fn publish_cycle(
        &mut self,
        timestamp_us: u64,
        fault: FaultState,
        source: Option<&ChannelReading>,
        follower: Option<&ChannelReading>,
    ) {
        let snap = &mut self.snapshot;
        snap.timestamp_us = timestamp_us;
        snap.cycle_count = self.stats.cycles_executed;
        snap.fault_state = fault;
        if let Some(source) = source {
            snap.source_voltage = source.measured_voltage;
        }
        if let Some(follower) = follower {
            snap.follower_voltage = follower.measured_voltage;
            snap.follower_current = follower.measured_current;
            snap.follower_output_enabled = follower.output_enabled;
        }
        snap.commanded_voltage = self.state.last_commanded_voltage;
        snap.commanded_current = self.state.last_commanded_current;
        snap.consecutive_fault_count = self.state.consecutive_fault_count;
        snap.recovery_in_progress = self.state.recovery_in_progress;
        snap.recoveries_attempted = self.state.recoveries_attempted;
        snap.stats = self.stats;
        self.exchange.publish(*snap);
    }

    fn log_status(&self) {
        let every = u64::from(self.config.status_log_every);
        if every == 0 || self.stats.cycles_executed % every != 0 {
            return;
        }
        let snap = &self.snapshot;
        info!(
            "{} | {} | offset {:+.3} V | ch1 {:.3} V | ch2 {:.3} V {:.3} A",
            snap.loop_state.as_str(),
            snap.fault_state.as_str(),
            self.config.voltage_offset,
            snap.source_voltage,
            snap.follower_voltage,
            snap.follower_current
        );
    }
}
