use crate::channel::ChannelReading;
use crate::config::FollowerConfig;
use crate::detector::FaultState;
use crate::error::AbortReason;
use crate::setpoint::Setpoint;
use serde::Serialize;

/// What the loop should do to the follower channel this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a new setpoint. `enable` also switches the output on.
    SetOutput {
        voltage: f64,
        current: f64,
        enable: bool,
    },
    /// Clear the protection latch, reassert the last good setpoint, re-enable the output.
    ClearProtectionAndReenable { voltage: f64, current: f64 },
    NoOp,
    Abort(AbortReason),
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetOutput { .. } => "set_output",
            Self::ClearProtectionAndReenable { .. } => "clear_protection_and_reenable",
            Self::NoOp => "no_op",
            Self::Abort(_) => "abort",
        }
    }
}

/// Controller memory carried from one cycle to the next. Reset on every
/// loop start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ControllerState {
    /// Set once the output has been commanded on.
    pub last_commanded_voltage: Option<f64>,
    pub last_commanded_current: Option<f64>,
    pub consecutive_fault_count: u32,
    pub consecutive_disconnect_count: u32,
    pub recovery_in_progress: bool,
    pub recoveries_attempted: u32,
    /// The instrument may not hold the last commanded setpoint; write it
    /// again on the next healthy cycle even if nothing changed.
    pub needs_reassert: bool,
}

impl ControllerState {
    pub fn output_commanded(&self) -> bool {
        self.last_commanded_voltage.is_some()
    }

    /// A command failed mid-cycle, so the device state is unknown.
    pub fn mark_unconfirmed(&mut self) {
        self.needs_reassert = true;
    }
}

/// Decide the next action from the source reading and the follower's fault state.
pub fn step(
    source: Option<&ChannelReading>,
    fault: FaultState,
    config: &FollowerConfig,
    state: &mut ControllerState,
) -> Action {
    match (fault, source) {
        (FaultState::Healthy, Some(source)) => follow(source, config, state),
        (FaultState::ProtectionTripped, _) => recover(config, state),
        (FaultState::Disconnected, _) | (FaultState::Healthy, None) => {
            hold_while_disconnected(config, state)
        }
    }
}

fn follow(source: &ChannelReading, config: &FollowerConfig, state: &mut ControllerState) -> Action {
    state.consecutive_fault_count = 0;
    state.consecutive_disconnect_count = 0;
    state.recovery_in_progress = false;

    let limits = &config.output_limits;
    let desired = limits.clamp_voltage(source.measured_voltage + config.voltage_offset);
    let current = config.target_current;

    // Convergence is judged against where the output should end up, not the
    // slew-limited step, so a step smaller than the tolerance still moves.
    let converged = match (state.last_commanded_voltage, state.last_commanded_current) {
        (Some(v), Some(i)) => (desired - v).abs() <= config.setpoint_tolerance && i == current,
        _ => false,
    };
    if converged && !state.needs_reassert {
        return Action::NoOp;
    }

    let target = match (config.max_step_per_cycle(), state.last_commanded_voltage) {
        (Some(max_step), Some(previous)) => {
            limits.clamp_voltage(previous + (desired - previous).clamp(-max_step, max_step))
        }
        _ => desired,
    };

    let setpoint = match Setpoint::new(target, current).validate(limits) {
        Ok(setpoint) => setpoint,
        Err(violation) => return Action::Abort(AbortReason::InvalidSetpoint(violation)),
    };

    let enable = !state.output_commanded() || state.needs_reassert;
    state.last_commanded_voltage = Some(setpoint.voltage());
    state.last_commanded_current = Some(setpoint.current());
    state.needs_reassert = false;

    Action::SetOutput {
        voltage: setpoint.voltage(),
        current: setpoint.current(),
        enable,
    }
}

fn recover(config: &FollowerConfig, state: &mut ControllerState) -> Action {
    state.consecutive_disconnect_count = 0;
    state.consecutive_fault_count += 1;
    if state.consecutive_fault_count > config.recovery_retry_limit {
        return Action::Abort(AbortReason::RecoveryLimitExceeded {
            attempts: config.recovery_retry_limit,
        });
    }

    match (state.last_commanded_voltage, state.last_commanded_current) {
        (Some(voltage), Some(current)) => {
            state.recovery_in_progress = true;
            state.recoveries_attempted += 1;
            Action::ClearProtectionAndReenable { voltage, current }
        }
        // The detector never reports a trip before the output was commanded on.
        _ => Action::NoOp,
    }
}

fn hold_while_disconnected(config: &FollowerConfig, state: &mut ControllerState) -> Action {
    state.consecutive_disconnect_count += 1;
    if state.consecutive_disconnect_count > config.disconnect_limit {
        return Action::Abort(AbortReason::DisconnectLimitExceeded {
            cycles: state.consecutive_disconnect_count,
        });
    }
    if state.output_commanded() {
        state.needs_reassert = true;
    }
    Action::NoOp
}
