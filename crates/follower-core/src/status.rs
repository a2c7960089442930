use crate::detector::FaultState;
use crate::scheduler::LoopStats;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// What a front end can see of a running follower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub timestamp_us: u64,
    pub cycle_count: u64,
    pub loop_state: LoopState,
    pub fault_state: FaultState,
    pub source_voltage: f64,
    pub follower_voltage: f64,
    pub follower_current: f64,
    pub follower_output_enabled: bool,
    pub commanded_voltage: Option<f64>,
    pub commanded_current: Option<f64>,
    pub consecutive_fault_count: u32,
    pub recovery_in_progress: bool,
    pub recoveries_attempted: u32,
    /// Running totals as of the last completed cycle.
    pub stats: LoopStats,
}

/// Hand-off point between the loop thread and everything else.
///
/// The loop is the only writer of the snapshot; any thread may read it or
/// request a stop.
#[derive(Debug, Default)]
pub struct StatusExchange {
    snapshot: RwLock<StatusSnapshot>,
    stop: AtomicBool,
}

impl StatusExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the loop once per cycle and on state transitions.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn read(&self) -> StatusSnapshot {
        *self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
