use crate::infra::audit::{AuditEventType, AuditLogger};
use follower_core::{FaultState, LoopStats, StatusExchange, StatusSnapshot, TimeBase};
use follower_io::metrics::{init_metrics, record_snapshot, record_stats_delta, serve_metrics, MetricsError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_PERIOD: Duration = Duration::from_millis(100);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: Option<&str>) -> Result<Option<thread::JoinHandle<()>>, MetricsError> {
    addr.map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr)
    })
    .transpose()
}

/// Turns successive status snapshots into metric updates and audit events.
///
/// Works on samples, so a fault that starts and clears between two samples
/// is not audited.
pub struct TelemetryUpdater {
    audit: Option<Arc<AuditLogger>>,
    timebase: TimeBase,
    last_stats: LoopStats,
    last_fault: FaultState,
    last_recoveries: u32,
    stop_seen: bool,
}

impl TelemetryUpdater {
    pub fn new(audit: Option<Arc<AuditLogger>>, timebase: TimeBase) -> Self {
        Self {
            audit,
            timebase,
            last_stats: LoopStats::default(),
            last_fault: FaultState::Healthy,
            last_recoveries: 0,
            stop_seen: false,
        }
    }

    pub fn observe(&mut self, snapshot: &StatusSnapshot, stop_requested: bool) {
        record_snapshot(snapshot);
        record_stats_delta(&self.last_stats, &snapshot.stats);
        self.last_stats = snapshot.stats;

        if snapshot.fault_state != self.last_fault {
            self.audit(
                AuditEventType::FaultStateChanged,
                serde_json::json!({
                    "from": self.last_fault.as_str(),
                    "to": snapshot.fault_state.as_str(),
                    "cycle": snapshot.cycle_count,
                    "commanded_voltage": snapshot.commanded_voltage,
                    "follower_voltage": snapshot.follower_voltage,
                }),
            );
            self.last_fault = snapshot.fault_state;
        }

        if snapshot.recoveries_attempted > self.last_recoveries {
            self.audit(
                AuditEventType::RecoveryAttempted,
                serde_json::json!({
                    "recoveries_attempted": snapshot.recoveries_attempted,
                    "consecutive_fault_count": snapshot.consecutive_fault_count,
                    "commanded_voltage": snapshot.commanded_voltage,
                    "cycle": snapshot.cycle_count,
                }),
            );
        }
        self.last_recoveries = snapshot.recoveries_attempted;

        if stop_requested && !self.stop_seen {
            self.stop_seen = true;
            self.audit(
                AuditEventType::StopRequested,
                serde_json::json!({ "cycle": snapshot.cycle_count }),
            );
        }
    }

    fn audit(&self, event_type: AuditEventType, details: serde_json::Value) {
        if let Some(logger) = &self.audit {
            logger.record(self.timebase.now_us(), self.timebase.unix_us(), event_type, details);
        }
    }
}

/// Samples the exchange until `stop` is set, then takes one last sample.
pub fn start_updater(
    exchange: Arc<StatusExchange>,
    mut updater: TelemetryUpdater,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            updater.observe(&exchange.read(), exchange.stop_requested());
            thread::sleep(UPDATE_PERIOD);
        }
        updater.observe(&exchange.read(), exchange.stop_requested());
    })
}
