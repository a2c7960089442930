//! Prometheus metrics for the follower loop.
//!
//! Counters mirror the loop's running totals, gauges the latest status
//! snapshot. Everything lives in a dedicated registry served by
//! [`serve_metrics`].

use follower_core::{tags, LoopStats, StatusSnapshot};
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use thiserror::Error;
use tiny_http::{Header, Response, Server};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to bind metrics server on {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric definition is valid");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("metric definition is valid");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

// ============================================================================
// Loop Metrics
// ============================================================================

pub static CYCLES_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_cycles_executed_total",
        "Total poll cycles executed",
    )
});

pub static CYCLES_OVERRUN: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_cycles_overrun_total",
        "Poll cycles that took longer than the sample interval",
    )
});

pub static TRANSPORT_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_transport_retries_total",
        "Channel reads retried after a transport error",
    )
});

pub static UNREACHABLE_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_unreachable_cycles_total",
        "Cycles in which the instrument could not be read",
    )
});

pub static SETPOINTS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_setpoints_written_total",
        "Setpoints written to the follower channel",
    )
});

pub static PROTECTION_TRIPS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_protection_trips_total",
        "Cycles that observed a tripped follower channel",
    )
});

pub static RECOVERIES_ATTEMPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "follower_recoveries_attempted_total",
        "Protection clear and re-enable attempts",
    )
});

pub static CYCLE_DURATION_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            tags::CYCLE_DURATION_US.metric,
            "Poll cycle duration in microseconds",
        )
        .buckets(vec![
            500.0, 1_000.0, 5_000.0, 10_000.0, 25_000.0, 50_000.0, 100_000.0, 250_000.0,
            500_000.0, 1_000_000.0,
        ]),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registered once");
    histogram
});

// ============================================================================
// Instrument State Metrics
// ============================================================================

pub static SOURCE_VOLTAGE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(tags::SOURCE_VOLTAGE.metric, "Measured voltage of channel 1")
});

pub static FOLLOWER_VOLTAGE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(tags::FOLLOWER_VOLTAGE.metric, "Measured voltage of channel 2")
});

pub static FOLLOWER_CURRENT: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(tags::FOLLOWER_CURRENT.metric, "Measured current of channel 2")
});

pub static COMMANDED_VOLTAGE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::COMMANDED_VOLTAGE.metric,
        "Voltage last commanded on channel 2",
    )
});

/// 0=healthy, 1=protection tripped, 2=disconnected
pub static FAULT_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::FAULT_STATE.metric,
        "Fault state (0=healthy,1=protection_tripped,2=disconnected)",
    )
});

pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "follower_bridge_connected",
        "Status bridge client connection (1=connected, 0=disconnected)",
    )
});

/// Feeds the gauges from one snapshot.
pub fn record_snapshot(snapshot: &StatusSnapshot) {
    SOURCE_VOLTAGE.set(snapshot.source_voltage);
    FOLLOWER_VOLTAGE.set(snapshot.follower_voltage);
    FOLLOWER_CURRENT.set(snapshot.follower_current);
    if let Some(voltage) = snapshot.commanded_voltage {
        COMMANDED_VOLTAGE.set(voltage);
    }
    FAULT_STATE.set(snapshot.fault_state.as_gauge());
}

/// Advances the counters by the difference between two sets of loop totals.
///
/// A `current` smaller than `previous` means the loop restarted; the totals
/// are then taken as fresh.
pub fn record_stats_delta(previous: &LoopStats, current: &LoopStats) {
    let restarted = current.cycles_executed < previous.cycles_executed;
    let delta = |prev: u64, now: u64| if restarted { now } else { now.saturating_sub(prev) };

    CYCLES_EXECUTED.inc_by(delta(previous.cycles_executed, current.cycles_executed));
    CYCLES_OVERRUN.inc_by(delta(previous.cycles_overrun, current.cycles_overrun));
    TRANSPORT_RETRIES.inc_by(delta(previous.transport_retries, current.transport_retries));
    UNREACHABLE_CYCLES.inc_by(delta(previous.unreachable_cycles, current.unreachable_cycles));
    SETPOINTS_WRITTEN.inc_by(delta(previous.setpoints_written, current.setpoints_written));
    PROTECTION_TRIPS.inc_by(delta(previous.protection_trips, current.protection_trips));
    RECOVERIES_ATTEMPTED.inc_by(delta(
        previous.recoveries_attempted,
        current.recoveries_attempted,
    ));
    if current.cycles_executed != previous.cycles_executed {
        CYCLE_DURATION_US.observe(current.last_cycle_us as f64);
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Binds the metrics HTTP server and serves it from a background thread.
pub fn serve_metrics(bind_addr: &str) -> Result<thread::JoinHandle<()>, MetricsError> {
    let server = Server::http(bind_addr).map_err(|e| MetricsError::Bind {
        addr: bind_addr.to_string(),
        reason: e.to_string(),
    })?;
    tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

    Ok(thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                        Ok(()) => {
                            let response = Response::from_data(buffer);
                            match Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            ) {
                                Ok(header) => response.with_header(header),
                                Err(()) => response,
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            Response::from_data(b"Internal Server Error".to_vec())
                                .with_status_code(500)
                        }
                    }
                }
                "/health" => Response::from_data(b"OK".to_vec()),
                // Ready once the loop has completed a cycle.
                "/ready" if CYCLES_EXECUTED.get() > 0 => Response::from_data(b"Ready".to_vec()),
                "/ready" => Response::from_data(b"Not Ready".to_vec()).with_status_code(503),
                _ => Response::from_data(b"Not Found".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        }
    }))
}

/// Forces registration of every metric so they are exported before the first update.
pub fn init_metrics() {
    let _ = CYCLES_EXECUTED.get();
    let _ = CYCLES_OVERRUN.get();
    let _ = TRANSPORT_RETRIES.get();
    let _ = UNREACHABLE_CYCLES.get();
    let _ = SETPOINTS_WRITTEN.get();
    let _ = PROTECTION_TRIPS.get();
    let _ = RECOVERIES_ATTEMPTED.get();
    let _ = CYCLE_DURATION_US.get_sample_count();
    let _ = SOURCE_VOLTAGE.get();
    let _ = FOLLOWER_VOLTAGE.get();
    let _ = FOLLOWER_CURRENT.get();
    let _ = COMMANDED_VOLTAGE.get();
    let _ = FAULT_STATE.get();
    let _ = BRIDGE_CONNECTED.get();
}

#[cfg(test)]
mod tests {
    use super::*;
    use follower_core::FaultState;

    #[test]
    fn snapshot_feeds_gauges() {
        record_snapshot(&StatusSnapshot {
            source_voltage: 12.5,
            follower_voltage: 12.49,
            commanded_voltage: Some(12.5),
            fault_state: FaultState::Disconnected,
            ..Default::default()
        });
        assert_eq!(SOURCE_VOLTAGE.get(), 12.5);
        assert_eq!(COMMANDED_VOLTAGE.get(), 12.5);
        assert_eq!(FAULT_STATE.get(), 2.0);
    }

    #[test]
    fn counters_advance_by_delta() {
        let before = RECOVERIES_ATTEMPTED.get();
        let first = LoopStats {
            cycles_executed: 4,
            recoveries_attempted: 1,
            ..Default::default()
        };
        let second = LoopStats {
            cycles_executed: 6,
            recoveries_attempted: 3,
            ..Default::default()
        };
        record_stats_delta(&LoopStats::default(), &first);
        record_stats_delta(&first, &second);
        assert_eq!(RECOVERIES_ATTEMPTED.get() - before, 3);
    }

    #[test]
    fn exports_registered_metrics() {
        init_metrics();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "follower_cycles_executed_total"));
        assert!(names.iter().any(|n| n == tags::FAULT_STATE.metric));
    }
}
