use follower_core::{
    AbortReason, ChannelId, ConfigError, FatalAbort, FaultState, FollowerConfig, LoopState,
    PollLoop, Session, SimulatedSupply, SourceProfile, StatusExchange, StopReason, StopReport,
    TimeBase, TransportError,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(max_cycles: u64) -> FollowerConfig {
    FollowerConfig {
        target_current: 0.1,
        voltage_offset: 0.0,
        sample_interval_s: 0.001,
        transport_retry_backoff_ms: 0,
        max_cycles: Some(max_cycles),
        ..Default::default()
    }
}

fn run(sim: &SimulatedSupply, cfg: FollowerConfig) -> (Result<StopReport, FatalAbort>, Arc<StatusExchange>) {
    let exchange = Arc::new(StatusExchange::new());
    let mut follower = PollLoop::new(sim.clone(), cfg, Arc::clone(&exchange), TimeBase::new());
    (follower.run(), exchange)
}

fn count(writes: &[String], command: &str) -> usize {
    writes.iter().filter(|w| w.as_str() == command).count()
}

/// Simulated supply that takes a fixed time to answer every transaction.
struct SlowLink {
    sim: SimulatedSupply,
    delay: Duration,
}

impl Session for SlowLink {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        thread::sleep(self.delay);
        self.sim.query(command)
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        thread::sleep(self.delay);
        self.sim.write(command)
    }
}

fn run_slow(sim: &SimulatedSupply, delay: Duration, cfg: FollowerConfig) -> (StopReport, Duration) {
    let session = SlowLink {
        sim: sim.clone(),
        delay,
    };
    let mut follower = PollLoop::new(session, cfg, Arc::new(StatusExchange::new()), TimeBase::new());
    let started = Instant::now();
    let report = follower.run().expect("run should stop cleanly");
    (report, started.elapsed())
}

#[test]
fn steady_source_is_written_once() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(12.0));
    let (outcome, exchange) = run(&sim, config(10));

    let report = outcome.expect("run should stop cleanly");
    assert_eq!(report.reason, StopReason::CycleLimitReached);
    assert_eq!(report.stats.cycles_executed, 10);
    assert_eq!(report.stats.setpoints_written, 1);

    let writes = sim.writes();
    let setpoints: Vec<&String> = writes.iter().filter(|w| w.starts_with("VOLT ")).collect();
    assert_eq!(setpoints, vec!["VOLT 12.000"]);
    assert_eq!(count(&writes, "CURR 0.100"), 1);
    assert_eq!(count(&writes, "OUTP 1"), 1);
    assert_eq!(writes.last().map(String::as_str), Some("OUTP 0"));

    let status = exchange.read();
    assert_eq!(status.loop_state, LoopState::Stopped);
    assert_eq!(status.fault_state, FaultState::Healthy);
    assert_eq!(status.commanded_voltage, Some(12.0));
    assert_eq!(status.follower_voltage, 12.0);
}

#[test]
fn trip_reported_as_running_is_recovered() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(12.0));
    sim.trip_at_follower_poll(3);
    let (outcome, _) = run(&sim, config(6));

    let report = outcome.expect("single trip should be recovered");
    assert_eq!(report.stats.protection_trips, 1);
    assert_eq!(report.stats.recoveries_attempted, 1);
    assert_eq!(report.state.consecutive_fault_count, 0);
    assert_eq!(report.state.recoveries_attempted, 1);

    let writes = sim.writes();
    assert_eq!(count(&writes, "OUTP:PROT:CLE"), 1);
    assert_eq!(count(&writes, "OUTP 1"), 2);
    assert!(!sim.output(ChannelId::Follower).ovp_tripped);
}

#[test]
fn trip_reported_as_stopped_is_recovered() {
    let sim = SimulatedSupply::new()
        .with_source(SourceProfile::Steady(12.0))
        .reports_running_when_tripped(false);
    sim.trip_at_follower_poll(3);
    let (outcome, exchange) = run(&sim, config(6));

    let report = outcome.expect("single trip should be recovered");
    assert_eq!(report.stats.protection_trips, 1);
    assert_eq!(report.stats.recoveries_attempted, 1);
    assert_eq!(count(&sim.writes(), "OUTP:PROT:CLE"), 1);
    assert_eq!(exchange.read().fault_state, FaultState::Healthy);
}

#[test]
fn follower_current_comes_from_the_load() {
    let sim = SimulatedSupply::new()
        .with_source(SourceProfile::Steady(12.0))
        .with_load_ohms(10.0);
    let cfg = FollowerConfig {
        target_current: 2.0,
        disable_output_on_stop: false,
        ..config(3)
    };
    let (outcome, exchange) = run(&sim, cfg);

    outcome.expect("run should stop cleanly");
    let status = exchange.read();
    assert_eq!(status.follower_voltage, 12.0);
    assert_eq!(status.follower_current, 1.2);
    assert!(sim.output(ChannelId::Follower).output_enabled);
}

#[test]
fn persistent_trip_aborts_after_retry_limit() {
    let sim = SimulatedSupply::new()
        .with_source(SourceProfile::Steady(12.0))
        .with_ovp_level(10.0);
    let cfg = FollowerConfig {
        recovery_retry_limit: 3,
        ..config(20)
    };
    let (outcome, exchange) = run(&sim, cfg);

    let abort = outcome.expect_err("repeated trips must abort");
    assert_eq!(
        abort.reason,
        AbortReason::RecoveryLimitExceeded { attempts: 3 }
    );
    assert_eq!(abort.state.last_commanded_voltage, Some(12.0));
    assert_eq!(abort.stats.cycles_executed, 5);
    assert_eq!(count(&sim.writes(), "OUTP:PROT:CLE"), 3);
    assert_eq!(sim.writes().last().map(String::as_str), Some("OUTP 0"));

    let status = exchange.read();
    assert_eq!(status.loop_state, LoopState::Stopped);
    assert_eq!(status.fault_state, FaultState::ProtectionTripped);
    assert!(status.follower_output_enabled);
}

#[test]
fn unreachable_instrument_aborts_past_threshold() {
    let sim = SimulatedSupply::new();
    sim.set_connected(false);
    let cfg = FollowerConfig {
        expected_model: None,
        disconnect_limit: 2,
        transport_retry_limit: 1,
        ..config(20)
    };
    let (outcome, exchange) = run(&sim, cfg);

    let abort = outcome.expect_err("lost link must abort");
    assert_eq!(
        abort.reason,
        AbortReason::DisconnectLimitExceeded { cycles: 3 }
    );
    assert_eq!(abort.stats.transport_retries, 3);
    assert_eq!(abort.stats.unreachable_cycles, 3);
    // Each attempt fails on its channel select.
    assert_eq!(sim.transactions(), 6);
    assert_eq!(exchange.read().fault_state, FaultState::Disconnected);
}

#[test]
fn transient_timeout_is_retried_within_cycle() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(5.0));
    sim.fail_next(1);
    let cfg = FollowerConfig {
        expected_model: None,
        ..config(3)
    };
    let (outcome, _) = run(&sim, cfg);

    let report = outcome.expect("one timeout is not fatal");
    assert_eq!(report.stats.transport_retries, 1);
    assert_eq!(report.stats.unreachable_cycles, 0);
    assert_eq!(report.stats.setpoints_written, 1);
}

#[test]
fn incompatible_module_aborts_before_any_output() {
    let sim = SimulatedSupply::new().with_model(ChannelId::Follower, "DCP1005");
    let (outcome, _) = run(&sim, config(5));

    let abort = outcome.expect_err("wrong module must abort");
    assert_eq!(
        abort.reason,
        AbortReason::IncompatibleModule {
            channel: ChannelId::Follower,
            model: "DCP1005".to_string(),
        }
    );
    assert!(sim.writes().iter().all(|w| w.starts_with("INST:NSEL")));
}

#[test]
fn ovp_can_be_disabled_at_start() {
    let sim = SimulatedSupply::new()
        .with_source(SourceProfile::Steady(12.0))
        .with_ovp_level(10.0);
    let cfg = FollowerConfig {
        disable_ovp_on_start: true,
        ..config(3)
    };
    let (outcome, _) = run(&sim, cfg);

    let report = outcome.expect("no trip without OVP");
    assert_eq!(report.stats.protection_trips, 0);
    assert_eq!(count(&sim.writes(), "VOLT:PROT:STAT 0"), 1);
    assert!(!sim.output(ChannelId::Follower).ovp_enabled);
}

#[test]
fn operator_stop_ends_run_cleanly() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(7.5));
    let cfg = FollowerConfig {
        max_cycles: None,
        sample_interval_s: 0.01,
        ..config(0)
    };
    let handle = follower_core::start(sim.clone(), cfg).expect("config is valid");

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.status().cycle_count < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.status().loop_state, LoopState::Running);
    handle.stop();

    let exchange = handle.exchange();
    let report = handle.join().expect("operator stop is not an abort");
    assert_eq!(report.reason, StopReason::OperatorRequest);
    assert_eq!(exchange.read().loop_state, LoopState::Stopped);
    assert!(!sim.output(ChannelId::Follower).output_enabled);
}

#[test]
fn invalid_config_is_rejected_at_start() {
    let cfg = FollowerConfig {
        target_current: 0.0,
        ..config(1)
    };
    assert!(follower_core::start(SimulatedSupply::new(), cfg).is_err());
}

#[test]
fn unrepresentable_interval_aborts_before_any_command() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(12.0));
    let cfg = FollowerConfig {
        sample_interval_s: 1e20,
        ..config(3)
    };
    let (outcome, exchange) = run(&sim, cfg);

    let abort = outcome.expect_err("interval cannot be slept");
    assert_eq!(
        abort.reason,
        AbortReason::InvalidConfig(ConfigError::IntervalTooLarge(1e20))
    );
    assert_eq!(abort.reason.as_str(), "invalid_config");
    assert_eq!(abort.stats.cycles_executed, 0);
    assert_eq!(sim.transactions(), 0);
    assert_eq!(exchange.read().loop_state, LoopState::Stopped);
}

#[test]
fn cycle_time_is_taken_out_of_the_sleep() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(12.0));
    let cfg = FollowerConfig {
        expected_model: None,
        sample_interval_s: 0.1,
        ..config(5)
    };
    let (report, elapsed) = run_slow(&sim, Duration::from_millis(5), cfg);

    // At least twelve transactions per cycle, so 60 ms of work in each 100 ms slot.
    assert!(report.stats.max_cycle_us >= 60_000, "{:?}", report.stats);
    assert_eq!(report.stats.cycles_overrun, 0);
    assert!(elapsed >= Duration::from_millis(490), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
}

#[test]
fn overrun_cycles_are_counted_and_not_slept() {
    let sim = SimulatedSupply::new().with_source(SourceProfile::Steady(12.0));
    let cfg = FollowerConfig {
        expected_model: None,
        sample_interval_s: 0.02,
        ..config(3)
    };
    let (report, elapsed) = run_slow(&sim, Duration::from_millis(5), cfg);

    assert_eq!(report.stats.cycles_executed, 3);
    assert_eq!(report.stats.cycles_overrun, 3);
    let busy = Duration::from_micros(report.stats.max_cycle_us * 3);
    assert!(elapsed < busy + Duration::from_millis(40), "took {elapsed:?}, busy {busy:?}");
}

#[test]
fn stop_interrupts_transport_backoff() {
    let sim = SimulatedSupply::new();
    sim.set_connected(false);
    let cfg = FollowerConfig {
        expected_model: None,
        max_cycles: None,
        transport_retry_limit: 3,
        transport_retry_backoff_ms: 10_000,
        ..config(0)
    };
    let handle = follower_core::start(sim.clone(), cfg).expect("config is valid");

    let deadline = Instant::now() + Duration::from_secs(5);
    while sim.transactions() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let stop_sent = Instant::now();
    handle.stop();

    let report = handle.join().expect("operator stop is not an abort");
    assert_eq!(report.reason, StopReason::OperatorRequest);
    assert!(stop_sent.elapsed() < Duration::from_secs(1), "took {:?}", stop_sent.elapsed());
    assert!(report.stats.transport_retries <= 1);
}
