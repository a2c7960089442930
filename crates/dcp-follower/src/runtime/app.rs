use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::StartupError;
use crate::runtime::instrument::Instrument;
use crate::runtime::logging::init_tracing;
use crate::runtime::{signals, telemetry};
use follower_core::control::start_with;
use follower_core::{FatalAbort, FollowerConfig, StatusExchange, StopReport, TimeBase};
use follower_io::bridge::{Bridge, BridgeConfig};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// How a run that got past startup ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(StopReport),
    Aborted(FatalAbort),
}

impl RunOutcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Completed(_) => ExitCode::SUCCESS,
            Self::Aborted(_) => ExitCode::from(2),
        }
    }
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}\n");
            RuntimeConfig::print_help();
            return ExitCode::from(1);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }

    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    match run(config) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            error!(error = %e, "Startup failed");
            ExitCode::from(1)
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<RunOutcome, StartupError> {
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(config.metrics_addr.as_deref())?;

    let follower_config = load_follower_config(&config)?;
    let audit_logger = init_audit_logger(config.audit_path.as_deref())?;
    let instrument = Instrument::open(&config)?;

    let exchange = Arc::new(StatusExchange::new());
    let timebase = TimeBase::new();

    if let Some(logger) = &audit_logger {
        logger.record(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "instrument": instrument.kind(),
                "address": config.address,
                "voltage_offset": follower_config.voltage_offset,
                "target_current": follower_config.target_current,
                "sample_interval_s": follower_config.sample_interval_s,
                "max_slew_rate": follower_config.max_slew_rate,
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": config.metrics_addr.is_some(),
            }),
        );
    }

    // Stops the bridge and telemetry threads once the loop is done.
    let aux_stop = Arc::new(AtomicBool::new(false));

    let bridge_handle = if config.bridge_enabled {
        let bridge = Bridge::bind(&BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            publish_interval: follower_config.sample_interval(),
        })?;
        info!(addr = %config.bind_addr, "Starting bridge");
        let exchange_bridge = Arc::clone(&exchange);
        let stop_bridge = Arc::clone(&aux_stop);
        Some(thread::spawn(move || bridge.run(exchange_bridge, timebase, stop_bridge)))
    } else {
        info!("Bridge disabled");
        None
    };

    let updater_handle = telemetry::start_updater(
        Arc::clone(&exchange),
        telemetry::TelemetryUpdater::new(audit_logger.clone(), timebase),
        Arc::clone(&aux_stop),
    );

    signals::install_stop_handler(Arc::clone(&exchange));

    info!(
        offset_v = follower_config.voltage_offset,
        current_a = follower_config.target_current,
        interval_s = follower_config.sample_interval_s,
        max_slew = ?follower_config.max_slew_rate,
        "Starting follower loop"
    );
    let started = start_with(instrument, follower_config, Arc::clone(&exchange), timebase);
    let outcome = match started {
        Ok(handle) => Ok(handle.join()),
        Err(e) => Err(e),
    };

    aux_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = bridge_handle {
        let _ = handle.join();
    }
    let _ = updater_handle.join();

    let outcome = match outcome? {
        Ok(report) => {
            info!(
                reason = ?report.reason,
                cycles_executed = report.stats.cycles_executed,
                cycles_overrun = report.stats.cycles_overrun,
                setpoints_written = report.stats.setpoints_written,
                recoveries_attempted = report.stats.recoveries_attempted,
                "Follower stopped"
            );
            RunOutcome::Completed(report)
        }
        Err(abort) => {
            error!(
                reason = abort.reason.as_str(),
                cycles_executed = abort.stats.cycles_executed,
                last_commanded_voltage = ?abort.state.last_commanded_voltage,
                "{abort}"
            );
            RunOutcome::Aborted(abort)
        }
    };

    if let Some(logger) = &audit_logger {
        let (event_type, details) = match &outcome {
            RunOutcome::Completed(report) => (
                AuditEventType::SystemShutdown,
                serde_json::json!({
                    "reason": report.reason,
                    "stats": report.stats,
                }),
            ),
            RunOutcome::Aborted(abort) => (
                AuditEventType::FollowerAborted,
                serde_json::json!({
                    "reason": abort.reason.as_str(),
                    "detail": abort.reason.to_string(),
                    "controller_state": abort.state,
                    "stats": abort.stats,
                }),
            ),
        };
        logger.record(timebase.now_us(), timebase.unix_us(), event_type, details);
    }

    Ok(outcome)
}

fn load_follower_config(config: &RuntimeConfig) -> Result<FollowerConfig, StartupError> {
    let base = match &config.config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading follower configuration");
            FollowerConfig::load(path)?
        }
        None => FollowerConfig::default(),
    };
    let follower_config = config.apply_overrides(base);
    follower_config.validate()?;
    Ok(follower_config)
}

fn init_audit_logger(audit_path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, StartupError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(StartupError::Audit {
                path: path.to_path_buf(),
                source,
            }),
        })
        .transpose()
}
