use follower_core::FollowerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ArgError {
    #[error("{flag} requires a value")]
    MissingValue { flag: String },
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown argument {0}")]
    Unknown(String),
    #[error("exactly one of --address or --simulate is required")]
    InstrumentMode,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub address: Option<String>,
    pub simulate: bool,
    pub scpi_timeout_ms: u64,
    pub config_path: Option<PathBuf>,
    pub offset: Option<f64>,
    pub current: Option<f64>,
    pub interval_ms: Option<u64>,
    pub max_slew: Option<f64>,
    pub max_cycles: Option<u64>,
    pub disable_ovp: bool,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub sim_source_volts: f64,
    pub sim_ovp_volts: Option<f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            address: None,
            simulate: false,
            scpi_timeout_ms: 1000,
            config_path: None,
            offset: None,
            current: None,
            interval_ms: None,
            max_slew: None,
            max_cycles: None,
            disable_ovp: false,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            sim_source_volts: 12.0,
            sim_ovp_volts: None,
        }
    }
}

/// Cursor over the argument list that knows how to pull a flag's value.
struct Args<'a> {
    args: &'a [String],
    i: usize,
}

impl<'a> Args<'a> {
    fn value(&mut self, flag: &str) -> Result<&'a str, ArgError> {
        self.i += 1;
        self.args
            .get(self.i)
            .map(String::as_str)
            .ok_or_else(|| ArgError::MissingValue {
                flag: flag.to_string(),
            })
    }

    fn parsed<T: FromStr>(&mut self, flag: &str) -> Result<T, ArgError> {
        let raw = self.value(flag)?;
        raw.parse().map_err(|_| ArgError::InvalidValue {
            flag: flag.to_string(),
            value: raw.to_string(),
        })
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ArgError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parses `args` as passed to the process (the first element is the program name).
    pub fn from_args(args: &[String]) -> Result<Self, ArgError> {
        let mut cfg = RuntimeConfig::default();
        let mut cursor = Args { args, i: 1 };
        while let Some(arg) = args.get(cursor.i) {
            let flag = arg.as_str();
            match flag {
                "-h" | "--help" => {
                    cfg.show_help = true;
                    return Ok(cfg);
                }
                "--address" => cfg.address = Some(cursor.value(flag)?.to_string()),
                "--simulate" => cfg.simulate = true,
                "--timeout-ms" => cfg.scpi_timeout_ms = cursor.parsed(flag)?,
                "--config" => cfg.config_path = Some(PathBuf::from(cursor.value(flag)?)),
                "--offset" => cfg.offset = Some(cursor.parsed(flag)?),
                "--current" => cfg.current = Some(cursor.parsed(flag)?),
                "--interval-ms" => cfg.interval_ms = Some(cursor.parsed(flag)?),
                "--max-slew" => cfg.max_slew = Some(cursor.parsed(flag)?),
                "--max-cycles" => cfg.max_cycles = Some(cursor.parsed(flag)?),
                "--disable-ovp" => cfg.disable_ovp = true,
                "--bind" => cfg.bind_addr = cursor.value(flag)?.to_string(),
                "--no-bridge" => cfg.bridge_enabled = false,
                "--json-logs" => cfg.json_logs = true,
                "--log-dir" => cfg.log_dir = Some(PathBuf::from(cursor.value(flag)?)),
                "--metrics-addr" => cfg.metrics_addr = Some(cursor.value(flag)?.to_string()),
                "--audit-log" => cfg.audit_path = Some(PathBuf::from(cursor.value(flag)?)),
                "--sim-source-volts" => cfg.sim_source_volts = cursor.parsed(flag)?,
                "--sim-ovp-volts" => cfg.sim_ovp_volts = Some(cursor.parsed(flag)?),
                other => return Err(ArgError::Unknown(other.to_string())),
            }
            cursor.i += 1;
        }

        if cfg.simulate == cfg.address.is_some() {
            return Err(ArgError::InstrumentMode);
        }
        Ok(cfg)
    }

    /// Applies command-line overrides on top of `base` (defaults or a config file).
    pub fn apply_overrides(&self, mut base: FollowerConfig) -> FollowerConfig {
        if let Some(offset) = self.offset {
            base.voltage_offset = offset;
        }
        if let Some(current) = self.current {
            base.target_current = current;
        }
        if let Some(interval_ms) = self.interval_ms {
            base.sample_interval_s = interval_ms as f64 / 1000.0;
        }
        if let Some(max_slew) = self.max_slew {
            base.max_slew_rate = Some(max_slew);
        }
        if let Some(max_cycles) = self.max_cycles {
            base.max_cycles = Some(max_cycles);
        }
        if self.disable_ovp {
            base.disable_ovp_on_start = true;
        }
        base
    }

    pub fn print_help() {
        println!(
            r#"DCP405 voltage follower

Keeps channel 2 of a BB3 chassis at channel 1's voltage plus an offset,
recovering channel 2 from protection trips.

USAGE:
    dcp-follower (--address <host[:port]> | --simulate) [OPTIONS]

INSTRUMENT:
    --address <HOST[:PORT]>  SCPI socket of the instrument (default port 5025)
    --simulate               Use the built-in simulated instrument
    --timeout-ms <MS>        SCPI reply timeout (default: 1000)

FOLLOWER:
    --config <FILE>          JSON follower configuration
    --offset <VOLTS>         Voltage offset added to channel 1
    --current <AMPS>         Channel 2 current limit
    --interval-ms <MS>       Sample interval
    --max-slew <V_PER_S>     Limit channel 2 voltage slew rate
    --max-cycles <N>         Stop after N cycles
    --disable-ovp            Disable channel 2 OVP at start

SURFACES:
    --bind <ADDR>            Status bridge address (default: 127.0.0.1:7000)
    --no-bridge              Disable the status bridge
    --metrics-addr <ADDR>    Serve Prometheus metrics (e.g. 0.0.0.0:9090)
    --audit-log <PATH>       Append audit events to a JSONL file

LOGGING:
    --json-logs              Emit JSON-formatted logs
    --log-dir <DIR>          Also write daily-rolling log files to DIR

SIMULATION:
    --sim-source-volts <V>   Simulated channel 1 voltage (default: 12.0)
    --sim-ovp-volts <V>      Simulated channel 2 OVP level (default: 40.5)

    -h, --help               Print help

EXIT STATUS:
    0  stopped by operator or cycle limit
    1  startup error
    2  aborted by an unrecoverable fault
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("dcp-follower")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_full_command_line() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--address",
            "10.0.0.5",
            "--offset",
            "-1.5",
            "--current",
            "0.2",
            "--interval-ms",
            "250",
            "--max-cycles",
            "40",
            "--no-bridge",
            "--json-logs",
        ]))
        .expect("valid arguments");

        assert_eq!(cfg.address.as_deref(), Some("10.0.0.5"));
        assert!(!cfg.bridge_enabled);
        assert!(cfg.json_logs);

        let follower = cfg.apply_overrides(FollowerConfig::default());
        assert_eq!(follower.voltage_offset, -1.5);
        assert_eq!(follower.target_current, 0.2);
        assert_eq!(follower.sample_interval_s, 0.25);
        assert_eq!(follower.max_cycles, Some(40));
    }

    #[test]
    fn help_short_circuits() {
        let cfg = RuntimeConfig::from_args(&args(&["-h"])).expect("help");
        assert!(cfg.show_help);
    }

    #[test]
    fn requires_one_instrument_mode() {
        assert_eq!(
            RuntimeConfig::from_args(&args(&[])).unwrap_err(),
            ArgError::InstrumentMode
        );
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--simulate", "--address", "x"])).unwrap_err(),
            ArgError::InstrumentMode
        );
    }

    #[test]
    fn rejects_bad_values_and_unknown_flags() {
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--simulate", "--offset", "abc"])).unwrap_err(),
            ArgError::InvalidValue {
                flag: "--offset".to_string(),
                value: "abc".to_string(),
            }
        );
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--simulate", "--current"])).unwrap_err(),
            ArgError::MissingValue {
                flag: "--current".to_string(),
            }
        );
        assert_eq!(
            RuntimeConfig::from_args(&args(&["--simulate", "--turbo"])).unwrap_err(),
            ArgError::Unknown("--turbo".to_string())
        );
    }
}
