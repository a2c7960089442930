use super::config::RuntimeConfig;
use follower_core::{Connector, Session, SimulatedSupply, SourceProfile, TransportError};
use follower_io::{ScpiTcpConnector, ScpiTcpSession};
use std::time::Duration;
use tracing::info;

/// The session the follower loop drives: a real BB3 socket or the simulator.
pub enum Instrument {
    Simulated(SimulatedSupply),
    Scpi(ScpiTcpSession),
}

impl Instrument {
    pub fn open(config: &RuntimeConfig) -> Result<Self, TransportError> {
        match &config.address {
            Some(address) => {
                info!(address = %address, timeout_ms = config.scpi_timeout_ms, "Connecting to instrument");
                let connector = ScpiTcpConnector {
                    timeout: Duration::from_millis(config.scpi_timeout_ms),
                };
                Ok(Self::Scpi(connector.connect(address)?))
            }
            None => {
                let mut sim = SimulatedSupply::new()
                    .with_source(SourceProfile::Steady(config.sim_source_volts));
                if let Some(ovp) = config.sim_ovp_volts {
                    sim = sim.with_ovp_level(ovp);
                }
                info!(
                    source_volts = config.sim_source_volts,
                    ovp_volts = ?config.sim_ovp_volts,
                    "Using simulated instrument"
                );
                Ok(Self::Simulated(sim))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simulated(_) => "simulated",
            Self::Scpi(_) => "scpi_tcp",
        }
    }
}

impl Session for Instrument {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        match self {
            Self::Simulated(s) => s.query(command),
            Self::Scpi(s) => s.query(command),
        }
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        match self {
            Self::Simulated(s) => s.write(command),
            Self::Scpi(s) => s.write(command),
        }
    }
}
