use super::config::ArgError;
use follower_core::{ConfigError, StartError, TransportError};
use follower_io::{BridgeError, MetricsError};
use std::path::PathBuf;
use thiserror::Error;

/// Anything that prevents the follower loop from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Args(#[from] ArgError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("instrument: {0}")]
    Instrument(#[from] TransportError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("status bridge: {0}")]
    Bridge(#[from] BridgeError),
    #[error("audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("follower: {0}")]
    Start(#[from] StartError),
}
