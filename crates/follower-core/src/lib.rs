pub mod channel;
pub mod commands;
pub mod config;
pub mod control;
pub mod controller;
pub mod detector;
pub mod error;
pub mod reader;
pub mod scheduler;
pub mod setpoint;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod status;
pub mod tags;
pub mod timebase;
pub mod transport;

pub use channel::{ChannelId, ChannelReading};
pub use commands::Command;
pub use config::FollowerConfig;
pub use control::{start, FollowerHandle};
pub use controller::{Action, ControllerState};
pub use detector::{classify, FaultState};
pub use error::{AbortReason, ConfigError, FatalAbort, ProtectionFault, StartError, TransportError};
pub use scheduler::{LoopStats, PollLoop, StopReason, StopReport};
pub use setpoint::{OutputLimits, Setpoint, SetpointViolation, Unvalidated, Validated};
#[cfg(feature = "simulation")]
pub use sim::{SimulatedSupply, SourceProfile};
pub use status::{LoopState, StatusExchange, StatusSnapshot};
pub use timebase::TimeBase;
pub use transport::{Connector, Session};
