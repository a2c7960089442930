pub mod bridge;
pub mod metrics;
pub mod protocol;
pub mod scpi_tcp;

pub use bridge::{Bridge, BridgeConfig, BridgeError};
pub use metrics::{init_metrics, record_snapshot, record_stats_delta, serve_metrics, MetricsError};
pub use protocol::{IncomingMessage, ProtocolVersion, StatusMsg};
pub use scpi_tcp::{ScpiTcpConnector, ScpiTcpSession, DEFAULT_SCPI_PORT};
