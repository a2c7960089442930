mod app;
mod config;
mod error;
mod instrument;
mod logging;
mod signals;
mod telemetry;

pub use app::run_from_args;
