//! Operator interrupt: SIGINT/SIGTERM (Ctrl+C on Windows) request a clean stop.
//!
//! The first signal asks the loop to finish its cycle and disable the
//! follower output. A second signal exits immediately with status 130.

use follower_core::StatusExchange;
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

pub fn install_stop_handler(exchange: Arc<StatusExchange>) {
    let spawned = thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create signal handler runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                match wait_for_interrupt().await {
                    Ok(signal) => {
                        warn!(signal, "Interrupt received, stopping follower");
                        exchange.request_stop();
                    }
                    Err(e) => {
                        error!("Failed to install signal handlers: {}", e);
                        return;
                    }
                }
                if let Ok(signal) = wait_for_interrupt().await {
                    error!(signal, "Second interrupt, exiting without cleanup");
                    std::process::exit(130);
                }
            });
        });

    if let Err(e) = spawned {
        error!("Failed to spawn signal handler thread: {}", e);
    }
}

#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl_c")
}
