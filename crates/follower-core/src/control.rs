//! Front-end facing control surface: start a follower, ask for its status,
//! request a stop, collect the outcome.

use crate::config::FollowerConfig;
use crate::controller::ControllerState;
use crate::error::{AbortReason, FatalAbort, StartError};
use crate::scheduler::{LoopStats, PollLoop, StopReport};
use crate::status::{StatusExchange, StatusSnapshot};
use crate::timebase::TimeBase;
use crate::transport::Session;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct FollowerHandle {
    exchange: Arc<StatusExchange>,
    thread: JoinHandle<Result<StopReport, FatalAbort>>,
}

/// Validate `config` and run the follower loop on its own thread.
///
/// The session moves into the loop thread; nothing else talks to the
/// instrument while the follower runs.
pub fn start<S>(session: S, config: FollowerConfig) -> Result<FollowerHandle, StartError>
where
    S: Session + 'static,
{
    start_with(session, config, Arc::new(StatusExchange::new()), TimeBase::new())
}

pub fn start_with<S>(
    session: S,
    config: FollowerConfig,
    exchange: Arc<StatusExchange>,
    timebase: TimeBase,
) -> Result<FollowerHandle, StartError>
where
    S: Session + 'static,
{
    config.validate()?;
    let exchange_loop = Arc::clone(&exchange);
    let thread = thread::Builder::new()
        .name("follower-loop".to_string())
        .spawn(move || PollLoop::new(session, config, exchange_loop, timebase).run())?;
    Ok(FollowerHandle { exchange, thread })
}

impl FollowerHandle {
    /// Ask the loop to stop at the top of its next cycle.
    pub fn stop(&self) {
        self.exchange.request_stop();
    }

    pub fn status(&self) -> StatusSnapshot {
        self.exchange.read()
    }

    pub fn exchange(&self) -> Arc<StatusExchange> {
        Arc::clone(&self.exchange)
    }

    /// Wait for the loop to finish.
    pub fn join(self) -> Result<StopReport, FatalAbort> {
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(FatalAbort {
                reason: AbortReason::LoopPanicked,
                state: ControllerState::default(),
                stats: LoopStats::default(),
            }),
        }
    }
}
