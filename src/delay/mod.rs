//! Wait/sleep service.
//!
//! Every blocking pause in a run (cooling poll interval, exposure blind wait,
//! exposure poll interval, delayed start) goes through the [`Delay`] trait so
//! tests can substitute [`mock::MockDelay`] and run without real time passing.

pub mod mock;

pub use mock::MockDelay;

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::time::Duration;
use tracing::{debug, trace};

/// Pause for a number of seconds, or until a wall-clock time.
#[async_trait]
pub trait Delay: Send + Sync {
    /// Sleep for `seconds` whole seconds and return how many seconds were waited.
    ///
    /// Callers accumulate the returned value rather than the requested one, so a
    /// fake can report time without spending it.
    async fn delay_secs(&self, seconds: u64) -> AppResult<u64>;

    /// Sleep until `target`. A target in the past returns immediately.
    async fn delay_until(&self, target: DateTime<Local>) -> AppResult<()>;
}

/// Production delay backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDelay;

impl TokioDelay {
    /// Create the tokio-backed delay service.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Delay for TokioDelay {
    async fn delay_secs(&self, seconds: u64) -> AppResult<u64> {
        trace!(seconds, "delaying");
        if seconds == 0 {
            return Ok(0);
        }
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(seconds)
    }

    async fn delay_until(&self, target: DateTime<Local>) -> AppResult<()> {
        let remaining = target.signed_duration_since(Local::now());
        match remaining.to_std() {
            Ok(wait) if !wait.is_zero() => {
                debug!(%target, ?wait, "waiting for start time");
                tokio::time::sleep(wait).await;
                debug!("reached start time");
            }
            _ => debug!(%target, "start time already passed"),
        }
        Ok(())
    }
}
