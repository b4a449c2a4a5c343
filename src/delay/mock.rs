//! Deterministic delay for tests.
//!
//! Records every requested pause and reports it as waited without sleeping.

use super::Delay;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fake [`Delay`] that returns instantly and logs what it was asked for.
///
/// # Example
///
/// ```
/// use calib_daq::delay::{Delay, MockDelay};
///
/// # tokio_test_block(async {
/// let delay = MockDelay::new();
/// assert_eq!(delay.delay_secs(26).await.unwrap(), 26);
/// assert_eq!(delay.durations(), vec![26]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MockDelay {
    durations: Arc<Mutex<Vec<u64>>>,
    targets: Arc<Mutex<Vec<DateTime<Local>>>>,
    should_fail_next: Arc<AtomicBool>,
}

impl MockDelay {
    /// Create a fake delay with empty logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `delay_secs` argument, in call order.
    pub fn durations(&self) -> Vec<u64> {
        self.durations.lock().clone()
    }

    /// Sum of every `delay_secs` argument.
    pub fn total_seconds(&self) -> u64 {
        self.durations.lock().iter().sum()
    }

    /// Every `delay_until` target, in call order.
    pub fn targets(&self) -> Vec<DateTime<Local>> {
        self.targets.lock().clone()
    }

    /// Make the next delay call fail.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> AppResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Io(std::io::Error::other("injected delay failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Delay for MockDelay {
    async fn delay_secs(&self, seconds: u64) -> AppResult<u64> {
        self.check_failure()?;
        self.durations.lock().push(seconds);
        Ok(seconds)
    }

    async fn delay_until(&self, target: DateTime<Local>) -> AppResult<()> {
        self.check_failure()?;
        self.targets.lock().push(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_delay_logs_calls() {
        let delay = MockDelay::new();
        delay.delay_secs(26).await.unwrap();
        delay.delay_secs(1).await.unwrap();
        assert_eq!(delay.durations(), vec![26, 1]);
        assert_eq!(delay.total_seconds(), 27);
    }

    #[tokio::test]
    async fn test_mock_delay_failure_injection() {
        let delay = MockDelay::new();
        delay.inject_next_failure();
        assert!(delay.delay_secs(5).await.is_err());
        // Failure should be consumed
        assert!(delay.delay_secs(5).await.is_ok());
        assert_eq!(delay.durations(), vec![5]);
    }
}
