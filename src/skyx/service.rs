//! High-level camera service over the TheSkyX driver.
//!
//! TheSkyX sends no completion notification for an exposure, so capturing a
//! frame is estimated in two phases: one blind sleep long enough for the exposure
//! plus its download, then short polls of `IsExposureComplete` until it reports
//! done or the poll budget runs out.
//!
//! | phase | duration |
//! |---|---|
//! | blind wait | `round(exposure + download + 0.5)` seconds |
//! | polling | every 1 s, up to `(exposure + download) * 5` seconds |
//!
//! Bias frames use a nominal 0.1 s exposure in place of the exposure time.

use super::driver::{SkyxDriver, BIAS_EXPOSURE_SECS};
use crate::delay::Delay;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Slack added to the blind wait, in seconds.
pub const AND_A_LITTLE_EXTRA: f64 = 0.5;
/// Seconds between completion polls.
pub const POLL_INTERVAL_SECS: u64 = 1;
/// How much longer than exposure plus download to keep polling.
pub const TIMEOUT_FACTOR: f64 = 5.0;

/// Whole seconds to sleep before the first completion poll.
pub fn blind_wait_secs(exposure: f64, download_time: f64) -> u64 {
    (exposure + download_time + AND_A_LITTLE_EXTRA).round().max(0.0) as u64
}

/// Seconds of polling allowed after the blind wait before giving up.
pub fn poll_budget_secs(exposure: f64, download_time: f64) -> f64 {
    (exposure + download_time) * TIMEOUT_FACTOR
}

/// Camera operations the session needs, with frame capture run to completion.
#[async_trait]
pub trait CameraService: Send + Sync {
    /// Open the logical connection. Idempotent.
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()>;

    /// Close the logical connection. Idempotent.
    async fn close(&mut self) -> AppResult<()>;

    /// Turn on the cooler with the given target temperature.
    async fn start_cooling(&self, target: f64) -> AppResult<()>;

    /// Turn off the cooler.
    async fn stop_cooling(&self) -> AppResult<()>;

    /// Current sensor temperature.
    async fn get_temperature(&self) -> AppResult<f64>;

    /// Measure the image download time at a binning factor.
    async fn measure_download_time(&self, binning: u32) -> AppResult<f64>;

    /// Take one dark frame and wait until it has downloaded.
    async fn capture_dark_frame(&self, binning: u32, seconds: f64, download_time: f64)
        -> AppResult<()>;

    /// Take one bias frame and wait until it has downloaded.
    async fn capture_bias_frame(&self, binning: u32, download_time: f64) -> AppResult<()>;
}

/// [`CameraService`] backed by a [`SkyxDriver`] and a [`Delay`].
pub struct SkyxCamera {
    driver: Box<dyn SkyxDriver>,
    delay: Arc<dyn Delay>,
    is_open: bool,
}

impl SkyxCamera {
    /// Wrap a driver. The camera starts closed.
    pub fn new(driver: Box<dyn SkyxDriver>, delay: Arc<dyn Delay>) -> Self {
        Self {
            driver,
            delay,
            is_open: false,
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(DaqError::NotConnected)
        }
    }

    /// Blind wait, then poll until the driver reports the exposure done.
    async fn wait_for_exposure(&self, exposure: f64, download_time: f64) -> AppResult<()> {
        let blind = blind_wait_secs(exposure, download_time);
        trace!(blind, "exposure started, waiting");
        self.delay.delay_secs(blind).await?;

        let budget = poll_budget_secs(exposure, download_time);
        let mut waited: u64 = 0;
        loop {
            if self.driver.is_exposure_done().await? {
                trace!(waited, "capture is done");
                return Ok(());
            }
            if waited as f64 > budget {
                return Err(DaqError::ExposureTimeout { waited });
            }
            trace!(waited, "camera not finished, polling again");
            waited += self.delay.delay_secs(POLL_INTERVAL_SECS).await?;
        }
    }
}

#[async_trait]
impl CameraService for SkyxCamera {
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()> {
        if self.is_open {
            debug!(server, port, "camera service already connected");
            return Ok(());
        }
        self.driver.connect(server, port).await?;
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.is_open {
            debug!("camera service not open");
            return Ok(());
        }
        self.driver.close().await?;
        self.is_open = false;
        Ok(())
    }

    async fn start_cooling(&self, target: f64) -> AppResult<()> {
        self.ensure_open()?;
        self.driver.start_cooling(target).await
    }

    async fn stop_cooling(&self) -> AppResult<()> {
        self.ensure_open()?;
        self.driver.stop_cooling().await
    }

    async fn get_temperature(&self) -> AppResult<f64> {
        self.ensure_open()?;
        self.driver.get_temperature().await
    }

    async fn measure_download_time(&self, binning: u32) -> AppResult<f64> {
        self.ensure_open()?;
        self.driver.measure_download_time(binning).await
    }

    async fn capture_dark_frame(
        &self,
        binning: u32,
        seconds: f64,
        download_time: f64,
    ) -> AppResult<()> {
        self.ensure_open()?;
        self.driver
            .start_dark_exposure(binning, seconds, download_time)
            .await?;
        self.wait_for_exposure(seconds, download_time).await
    }

    async fn capture_bias_frame(&self, binning: u32, download_time: f64) -> AppResult<()> {
        self.ensure_open()?;
        self.driver
            .start_bias_exposure(binning, download_time)
            .await?;
        self.wait_for_exposure(BIAS_EXPOSURE_SECS, download_time)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::MockDelay;
    use crate::skyx::mock::MockDriver;

    async fn open_camera(driver: MockDriver, delay: MockDelay) -> SkyxCamera {
        let mut camera = SkyxCamera::new(Box::new(driver), Arc::new(delay));
        camera.connect("localhost", 3040).await.unwrap();
        camera
    }

    #[test]
    fn test_wait_bounds() {
        assert_eq!(blind_wait_secs(20.0, 5.0), 26);
        assert_eq!(poll_budget_secs(20.0, 5.0), 125.0);
        assert_eq!(blind_wait_secs(BIAS_EXPOSURE_SECS, 2.0), 3);
    }

    #[tokio::test]
    async fn test_dark_frame_ready_on_time() {
        let driver = MockDriver::new().with_done_sequence(&[true]);
        let delay = MockDelay::new();
        let camera = open_camera(driver.clone(), delay.clone()).await;

        camera.capture_dark_frame(1, 20.0, 5.0).await.unwrap();

        assert_eq!(delay.durations(), vec![26]);
        assert_eq!(driver.count_calls("start_dark_exposure(1, 20, 5)"), 1);
        assert_eq!(driver.count_calls("is_exposure_done"), 1);
    }

    #[tokio::test]
    async fn test_dark_frame_requiring_two_extra_waits() {
        let driver = MockDriver::new().with_done_sequence(&[false, false, true]);
        let delay = MockDelay::new();
        let camera = open_camera(driver.clone(), delay.clone()).await;

        camera.capture_dark_frame(1, 20.0, 5.0).await.unwrap();

        assert_eq!(delay.durations(), vec![26, 1, 1]);
        assert_eq!(driver.count_calls("is_exposure_done"), 3);
    }

    #[tokio::test]
    async fn test_dark_frame_times_out() {
        let driver = MockDriver::new().with_done_sequence(&[false]);
        let delay = MockDelay::new();
        let camera = open_camera(driver, delay.clone()).await;

        let result = camera.capture_dark_frame(1, 20.0, 5.0).await;
        match result {
            Err(DaqError::ExposureTimeout { waited }) => assert_eq!(waited, 126),
            other => panic!("expected exposure timeout, got {:?}", other),
        }
        let durations = delay.durations();
        assert_eq!(durations[0], 26);
        let polled: u64 = durations[1..].iter().sum();
        assert!(polled > 125);
    }

    #[tokio::test]
    async fn test_bias_frame_uses_nominal_exposure() {
        let driver = MockDriver::new().with_done_sequence(&[false, true]);
        let delay = MockDelay::new();
        let camera = open_camera(driver.clone(), delay.clone()).await;

        camera.capture_bias_frame(2, 3.0).await.unwrap();

        assert_eq!(delay.durations(), vec![4, 1]);
        assert_eq!(driver.count_calls("start_bias_exposure(2, 3)"), 1);
    }

    #[tokio::test]
    async fn test_poll_error_is_propagated() {
        let driver = MockDriver::new().with_done_sequence(&[false]);
        let delay = MockDelay::new();
        let camera = open_camera(driver.clone(), delay).await;
        driver.inject_failure("is_exposure_done", DaqError::Remote("camera busy".into()));

        let result = camera.capture_bias_frame(1, 1.0).await;
        assert!(matches!(result, Err(DaqError::Remote(_))));
    }

    #[tokio::test]
    async fn test_operations_need_open_connection() {
        let camera = SkyxCamera::new(Box::new(MockDriver::new()), Arc::new(MockDelay::new()));
        assert!(matches!(
            camera.get_temperature().await,
            Err(DaqError::NotConnected)
        ));
        assert!(matches!(
            camera.capture_bias_frame(1, 1.0).await,
            Err(DaqError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let driver = MockDriver::new();
        let mut camera = SkyxCamera::new(Box::new(driver.clone()), Arc::new(MockDelay::new()));
        camera.connect("localhost", 3040).await.unwrap();
        camera.connect("localhost", 3040).await.unwrap();
        camera.close().await.unwrap();
        camera.close().await.unwrap();
        assert_eq!(driver.count_calls("connect(localhost, 3040)"), 1);
        assert_eq!(driver.count_calls("close"), 1);
    }
}
