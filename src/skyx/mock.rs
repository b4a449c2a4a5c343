//! Scripted fakes of the TheSkyX driver and camera service.
//!
//! Both fakes log every call as a formatted string (`"capture_bias_frame(1, 2.5)"`),
//! replay scripted temperature readings and let a test inject a one-shot failure
//! for a named operation. Scripted sequences repeat their last value once
//! exhausted, so `[-10.0]` means "always -10".

use super::driver::SkyxDriver;
use super::service::CameraService;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const DEFAULT_TEMPERATURE: f64 = 20.0;
const DEFAULT_DOWNLOAD_SECS: f64 = 2.5;

fn next_scripted<T: Copy>(queue: &mut VecDeque<T>, default: T) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(default)
    } else {
        queue.front().copied().unwrap_or(default)
    }
}

#[derive(Default)]
struct MockState {
    call_log: Vec<String>,
    temperatures: VecDeque<f64>,
    done_sequence: VecDeque<bool>,
    download_times: HashMap<u32, f64>,
    failures: Vec<(String, DaqError)>,
    open: bool,
}

impl MockState {
    fn record(&mut self, operation: &str, call: String) -> AppResult<()> {
        self.call_log.push(call);
        if let Some(index) = self.failures.iter().position(|(op, _)| op == operation) {
            let (_, err) = self.failures.remove(index);
            return Err(err);
        }
        Ok(())
    }

    fn next_temperature(&mut self) -> f64 {
        next_scripted(&mut self.temperatures, DEFAULT_TEMPERATURE)
    }

    fn download_time(&self, binning: u32) -> f64 {
        self.download_times
            .get(&binning)
            .copied()
            .unwrap_or(DEFAULT_DOWNLOAD_SECS)
    }
}

/// Shared call log and scripting used by both fakes.
#[derive(Clone, Default)]
struct Recorder {
    state: Arc<Mutex<MockState>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    fn count_calls(&self, call: &str) -> usize {
        self.state
            .lock()
            .call_log
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .call_log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Fake [`SkyxDriver`] for exercising the camera service without a server.
#[derive(Clone, Default)]
pub struct MockDriver {
    recorder: Recorder,
}

impl MockDriver {
    /// Create a driver that reports 20 C and finishes every exposure on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the answers to `is_exposure_done`.
    pub fn with_done_sequence(self, sequence: &[bool]) -> Self {
        self.recorder.state.lock().done_sequence = sequence.iter().copied().collect();
        self
    }

    /// Script the answers to `get_temperature`.
    pub fn with_temperatures(self, readings: &[f64]) -> Self {
        self.recorder.state.lock().temperatures = readings.iter().copied().collect();
        self
    }

    /// Fix the download time reported for a binning factor.
    pub fn with_download_time(self, binning: u32, seconds: f64) -> Self {
        self.recorder
            .state
            .lock()
            .download_times
            .insert(binning, seconds);
        self
    }

    /// Make the next call of `operation` fail with `err`.
    pub fn inject_failure(&self, operation: &str, err: DaqError) {
        self.recorder
            .state
            .lock()
            .failures
            .push((operation.to_string(), err));
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.recorder.calls()
    }

    /// Number of calls exactly equal to `call`.
    pub fn count_calls(&self, call: &str) -> usize {
        self.recorder.count_calls(call)
    }
}

#[async_trait]
impl SkyxDriver for MockDriver {
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()> {
        let mut state = self.recorder.state.lock();
        state.record("connect", format!("connect({}, {})", server, port))?;
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.recorder.state.lock();
        state.record("close", "close".to_string())?;
        state.open = false;
        Ok(())
    }

    async fn start_cooling(&self, temperature: f64) -> AppResult<()> {
        self.recorder
            .state
            .lock()
            .record("start_cooling", format!("start_cooling({})", temperature))
    }

    async fn stop_cooling(&self) -> AppResult<()> {
        self.recorder
            .state
            .lock()
            .record("stop_cooling", "stop_cooling".to_string())
    }

    async fn get_temperature(&self) -> AppResult<f64> {
        let mut state = self.recorder.state.lock();
        state.record("get_temperature", "get_temperature".to_string())?;
        Ok(state.next_temperature())
    }

    async fn start_dark_exposure(
        &self,
        binning: u32,
        seconds: f64,
        download_hint: f64,
    ) -> AppResult<()> {
        self.recorder.state.lock().record(
            "start_dark_exposure",
            format!("start_dark_exposure({}, {}, {})", binning, seconds, download_hint),
        )
    }

    async fn start_bias_exposure(&self, binning: u32, download_hint: f64) -> AppResult<()> {
        self.recorder.state.lock().record(
            "start_bias_exposure",
            format!("start_bias_exposure({}, {})", binning, download_hint),
        )
    }

    async fn is_exposure_done(&self) -> AppResult<bool> {
        let mut state = self.recorder.state.lock();
        state.record("is_exposure_done", "is_exposure_done".to_string())?;
        Ok(next_scripted(&mut state.done_sequence, true))
    }

    async fn measure_download_time(&self, binning: u32) -> AppResult<f64> {
        let mut state = self.recorder.state.lock();
        state.record(
            "measure_download_time",
            format!("measure_download_time({})", binning),
        )?;
        Ok(state.download_time(binning))
    }
}

/// Fake [`CameraService`] for exercising the session.
///
/// Frame captures complete immediately; the session under test only sees the
/// call log and the scripted temperatures.
#[derive(Clone, Default)]
pub struct MockCamera {
    recorder: Recorder,
}

impl MockCamera {
    /// Create a camera that reports 20 C and a 2.5 s download time at every binning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the answers to `get_temperature`.
    pub fn with_temperatures(self, readings: &[f64]) -> Self {
        self.recorder.state.lock().temperatures = readings.iter().copied().collect();
        self
    }

    /// Fix the download time reported for a binning factor.
    pub fn with_download_time(self, binning: u32, seconds: f64) -> Self {
        self.recorder
            .state
            .lock()
            .download_times
            .insert(binning, seconds);
        self
    }

    /// Make the next call of `operation` fail with `err`.
    pub fn inject_failure(&self, operation: &str, err: DaqError) {
        self.recorder
            .state
            .lock()
            .failures
            .push((operation.to_string(), err));
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.recorder.calls()
    }

    /// Number of calls exactly equal to `call`.
    pub fn count_calls(&self, call: &str) -> usize {
        self.recorder.count_calls(call)
    }

    /// Calls whose text starts with `prefix`, in order.
    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.recorder.calls_with_prefix(prefix)
    }

    /// Frame captures of either kind, in order.
    pub fn captures(&self) -> Vec<String> {
        self.recorder.calls_with_prefix("capture_")
    }

    /// Whether the logical connection is currently open.
    pub fn is_open(&self) -> bool {
        self.recorder.state.lock().open
    }
}

#[async_trait]
impl CameraService for MockCamera {
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()> {
        let mut state = self.recorder.state.lock();
        state.record("connect", format!("connect({}, {})", server, port))?;
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = self.recorder.state.lock();
        state.record("close", "close".to_string())?;
        state.open = false;
        Ok(())
    }

    async fn start_cooling(&self, target: f64) -> AppResult<()> {
        self.recorder
            .state
            .lock()
            .record("start_cooling", format!("start_cooling({})", target))
    }

    async fn stop_cooling(&self) -> AppResult<()> {
        self.recorder
            .state
            .lock()
            .record("stop_cooling", "stop_cooling".to_string())
    }

    async fn get_temperature(&self) -> AppResult<f64> {
        let mut state = self.recorder.state.lock();
        state.record("get_temperature", "get_temperature".to_string())?;
        Ok(state.next_temperature())
    }

    async fn measure_download_time(&self, binning: u32) -> AppResult<f64> {
        let mut state = self.recorder.state.lock();
        state.record(
            "measure_download_time",
            format!("measure_download_time({})", binning),
        )?;
        Ok(state.download_time(binning))
    }

    async fn capture_dark_frame(
        &self,
        binning: u32,
        seconds: f64,
        download_time: f64,
    ) -> AppResult<()> {
        self.recorder.state.lock().record(
            "capture_dark_frame",
            format!("capture_dark_frame({}, {}, {})", binning, seconds, download_time),
        )
    }

    async fn capture_bias_frame(&self, binning: u32, download_time: f64) -> AppResult<()> {
        self.recorder.state.lock().record(
            "capture_bias_frame",
            format!("capture_bias_frame({}, {})", binning, download_time),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_temperatures_repeat_last() {
        let driver = MockDriver::new().with_temperatures(&[-1.0, -5.0]);
        assert_eq!(driver.get_temperature().await.unwrap(), -1.0);
        assert_eq!(driver.get_temperature().await.unwrap(), -5.0);
        assert_eq!(driver.get_temperature().await.unwrap(), -5.0);
        assert_eq!(driver.count_calls("get_temperature"), 3);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let camera = MockCamera::new();
        camera.inject_failure("capture_bias_frame", DaqError::Remote("busy".into()));
        assert!(camera.capture_bias_frame(1, 2.0).await.is_err());
        assert!(camera.capture_bias_frame(1, 2.0).await.is_ok());
        assert_eq!(camera.captures().len(), 2);
    }

    #[tokio::test]
    async fn test_camera_tracks_open_state() {
        let mut camera = MockCamera::new();
        camera.connect("localhost", 3040).await.unwrap();
        assert!(camera.is_open());
        camera.close().await.unwrap();
        assert!(!camera.is_open());
        assert_eq!(camera.calls(), vec!["connect(localhost, 3040)", "close"]);
    }
}
