//! Capture session orchestration.
//!
//! A [`Session`] sequences one run end to end:
//!
//! 1. wait for the delayed start time, if any
//! 2. open the logical connection to TheSkyX
//! 3. cool the camera to its target, if requested
//! 4. rebuild the capture plan and merge persisted progress
//! 5. measure download times for binning factors not yet measured
//! 6. capture the bias and dark passes, checkpointing after every frame
//! 7. switch the cooler off (if configured) and close
//!
//! Killing the process at any point is safe. The next run rebuilds the plan,
//! adopts the checkpointed counts and carries on from the next missing frame.
//!
//! ## Cooling
//!
//! ```text
//! Idle -> CoolingRequested -> Stabilizing -> Stable
//!                                         \-> TimedOut
//! ```
//!
//! While frames are captured with `abort_on_drift` set, the temperature is read
//! before every frame and the run is abandoned once it strays `abort_tolerance`
//! degrees or more from the target.

use crate::config::{CoolingConfig, Settings};
use crate::delay::{Delay, TokioDelay};
use crate::error::{AppResult, DaqError, FrameKind};
use crate::plan::CapturePlan;
use crate::skyx::{CameraService, SkyxCamera, TcpDriver};
use crate::specs::{BiasSpec, DarkSpec, FrameSetSpec};
use crate::state_file::{JsonPlanStore, PlanStore};
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of the cooler towards its start temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolingState {
    /// Cooler not requested, or not yet started
    Idle,
    /// Cooler switched on with the target set point
    CoolingRequested,
    /// Polling until the temperature is within tolerance
    Stabilizing,
    /// Temperature within tolerance, capture may start
    Stable,
    /// Maximum wait exceeded
    TimedOut,
}

/// One capture run against one TheSkyX server.
pub struct Session {
    settings: Settings,
    camera: Box<dyn CameraService>,
    store: Box<dyn PlanStore>,
    delay: Arc<dyn Delay>,
    is_connected: bool,
    cooling_state: CoolingState,
}

impl Session {
    /// Session talking to the configured server, checkpointing to the configured state file.
    pub fn new(settings: Settings) -> Self {
        let delay: Arc<dyn Delay> = Arc::new(TokioDelay::new());
        let driver = TcpDriver::new(settings.exchange_timeout());
        let camera = SkyxCamera::new(Box::new(driver), delay.clone());
        let store = JsonPlanStore::new(settings.state_file_path());
        Self::with_parts(settings, Box::new(camera), Box::new(store), delay)
    }

    /// Session over explicit collaborators.
    pub fn with_parts(
        settings: Settings,
        camera: Box<dyn CameraService>,
        store: Box<dyn PlanStore>,
        delay: Arc<dyn Delay>,
    ) -> Self {
        Self {
            settings,
            camera,
            store,
            delay,
            is_connected: false,
            cooling_state: CoolingState::Idle,
        }
    }

    /// Settings this session runs with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the logical connection is open.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Where the cooler got to.
    pub fn cooling_state(&self) -> CoolingState {
        self.cooling_state
    }

    fn cooling(&self) -> &CoolingConfig {
        &self.settings.cooling
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected {
            Ok(())
        } else {
            Err(DaqError::NotConnected)
        }
    }

    /// Run the whole capture: delayed start, connect, cool, capture, shut down.
    ///
    /// Shutdown runs whether or not the capture succeeded. When both fail the
    /// capture error is returned and the shutdown error is logged.
    pub async fn run(&mut self) -> AppResult<CapturePlan> {
        let bias = self.settings.bias_specs()?;
        let darks = self.settings.dark_specs()?;

        if let Some(start) = self.settings.start_time()? {
            self.delay_start(start).await?;
        }

        self.connect_to_server().await?;
        let result = self.cool_and_capture(&bias, &darks).await;
        let shutdown = self.shutdown().await;

        match (result, shutdown) {
            (Ok(plan), Ok(())) => Ok(plan),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(secondary)) => {
                warn!(error = %secondary, "session shutdown also failed");
                Err(e)
            }
        }
    }

    async fn cool_and_capture(
        &mut self,
        bias: &[BiasSpec],
        darks: &[DarkSpec],
    ) -> AppResult<CapturePlan> {
        self.cool_for_start().await?;
        self.capture_frames(bias, darks).await
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        let stopped = self.stop_cooling().await;
        let closed = self.close().await;
        match (stopped, closed) {
            (Err(e), Err(secondary)) => {
                warn!(error = %secondary, "closing session failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), closed) => closed,
        }
    }

    /// Sleep until the requested start time.
    pub async fn delay_start(&self, start: DateTime<Local>) -> AppResult<()> {
        info!(%start, "delaying start");
        self.delay.delay_until(start).await
    }

    /// Open the logical connection. Idempotent.
    pub async fn connect_to_server(&mut self) -> AppResult<()> {
        if self.is_connected {
            debug!("session already connected");
            return Ok(());
        }
        let server = &self.settings.server;
        info!(address = %server.address, port = server.port, "connecting to TheSkyX");
        self.camera.connect(&server.address, server.port).await?;
        self.is_connected = true;
        Ok(())
    }

    /// Close the logical connection. Idempotent.
    pub async fn close(&mut self) -> AppResult<()> {
        if !self.is_connected {
            debug!("session already closed");
            return Ok(());
        }
        self.camera.close().await?;
        self.is_connected = false;
        Ok(())
    }

    /// Switch the cooler on and wait for the target temperature, if cooling is requested.
    pub async fn cool_for_start(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        if !self.cooling().use_cooler {
            debug!("cooler not in use");
            self.cooling_state = CoolingState::Idle;
            return Ok(());
        }

        let target = self.cooling().target;
        self.camera.start_cooling(target).await?;
        self.cooling_state = CoolingState::CoolingRequested;

        // First reading after switching on is unreliable.
        let ignored = self.camera.get_temperature().await?;
        debug!(ignored, "discarded first temperature reading");

        self.cooling_state = CoolingState::Stabilizing;
        match self.wait_for_target_temperature().await {
            Ok(()) => {
                self.cooling_state = CoolingState::Stable;
                Ok(())
            }
            Err(e) => {
                if matches!(e, DaqError::CoolingTimeout { .. }) {
                    self.cooling_state = CoolingState::TimedOut;
                }
                Err(e)
            }
        }
    }

    async fn wait_for_target_temperature(&self) -> AppResult<()> {
        let cooling = self.cooling();
        let maximum_secs = u64::from(cooling.max_wait_minutes) * 60;
        let mut elapsed: u64 = 0;
        loop {
            let current = self.camera.get_temperature().await?;
            if (current - cooling.target).abs() <= cooling.start_tolerance {
                info!(
                    temperature = current,
                    target = cooling.target,
                    "camera reached target temperature"
                );
                return Ok(());
            }
            info!(
                temperature = format_args!("{:.1}", current),
                target = format_args!("{:.1}", cooling.target),
                wait_secs = cooling.poll_interval_secs,
                "waiting for cooling to stabilize"
            );
            elapsed += self.delay.delay_secs(cooling.poll_interval_secs).await?;
            if elapsed >= maximum_secs {
                return Err(DaqError::CoolingTimeout {
                    minutes: cooling.max_wait_minutes,
                });
            }
        }
    }

    /// Switch the cooler off at the end of the session, if configured to.
    pub async fn stop_cooling(&self) -> AppResult<()> {
        if !(self.cooling().use_cooler && self.cooling().off_at_end) || !self.is_connected {
            return Ok(());
        }
        self.camera.stop_cooling().await?;
        info!("cooler switched off at end of session");
        Ok(())
    }

    /// Fresh plan for the requested sets, merged with persisted progress.
    ///
    /// With `clear_done` set, progress is reset after the merge so every set
    /// starts over while measured download times are kept.
    pub async fn build_plan(&self, bias: &[BiasSpec], darks: &[DarkSpec]) -> AppResult<CapturePlan> {
        let mut plan = CapturePlan::from_specs(bias, darks);
        self.store.merge_from_store(&mut plan).await?;
        if self.settings.frames.clear_done {
            info!("clearing progress from earlier runs");
            plan.clear_done();
        }
        debug!(?plan, "capture plan");
        Ok(plan)
    }

    /// Measure the download time of every binning factor still unmeasured.
    pub async fn update_download_times(&self, plan: &mut CapturePlan) -> AppResult<()> {
        for binning in plan.unmeasured_binnings() {
            info!(binning, "measuring download time");
            let seconds = self.camera.measure_download_time(binning).await?;
            debug!(binning, seconds, "download time measured");
            plan.set_download_time(binning, seconds);
        }
        Ok(())
    }

    /// Capture every outstanding frame of the requested sets and return the final plan.
    pub async fn capture_frames(
        &self,
        bias: &[BiasSpec],
        darks: &[DarkSpec],
    ) -> AppResult<CapturePlan> {
        self.ensure_connected()?;
        let mut plan = self.build_plan(bias, darks).await?;
        self.update_download_times(&mut plan).await?;
        self.run_passes(&mut plan).await?;
        self.store.save(&plan).await?;
        info!("capture complete");
        Ok(plan)
    }

    /// Run the bias and dark passes in the configured order.
    pub async fn run_passes(&self, plan: &mut CapturePlan) -> AppResult<()> {
        self.ensure_connected()?;
        let frames = &self.settings.frames;
        let passes = if frames.darks_first {
            [FrameKind::Dark, FrameKind::Bias]
        } else {
            [FrameKind::Bias, FrameKind::Dark]
        };

        for kind in passes {
            let (skipped, sets) = match kind {
                FrameKind::Bias => (frames.no_bias, plan.bias_sets()),
                FrameKind::Dark => (frames.no_dark, plan.dark_sets()),
            };
            if skipped {
                info!(%kind, "skipping {} frames", kind);
                continue;
            }
            for set in sets {
                self.capture_set(plan, &set).await?;
            }
        }
        Ok(())
    }

    async fn capture_set(&self, plan: &mut CapturePlan, set: &FrameSetSpec) -> AppResult<()> {
        let key = set.key();
        let needed = plan.remaining(set);
        if needed == 0 {
            info!(set = %key, "already have all {} frames", set.count());
            return Ok(());
        }
        info!(set = %key, needed, of = set.count(), "capturing frame set");

        let download_time = plan.download_time(set.binning());
        let mut taken = 0;
        while plan.remaining(set) > 0 {
            if let Some(temperature) = self.check_abandon_for_cooling().await? {
                let err = DaqError::DriftAbort {
                    kind: frame_kind(set),
                    temperature,
                    target: self.cooling().target,
                };
                warn!("{}", err);
                return Err(err);
            }

            taken += 1;
            debug!(set = %key, frame = taken, of = needed, "capturing frame");
            match set {
                FrameSetSpec::Dark(dark) => {
                    self.camera
                        .capture_dark_frame(dark.binning, dark.seconds, download_time)
                        .await?
                }
                FrameSetSpec::Bias(bias) => {
                    self.camera
                        .capture_bias_frame(bias.binning, download_time)
                        .await?
                }
            }
            plan.record_frame(set);
            self.store.save(plan).await?;
        }
        Ok(())
    }

    /// Read the temperature if drift aborts are enabled.
    ///
    /// Returns the offending temperature when it is `abort_tolerance` degrees or
    /// more from target, and `None` when capture may continue.
    pub async fn check_abandon_for_cooling(&self) -> AppResult<Option<f64>> {
        let cooling = self.cooling();
        if !(cooling.use_cooler && cooling.abort_on_drift) {
            return Ok(None);
        }
        let temperature = self.camera.get_temperature().await?;
        debug!(temperature, target = cooling.target, "drift check");
        if (temperature - cooling.target).abs() >= cooling.abort_tolerance {
            Ok(Some(temperature))
        } else {
            Ok(None)
        }
    }
}

fn frame_kind(set: &FrameSetSpec) -> FrameKind {
    match set {
        FrameSetSpec::Bias(_) => FrameKind::Bias,
        FrameSetSpec::Dark(_) => FrameKind::Dark,
    }
}
