//! Interrupted runs resume from the JSON state file.

use calib_daq::config::Settings;
use calib_daq::delay::MockDelay;
use calib_daq::session::Session;
use calib_daq::skyx::MockCamera;
use calib_daq::state_file::{JsonPlanStore, PlanStore};
use std::path::Path;
use std::sync::Arc;

fn settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.frames.bias = vec!["3,1".to_string()];
    settings.frames.darks = vec!["2,30,1".to_string()];
    settings.cooling.use_cooler = true;
    settings.cooling.abort_on_drift = true;
    settings.cooling.target = -10.0;
    settings.state.file = dir.join("calib");
    settings
}

fn session(settings: &Settings, camera: &MockCamera) -> Session {
    Session::with_parts(
        settings.clone(),
        Box::new(camera.clone()),
        Box::new(JsonPlanStore::new(settings.state_file_path())),
        Arc::new(MockDelay::new()),
    )
}

#[tokio::test]
async fn test_interrupted_run_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let store = JsonPlanStore::new(settings.state_file_path());
    assert_eq!(store.path(), dir.path().join("calib_-10_000.state"));

    // Discarded reading, stable poll, then two good frames before drifting.
    let first = MockCamera::new().with_temperatures(&[-10.0, -10.0, -10.0, -10.0, -2.0]);
    let err = session(&settings, &first).run().await.unwrap_err();
    assert!(err.is_drift_abort());
    assert_eq!(first.captures().len(), 2);
    assert_eq!(first.count_calls("close"), 1);

    let saved = store.load().await.unwrap().unwrap();
    assert_eq!(saved.bias_done.get("Bias_3_1"), Some(&2));
    assert_eq!(saved.darks_done.get("Dark_2_30.0000_1"), Some(&0));
    assert_eq!(saved.download_time(1), 2.5);

    let second = MockCamera::new().with_temperatures(&[-10.0]);
    let plan = session(&settings, &second).run().await.unwrap();
    assert!(plan.is_complete());
    assert!(second.calls_with_prefix("measure_download_time").is_empty());
    assert_eq!(
        second.captures(),
        vec![
            "capture_bias_frame(1, 2.5)",
            "capture_dark_frame(1, 30, 2.5)",
            "capture_dark_frame(1, 30, 2.5)",
        ]
    );

    let third = MockCamera::new().with_temperatures(&[-10.0]);
    session(&settings, &third).run().await.unwrap();
    assert!(third.captures().is_empty());
}

#[tokio::test]
async fn test_changed_target_uses_separate_progress() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.cooling.abort_on_drift = false;
    settings.frames.darks.clear();

    let camera = MockCamera::new().with_temperatures(&[-10.0]);
    session(&settings, &camera).run().await.unwrap();
    assert_eq!(camera.captures().len(), 3);

    settings.cooling.target = -15.0;
    let colder = MockCamera::new().with_temperatures(&[-15.0]);
    session(&settings, &colder).run().await.unwrap();
    assert_eq!(colder.captures().len(), 3);
    assert_eq!(colder.count_calls("measure_download_time(1)"), 1);
}

#[tokio::test]
async fn test_reset_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.cooling.use_cooler = false;
    settings.frames.darks.clear();
    let store = JsonPlanStore::new(settings.state_file_path());

    session(&settings, &MockCamera::new()).run().await.unwrap();
    assert!(store.clear().await.unwrap());

    let camera = MockCamera::new();
    session(&settings, &camera).run().await.unwrap();
    assert_eq!(camera.captures().len(), 3);
}
