//! Durable storage for the capture plan.
//!
//! [`JsonPlanStore`] keeps the plan in a single JSON file. Every save writes a
//! sibling temporary file and renames it over the old one while holding a
//! process-wide lock, so a crash mid-write leaves the previous checkpoint intact.
//! [`MemoryPlanStore`] keeps every saved snapshot in memory for tests.

use crate::error::{AppResult, DaqError};
use crate::plan::CapturePlan;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Serializes state-file writers within the process.
static STATE_FILE_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

/// Extension given to state files.
pub const STATE_FILE_EXTENSION: &str = "state";

/// Where a capture plan is checkpointed.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Persist the whole plan.
    async fn save(&self, plan: &CapturePlan) -> AppResult<()>;

    /// Read the persisted plan. `None` means no prior progress.
    async fn load(&self) -> AppResult<Option<CapturePlan>>;

    /// Forget the persisted plan. Returns whether anything was removed.
    async fn clear(&self) -> AppResult<bool>;

    /// Overlay any persisted progress onto `plan`.
    async fn merge_from_store(&self, plan: &mut CapturePlan) -> AppResult<()> {
        match self.load().await? {
            Some(persisted) => {
                debug!("merging persisted progress");
                plan.merge_progress(&persisted);
            }
            None => debug!("no persisted progress"),
        }
        Ok(())
    }
}

/// State file path for a base name.
///
/// When `qualify` is set the cooling target is folded into the name so progress
/// made at one temperature is never resumed at another: base `calib_daq` with
/// target -10 gives `calib_daq_-10_000.state`.
pub fn state_file_path(base: &Path, target: f64, qualify: bool) -> PathBuf {
    let stem = base.as_os_str().to_string_lossy();
    let name = if qualify {
        let temp = format!("{:.3}", target).replace('.', "_");
        format!("{}_{}.{}", stem, temp, STATE_FILE_EXTENSION)
    } else {
        format!("{}.{}", stem, STATE_FILE_EXTENSION)
    };
    PathBuf::from(name)
}

/// Plan store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonPlanStore {
    path: PathBuf,
}

impl JsonPlanStore {
    /// Store the plan at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_error(&self, e: impl std::fmt::Display) -> DaqError {
        DaqError::Persistence(format!("{}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl PlanStore for JsonPlanStore {
    async fn save(&self, plan: &CapturePlan) -> AppResult<()> {
        let contents = serde_json::to_string_pretty(plan).map_err(|e| self.write_error(e))?;

        let _guard = STATE_FILE_LOCK.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_error(e))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, contents)
            .await
            .map_err(|e| self.write_error(e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.write_error(e))?;
        trace!(path = %self.path.display(), "saved capture plan");
        Ok(())
    }

    async fn load(&self) -> AppResult<Option<CapturePlan>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DaqError::Persistence(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let plan = serde_json::from_str(&contents)?;
        Ok(Some(plan))
    }

    async fn clear(&self) -> AppResult<bool> {
        let _guard = STATE_FILE_LOCK.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.write_error(e)),
        }
    }
}

/// In-memory plan store that keeps every saved snapshot.
#[derive(Clone, Default)]
pub struct MemoryPlanStore {
    current: Arc<Mutex<Option<CapturePlan>>>,
    saves: Arc<Mutex<Vec<CapturePlan>>>,
    should_fail_next: Arc<AtomicBool>,
}

impl MemoryPlanStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds `plan`, as if left by an earlier run.
    pub fn with_plan(plan: CapturePlan) -> Self {
        let store = Self::default();
        *store.current.lock() = Some(plan);
        store
    }

    /// Every plan passed to `save`, in order.
    pub fn saves(&self) -> Vec<CapturePlan> {
        self.saves.lock().clone()
    }

    /// The plan a fresh `load` would return.
    pub fn current(&self) -> Option<CapturePlan> {
        self.current.lock().clone()
    }

    /// Make the next save fail.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn save(&self, plan: &CapturePlan) -> AppResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Persistence("injected save failure".to_string()));
        }
        self.saves.lock().push(plan.clone());
        *self.current.lock() = Some(plan.clone());
        Ok(())
    }

    async fn load(&self) -> AppResult<Option<CapturePlan>> {
        Ok(self.current.lock().clone())
    }

    async fn clear(&self) -> AppResult<bool> {
        Ok(self.current.lock().take().is_some())
    }
}
