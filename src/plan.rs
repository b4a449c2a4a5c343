//! The resumable capture plan.
//!
//! A plan is rebuilt at the start of every run from the requested frame sets and
//! then overlaid with whatever progress the state file already records. Progress
//! only ever moves forward: merging takes the larger of the fresh and persisted
//! counts, and sets that are no longer requested are dropped.
//!
//! The plan is serialized as a single JSON object:
//!
//! ```json
//! {
//!   "darksRequired": ["5,300,1"],
//!   "biasRequired": ["16,1"],
//!   "darksDone": { "Dark_5_300.0000_1": 2 },
//!   "biasDone": { "Bias_16_1": 16 },
//!   "downloadTimes": { "1": 2.75 }
//! }
//! ```

use crate::specs::{BiasSpec, DarkSpec, FrameSetSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel download time for a binning factor not yet measured.
pub const UNMEASURED: f64 = 0.0;

/// Required frame sets, per-set progress and measured download times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapturePlan {
    /// Dark sets to capture, in request order, one per key.
    pub darks_required: Vec<DarkSpec>,
    /// Bias sets to capture, in request order, one per key.
    pub bias_required: Vec<BiasSpec>,
    /// Frames already captured per dark set key.
    pub darks_done: BTreeMap<String, u32>,
    /// Frames already captured per bias set key.
    pub bias_done: BTreeMap<String, u32>,
    /// Download seconds per binning factor; `0` means not yet measured.
    pub download_times: BTreeMap<u32, f64>,
}

/// Progress of one frame set, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SetProgress {
    /// The frame set.
    pub spec: FrameSetSpec,
    /// Frames captured so far.
    pub done: u32,
    /// Frames still to capture.
    pub remaining: u32,
}

impl CapturePlan {
    /// Build a fresh plan with zero progress for the requested sets.
    ///
    /// Sets with identical fields collapse into one entry since they share a key.
    pub fn from_specs(bias: &[BiasSpec], darks: &[DarkSpec]) -> Self {
        let mut plan = Self::default();
        for spec in bias {
            if plan.bias_done.contains_key(&spec.key()) {
                continue;
            }
            plan.bias_done.insert(spec.key(), 0);
            plan.download_times.entry(spec.binning).or_insert(UNMEASURED);
            plan.bias_required.push(*spec);
        }
        for spec in darks {
            if plan.darks_done.contains_key(&spec.key()) {
                continue;
            }
            plan.darks_done.insert(spec.key(), 0);
            plan.download_times.entry(spec.binning).or_insert(UNMEASURED);
            plan.darks_required.push(*spec);
        }
        plan
    }

    /// Overlay persisted progress, keeping the larger value everywhere.
    ///
    /// Only keys and binning factors already in this plan are considered, so
    /// stale sets in `persisted` are dropped.
    pub fn merge_progress(&mut self, persisted: &CapturePlan) {
        merge_max(&mut self.bias_done, &persisted.bias_done);
        merge_max(&mut self.darks_done, &persisted.darks_done);
        for (binning, seconds) in self.download_times.iter_mut() {
            if let Some(stored) = persisted.download_times.get(binning) {
                if *stored > *seconds {
                    *seconds = *stored;
                }
            }
        }
    }

    /// Forget all captured frames. Download times are kept.
    pub fn clear_done(&mut self) {
        self.bias_done.values_mut().for_each(|done| *done = 0);
        self.darks_done.values_mut().for_each(|done| *done = 0);
    }

    fn done_map(&self, spec: &FrameSetSpec) -> &BTreeMap<String, u32> {
        match spec {
            FrameSetSpec::Bias(_) => &self.bias_done,
            FrameSetSpec::Dark(_) => &self.darks_done,
        }
    }

    /// Frames captured so far for a set.
    pub fn done(&self, spec: &FrameSetSpec) -> u32 {
        self.done_map(spec).get(&spec.key()).copied().unwrap_or(0)
    }

    /// Frames still needed for a set. Zero when the stored count meets or exceeds the request.
    pub fn remaining(&self, spec: &FrameSetSpec) -> u32 {
        spec.count().saturating_sub(self.done(spec))
    }

    /// Count one more captured frame for a set and return the new total.
    pub fn record_frame(&mut self, spec: &FrameSetSpec) -> u32 {
        let map = match spec {
            FrameSetSpec::Bias(_) => &mut self.bias_done,
            FrameSetSpec::Dark(_) => &mut self.darks_done,
        };
        let done = map.entry(spec.key()).or_insert(0);
        *done += 1;
        *done
    }

    /// Bias sets in request order.
    pub fn bias_sets(&self) -> Vec<FrameSetSpec> {
        self.bias_required
            .iter()
            .copied()
            .map(FrameSetSpec::Bias)
            .collect()
    }

    /// Dark sets in request order.
    pub fn dark_sets(&self) -> Vec<FrameSetSpec> {
        self.darks_required
            .iter()
            .copied()
            .map(FrameSetSpec::Dark)
            .collect()
    }

    /// Binning factors whose download time is still the unmeasured sentinel.
    pub fn unmeasured_binnings(&self) -> Vec<u32> {
        self.download_times
            .iter()
            .filter(|(_, seconds)| **seconds <= UNMEASURED)
            .map(|(binning, _)| *binning)
            .collect()
    }

    /// Measured download time for a binning factor, or the sentinel.
    pub fn download_time(&self, binning: u32) -> f64 {
        self.download_times
            .get(&binning)
            .copied()
            .unwrap_or(UNMEASURED)
    }

    /// Store a measured download time.
    pub fn set_download_time(&mut self, binning: u32, seconds: f64) {
        self.download_times.insert(binning, seconds);
    }

    /// Progress of every set, bias sets first.
    pub fn progress(&self) -> Vec<SetProgress> {
        self.bias_sets()
            .into_iter()
            .chain(self.dark_sets())
            .map(|spec| SetProgress {
                done: self.done(&spec),
                remaining: self.remaining(&spec),
                spec,
            })
            .collect()
    }

    /// True when no set has frames remaining.
    pub fn is_complete(&self) -> bool {
        self.progress().iter().all(|set| set.remaining == 0)
    }
}

fn merge_max(fresh: &mut BTreeMap<String, u32>, persisted: &BTreeMap<String, u32>) {
    for (key, done) in fresh.iter_mut() {
        if let Some(stored) = persisted.get(key) {
            *done = (*done).max(*stored);
        }
    }
}
