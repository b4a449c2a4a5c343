//! Frame-set specifications.
//!
//! A frame set is a batch of identical exposures requested on the command line or
//! in the settings file, written as `count,binning` for bias frames and
//! `count,seconds,binning` for darks. Each set derives a deterministic key that
//! joins "required" with "done" in the capture plan, so two sets with identical
//! fields share one progress counter.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest binning factor the camera accepts.
pub const MIN_BINNING: u32 = 1;
/// Highest binning factor the camera accepts.
pub const MAX_BINNING: u32 = 8;

/// A requested set of bias frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BiasSpec {
    /// Number of frames wanted.
    pub count: u32,
    /// Binning factor, 1 to 8.
    pub binning: u32,
}

/// A requested set of dark frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DarkSpec {
    /// Number of frames wanted.
    pub count: u32,
    /// Exposure length in seconds.
    pub seconds: f64,
    /// Binning factor, 1 to 8.
    pub binning: u32,
}

/// Either kind of frame set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameSetSpec {
    /// Bias set.
    Bias(BiasSpec),
    /// Dark set.
    Dark(DarkSpec),
}

impl BiasSpec {
    /// Progress-tracking key, `Bias_<count>_<binning>`.
    pub fn key(&self) -> String {
        format!("Bias_{}_{}", self.count, self.binning)
    }
}

impl DarkSpec {
    /// Progress-tracking key, `Dark_<count>_<seconds to 4 places>_<binning>`.
    pub fn key(&self) -> String {
        format!("Dark_{}_{:.4}_{}", self.count, self.seconds, self.binning)
    }
}

impl FrameSetSpec {
    /// Progress-tracking key of the underlying set.
    pub fn key(&self) -> String {
        match self {
            FrameSetSpec::Bias(spec) => spec.key(),
            FrameSetSpec::Dark(spec) => spec.key(),
        }
    }

    /// Number of frames wanted.
    pub fn count(&self) -> u32 {
        match self {
            FrameSetSpec::Bias(spec) => spec.count,
            FrameSetSpec::Dark(spec) => spec.count,
        }
    }

    /// Binning factor.
    pub fn binning(&self) -> u32 {
        match self {
            FrameSetSpec::Bias(spec) => spec.binning,
            FrameSetSpec::Dark(spec) => spec.binning,
        }
    }
}

fn parse_count(kind: &str, field: &str) -> AppResult<u32> {
    let count: i64 = field.parse().map_err(|_| {
        DaqError::Configuration(format!("Invalid count \"{}\" in {} frame spec", field, kind))
    })?;
    if count < 1 {
        return Err(DaqError::Configuration(format!(
            "Invalid count \"{}\" in {} frame spec: must be > 0",
            field, kind
        )));
    }
    u32::try_from(count).map_err(|_| {
        DaqError::Configuration(format!("Count \"{}\" in {} frame spec is too large", field, kind))
    })
}

fn parse_binning(kind: &str, field: &str) -> AppResult<u32> {
    let binning: i64 = field.parse().map_err(|_| {
        DaqError::Configuration(format!("Invalid binning \"{}\" in {} frame spec", field, kind))
    })?;
    if binning < i64::from(MIN_BINNING) || binning > i64::from(MAX_BINNING) {
        return Err(DaqError::Configuration(format!(
            "Invalid binning \"{}\" in {} frame spec: must be {} - {}",
            field, kind, MIN_BINNING, MAX_BINNING
        )));
    }
    Ok(binning as u32)
}

impl FromStr for BiasSpec {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 2 {
            return Err(DaqError::Configuration(format!(
                "invalid bias specification \"{}\", format should be count,binning",
                s
            )));
        }
        Ok(Self {
            count: parse_count("bias", parts[0])?,
            binning: parse_binning("bias", parts[1])?,
        })
    }
}

impl FromStr for DarkSpec {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(DaqError::Configuration(format!(
                "invalid dark specification \"{}\", format should be count,seconds,binning",
                s
            )));
        }
        let count = parse_count("dark", parts[0])?;
        let seconds: f64 = parts[1].parse().map_err(|_| {
            DaqError::Configuration(format!("Invalid exposure \"{}\" in dark frame spec", parts[1]))
        })?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid exposure \"{}\" in dark frame spec: must be > 0",
                parts[1]
            )));
        }
        Ok(Self {
            count,
            seconds,
            binning: parse_binning("dark", parts[2])?,
        })
    }
}

impl fmt::Display for BiasSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.count, self.binning)
    }
}

impl fmt::Display for DarkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.count, self.seconds, self.binning)
    }
}

impl From<BiasSpec> for String {
    fn from(spec: BiasSpec) -> Self {
        spec.to_string()
    }
}

impl From<DarkSpec> for String {
    fn from(spec: DarkSpec) -> Self {
        spec.to_string()
    }
}

impl TryFrom<String> for BiasSpec {
    type Error = DaqError;

    fn try_from(value: String) -> AppResult<Self> {
        value.parse()
    }
}

impl TryFrom<String> for DarkSpec {
    type Error = DaqError;

    fn try_from(value: String) -> AppResult<Self> {
        value.parse()
    }
}

/// Parse every bias string, failing on the first bad one.
pub fn parse_bias_specs<S: AsRef<str>>(strings: &[S]) -> AppResult<Vec<BiasSpec>> {
    strings.iter().map(|s| s.as_ref().parse()).collect()
}

/// Parse every dark string, failing on the first bad one.
pub fn parse_dark_specs<S: AsRef<str>>(strings: &[S]) -> AppResult<Vec<DarkSpec>> {
    strings.iter().map(|s| s.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bias() {
        let spec: BiasSpec = "16, 2".parse().unwrap();
        assert_eq!(spec, BiasSpec { count: 16, binning: 2 });
        assert_eq!(spec.key(), "Bias_16_2");
    }

    #[test]
    fn test_parse_dark() {
        let spec: DarkSpec = "10,30.5,1".parse().unwrap();
        assert_eq!(spec.count, 10);
        assert_eq!(spec.seconds, 30.5);
        assert_eq!(spec.binning, 1);
        assert_eq!(spec.key(), "Dark_10_30.5000_1");
    }

    #[test]
    fn test_bias_rejects_bad_input() {
        for bad in ["", "5", "5,1,1", "x,1", "0,1", "-3,1", "5,0", "5,9", "5,two"] {
            let result: AppResult<BiasSpec> = bad.parse();
            assert!(result.is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_dark_rejects_bad_input() {
        for bad in ["5,10", "5,0,1", "5,-1,1", "5,abc,1", "0,10,1", "5,10,9", "5,10,1,1"] {
            let result: AppResult<DarkSpec> = bad.parse();
            assert!(result.is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_error_names_field() {
        let err = "5,10,12".parse::<DarkSpec>().unwrap_err();
        assert!(err.to_string().contains("binning \"12\""));
    }

    #[test]
    fn test_identical_specs_share_key() {
        let a: DarkSpec = "5,300,1".parse().unwrap();
        let b: DarkSpec = "5, 300.0 ,1".parse().unwrap();
        assert_eq!(a.key(), b.key());
        let c: DarkSpec = "6,300,1".parse().unwrap();
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_serializes_as_spec_string() {
        let spec = DarkSpec {
            count: 3,
            seconds: 20.0,
            binning: 2,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"3,20,2\"");
        let back: DarkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_parse_list_stops_on_first_error() {
        let result = parse_bias_specs(&["5,1", "oops", "5,2"]);
        assert!(result.is_err());
        let ok = parse_dark_specs(&["5,10,1", "2,60,2"]).unwrap();
        assert_eq!(ok.len(), 2);
    }
}
