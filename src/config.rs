//! Capture settings using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML settings file
//! 3. Environment variables prefixed with `CALIB_DAQ_`
//! 4. Command-line overrides merged by the binary
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! CALIB_DAQ_SERVER__ADDRESS=192.168.1.20
//! CALIB_DAQ_COOLING__TARGET=-15
//! CALIB_DAQ_LOGGING__VERBOSITY=3
//! ```
//!
//! # Example
//!
//! ```toml
//! [server]
//! address = "observatory.local"
//!
//! [cooling]
//! use_cooler = true
//! target = -15.0
//!
//! [frames]
//! bias = ["64,1"]
//! darks = ["16,300,1", "16,600,1"]
//! ```

use crate::error::{AppResult, DaqError};
use crate::specs::{parse_bias_specs, parse_dark_specs, BiasSpec, DarkSpec};
use crate::state_file::state_file_path;
use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "CALIB_DAQ_";

const MAX_VERBOSITY: u8 = 5;
const MIN_COOL_TO: f64 = -200.0;
const MAX_COOL_TO: f64 = 200.0;
const MAX_TOLERANCE: f64 = 50.0;
const MIN_COOL_WAIT_MINUTES: u32 = 1;
const MAX_COOL_WAIT_MINUTES: u32 = 24 * 60;

/// Labels separated by dots, each 1-63 alphanumerics or inner hyphens.
const HOST_NAME_PATTERN: &str =
    r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*\.?$";

#[allow(clippy::expect_used)]
static HOST_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(HOST_NAME_PATTERN).expect("host name pattern compiles"));

/// Top-level settings for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Console output settings
    pub logging: LoggingConfig,
    /// Where to reach the TheSkyX server
    pub server: ServerConfig,
    /// Camera cooler control
    pub cooling: CoolingConfig,
    /// Delayed start
    pub start: StartConfig,
    /// Frame sets to capture
    pub frames: FramesConfig,
    /// Where progress is checkpointed
    pub state: StateConfig,
}

/// Console output settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 (errors and warnings only) to 5 (everything)
    pub verbosity: u8,
    /// Force debug output regardless of verbosity
    pub debug: bool,
}

/// TheSkyX server location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address, `localhost`, or domain name
    pub address: String,
    /// TCP port of the scripting server
    pub port: u16,
    /// Upper bound on one request/reply exchange, in seconds
    pub exchange_timeout_secs: u64,
}

/// Cooler control. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolingConfig {
    /// Camera has a cooler and it should be used
    pub use_cooler: bool,
    /// Target sensor temperature in degrees C
    pub target: f64,
    /// Capture starts once within this many degrees of target
    pub start_tolerance: f64,
    /// Give up if the target is not reached within this many minutes
    pub max_wait_minutes: u32,
    /// Seconds between temperature checks while cooling
    pub poll_interval_secs: u64,
    /// Stop capturing if the temperature drifts away from target
    pub abort_on_drift: bool,
    /// Drift, in degrees, that stops the capture
    pub abort_tolerance: f64,
    /// Turn the cooler off when the session ends
    pub off_at_end: bool,
}

/// Delayed start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartConfig {
    /// `HH:MM`, or `<day>,HH:MM` where day is `today`, `tomorrow` or `yyyy-mm-dd`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

/// Requested frame sets and pass control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Bias sets as `count,binning`
    pub bias: Vec<String>,
    /// Dark sets as `count,seconds,binning`
    pub darks: Vec<String>,
    /// Capture the dark pass before the bias pass
    pub darks_first: bool,
    /// Skip the bias pass
    pub no_bias: bool,
    /// Skip the dark pass
    pub no_dark: bool,
    /// Ignore progress recorded by earlier runs
    pub clear_done: bool,
}

/// State file location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Base path; the extension is added automatically
    pub file: PathBuf,
    /// Fold the cooling target into the file name
    pub qualify_with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 3040,
            exchange_timeout_secs: 300,
        }
    }
}

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            use_cooler: false,
            target: -10.0,
            start_tolerance: 1.0,
            max_wait_minutes: 30,
            poll_interval_secs: 60,
            abort_on_drift: false,
            abort_tolerance: 3.0,
            off_at_end: false,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("calib_daq"),
            qualify_with_target: true,
        }
    }
}

impl Settings {
    /// Layered figment of defaults, an optional TOML file and the environment.
    ///
    /// Callers may merge further providers (command-line overrides) before
    /// calling [`Settings::from_figment`].
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract settings from a figment and run the global checks.
    ///
    /// Capture-specific checks are left to [`Settings::validate`].
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate_globals()?;
        Ok(settings)
    }

    /// Load from defaults, the optional TOML file and the environment, fully validated.
    pub fn load(config_file: Option<&Path>) -> AppResult<Self> {
        let settings = Self::from_figment(Self::figment(config_file))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every command depends on.
    pub fn validate_globals(&self) -> AppResult<()> {
        if self.logging.verbosity > MAX_VERBOSITY {
            return Err(DaqError::Configuration(format!(
                "invalid verbosity level ({}); must be between 0 and {}",
                self.logging.verbosity, MAX_VERBOSITY
            )));
        }
        if self.state.file.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "state file path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Full validation before a capture run.
    ///
    /// Checks:
    /// - server address is an IP, `localhost` or a valid domain name
    /// - port, temperatures, tolerances and wait times are in range
    /// - every frame set parses and at least one is requested
    /// - the start time, if any, resolves
    pub fn validate(&self) -> AppResult<()> {
        self.validate_globals()?;
        validate_server_address(&self.server.address)?;

        if self.server.port == 0 {
            return Err(DaqError::Configuration(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.server.exchange_timeout_secs == 0 {
            return Err(DaqError::Configuration(
                "exchange_timeout_secs must be > 0".to_string(),
            ));
        }

        let cooling = &self.cooling;
        if !(MIN_COOL_TO..=MAX_COOL_TO).contains(&cooling.target) {
            return Err(DaqError::Configuration(format!(
                "cooling target must be between {} and {} (degrees)",
                MIN_COOL_TO, MAX_COOL_TO
            )));
        }
        check_tolerance("start_tolerance", cooling.start_tolerance)?;
        check_tolerance("abort_tolerance", cooling.abort_tolerance)?;
        if !(MIN_COOL_WAIT_MINUTES..=MAX_COOL_WAIT_MINUTES).contains(&cooling.max_wait_minutes) {
            return Err(DaqError::Configuration(format!(
                "max_wait_minutes must be between {} and {} (minutes)",
                MIN_COOL_WAIT_MINUTES, MAX_COOL_WAIT_MINUTES
            )));
        }
        if cooling.poll_interval_secs == 0 {
            return Err(DaqError::Configuration(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }

        let bias = self.bias_specs()?;
        let darks = self.dark_specs()?;
        if bias.is_empty() && darks.is_empty() {
            return Err(DaqError::Configuration(
                "At least one bias or dark frame set must be specified".to_string(),
            ));
        }

        self.start_time()?;
        Ok(())
    }

    /// Requested bias sets.
    pub fn bias_specs(&self) -> AppResult<Vec<BiasSpec>> {
        parse_bias_specs(&self.frames.bias)
    }

    /// Requested dark sets.
    pub fn dark_specs(&self) -> AppResult<Vec<DarkSpec>> {
        parse_dark_specs(&self.frames.darks)
    }

    /// Resolved delayed-start time, if one was requested.
    pub fn start_time(&self) -> AppResult<Option<DateTime<Local>>> {
        match self.start.at.as_deref() {
            Some(at) => resolve_start_time(at, Local::now()),
            None => Ok(None),
        }
    }

    /// State file for this run's cooling target.
    pub fn state_file_path(&self) -> PathBuf {
        state_file_path(
            &self.state.file,
            self.cooling.target,
            self.state.qualify_with_target,
        )
    }

    /// Bound on a single request/reply exchange.
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.server.exchange_timeout_secs)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render settings: {}", e)))
    }
}

fn check_tolerance(name: &str, value: f64) -> AppResult<()> {
    if !(0.0..=MAX_TOLERANCE).contains(&value) {
        return Err(DaqError::Configuration(format!(
            "{} must be between 0 and {} (degrees)",
            name, MAX_TOLERANCE
        )));
    }
    Ok(())
}

/// Accept an IP literal, `localhost`, or a syntactically valid domain name.
///
/// No lookup is attempted; an unreachable host surfaces on the first exchange.
pub fn validate_server_address(address: &str) -> AppResult<()> {
    if address.parse::<IpAddr>().is_ok() || address.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }
    if address.len() <= 253 && HOST_NAME.is_match(address) {
        return Ok(());
    }
    Err(DaqError::Configuration(format!(
        "Invalid server address: {}",
        address
    )))
}

/// Resolve a start-time string against `now`, in local time.
///
/// An empty string means start immediately.
pub fn resolve_start_time(at: &str, now: DateTime<Local>) -> AppResult<Option<DateTime<Local>>> {
    let at = at.trim().to_lowercase();
    if at.is_empty() {
        return Ok(None);
    }
    let invalid = || DaqError::Configuration(format!("invalid start time \"{}\"", at));

    let (day, time) = match at.split(',').map(str::trim).collect::<Vec<_>>().as_slice() {
        [time] => ("today", *time),
        [day, time] => (*day, *time),
        _ => return Err(invalid()),
    };

    let today = now.date_naive();
    let date = match day {
        "" | "today" => today,
        "tomorrow" => today.checked_add_days(Days::new(1)).ok_or_else(invalid)?,
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d").map_err(|_| invalid())?,
    };
    let time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| invalid())?;

    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(Some)
        .ok_or_else(invalid)
}
