//! Entry point for `calib-daq`.
//!
//! Parses command-line arguments, layers them over the settings file and
//! environment, and dispatches to the capture session or one of the state-file
//! maintenance commands.

use anyhow::{Context, Result};
use calib_daq::config::Settings;
use calib_daq::logging;
use calib_daq::session::Session;
use calib_daq::state_file::{JsonPlanStore, PlanStore};
use clap::{Args, Parser, Subcommand};
use figment::providers::Serialized;
use figment::Figment;
use serde::Serialize;
use std::path::PathBuf;

/// Capture bias and dark calibration frames through TheSkyX.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 0 (errors and warnings) to 5 (everything)
    #[arg(short, long, global = true)]
    verbosity: Option<u8>,

    /// Debugging output
    #[arg(short, long, global = true)]
    debug: bool,

    /// State file base path; the cooling target and extension are appended
    #[arg(short = 'f', long, global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the requested frames, resuming any unfinished run
    Capture(CaptureArgs),
    /// Show progress recorded in the state file
    Status(TargetArgs),
    /// Delete the state file so the next capture starts over
    Reset(TargetArgs),
    /// Validate the settings and print them
    Validate(CaptureArgs),
}

/// Selects which temperature-qualified state file to use.
#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// Cooling target the run was made at
    #[arg(long, allow_hyphen_values = true)]
    coolto: Option<f64>,
}

#[derive(Args, Debug, Default)]
struct CaptureArgs {
    /// Address of the TheSkyX server
    #[arg(short, long)]
    server: Option<String>,

    /// Port of the TheSkyX server
    #[arg(short, long)]
    port: Option<u16>,

    /// Use the camera cooler
    #[arg(long)]
    cool: bool,

    /// Cooling target temperature
    #[arg(long, allow_hyphen_values = true)]
    coolto: Option<f64>,

    /// Start capturing once within this many degrees of target
    #[arg(long)]
    coolstarttol: Option<f64>,

    /// Maximum minutes to reach the target temperature
    #[arg(long)]
    coolwait: Option<u32>,

    /// Seconds between temperature checks while cooling
    #[arg(long)]
    coolpoll: Option<u64>,

    /// Abandon capture if the temperature drifts from target
    #[arg(long)]
    coolabort: bool,

    /// Drift in degrees that abandons capture
    #[arg(long)]
    coolaborttol: Option<f64>,

    /// Switch the cooler off at the end of the session
    #[arg(long)]
    offatend: bool,

    /// Delayed start: HH:MM or <today|tomorrow|yyyy-mm-dd>,HH:MM
    #[arg(long)]
    startat: Option<String>,

    /// Bias set as count,binning (repeatable)
    #[arg(long)]
    bias: Vec<String>,

    /// Dark set as count,seconds,binning (repeatable)
    #[arg(long)]
    dark: Vec<String>,

    /// Capture darks before bias frames
    #[arg(long)]
    darksfirst: bool,

    /// Skip bias frames
    #[arg(long)]
    nobias: bool,

    /// Skip dark frames
    #[arg(long)]
    nodark: bool,

    /// Ignore progress from earlier runs
    #[arg(long)]
    cleardone: bool,
}

/// Merge `key = value` when the option was given.
fn set<T: Serialize>(figment: Figment, key: &str, value: Option<T>) -> Figment {
    match value {
        Some(value) => figment.merge(Serialized::default(key, value)),
        None => figment,
    }
}

/// Merge `key = true` when the flag was given.
fn flag(figment: Figment, key: &str, given: bool) -> Figment {
    set(figment, key, given.then_some(true))
}

impl Cli {
    fn figment(&self) -> Figment {
        let mut figment = Settings::figment(self.config.as_deref());
        figment = set(figment, "logging.verbosity", self.verbosity);
        figment = flag(figment, "logging.debug", self.debug);
        figment = set(figment, "state.file", self.state_file.clone());
        match &self.command {
            Command::Capture(args) | Command::Validate(args) => args.apply(figment),
            Command::Status(args) | Command::Reset(args) => {
                set(figment, "cooling.target", args.coolto)
            }
        }
    }
}

impl CaptureArgs {
    fn apply(&self, figment: Figment) -> Figment {
        let mut figment = set(figment, "server.address", self.server.clone());
        figment = set(figment, "server.port", self.port);
        figment = flag(figment, "cooling.use_cooler", self.cool);
        figment = set(figment, "cooling.target", self.coolto);
        figment = set(figment, "cooling.start_tolerance", self.coolstarttol);
        figment = set(figment, "cooling.max_wait_minutes", self.coolwait);
        figment = set(figment, "cooling.poll_interval_secs", self.coolpoll);
        figment = flag(figment, "cooling.abort_on_drift", self.coolabort);
        figment = set(figment, "cooling.abort_tolerance", self.coolaborttol);
        figment = flag(figment, "cooling.off_at_end", self.offatend);
        figment = set(figment, "start.at", self.startat.clone());
        figment = set(figment, "frames.bias", non_empty(&self.bias));
        figment = set(figment, "frames.darks", non_empty(&self.dark));
        figment = flag(figment, "frames.darks_first", self.darksfirst);
        figment = flag(figment, "frames.no_bias", self.nobias);
        figment = flag(figment, "frames.no_dark", self.nodark);
        flag(figment, "frames.clear_done", self.cleardone)
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_figment(cli.figment()).context("Failed to load settings")?;
    logging::init(&settings.logging)?;

    match cli.command {
        Command::Capture(_) => capture(settings).await,
        Command::Status(_) => status(&settings).await,
        Command::Reset(_) => reset(&settings).await,
        Command::Validate(_) => validate(&settings),
    }
}

async fn capture(settings: Settings) -> Result<()> {
    settings.validate().context("Invalid settings")?;
    let mut session = Session::new(settings);
    let plan = session.run().await.context("Capture failed")?;
    for set in plan.progress() {
        println!("{}: {} frames captured", set.spec.key(), set.done);
    }
    Ok(())
}

async fn status(settings: &Settings) -> Result<()> {
    let store = JsonPlanStore::new(settings.state_file_path());
    let Some(plan) = store.load().await.context("Failed to read state file")? else {
        println!("No capture recorded in {}", store.path().display());
        return Ok(());
    };

    println!("State file {}", store.path().display());
    for set in plan.progress() {
        println!(
            "  {:<28} required {:>4}  done {:>4}  remaining {:>4}",
            set.spec.key(),
            set.spec.count(),
            set.done,
            set.remaining
        );
    }
    for (binning, seconds) in &plan.download_times {
        println!("  download time at binning {}: {:.2} s", binning, seconds);
    }
    if plan.is_complete() {
        println!("All frame sets complete");
    }
    Ok(())
}

async fn reset(settings: &Settings) -> Result<()> {
    let store = JsonPlanStore::new(settings.state_file_path());
    if store.clear().await.context("Failed to delete state file")? {
        println!("Deleted {}", store.path().display());
    } else {
        println!("No state file at {}", store.path().display());
    }
    Ok(())
}

fn validate(settings: &Settings) -> Result<()> {
    settings.validate().context("Invalid settings")?;
    print!("{}", settings.to_toml()?);
    Ok(())
}
