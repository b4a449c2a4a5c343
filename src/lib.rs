//! Core library for the calib-daq application.
//!
//! This library contains the capture engine for collecting bias and dark
//! calibration frames through the TheSkyX scripting server: the resumable
//! capture plan and its state file, the session that sequences cooling and
//! frame capture, and the TCP client for the TheSkyX wire protocol. It is used
//! by the `calib-daq` binary.

pub mod config;
pub mod delay;
pub mod error;
pub mod logging;
pub mod plan;
pub mod session;
pub mod skyx;
pub mod specs;
pub mod state_file;
