//! TheSkyX camera access
//!
//! This module contains the wire-level scripting client for the TheSkyX TCP
//! server and the camera service that turns its fire-and-poll exposures into
//! run-to-completion frame captures.

pub mod driver;
pub mod mock;
pub mod service;

pub use driver::{SkyxDriver, TcpDriver};
pub use mock::{MockCamera, MockDriver};
pub use service::{CameraService, SkyxCamera};
