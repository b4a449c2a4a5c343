//! Low-level TheSkyX TCP driver.
//!
//! TheSkyX runs a small scripting server: a client sends a JavaScript fragment
//! wrapped in a fixed three-line envelope, the server runs it and replies with
//! `<payload>|<status>`. The server is transactional rather than
//! session-oriented, so every command dials a fresh TCP connection, writes the
//! envelope, reads one reply of at most [`MAX_REPLY_BYTES`] and closes.
//!
//! ```text
//! /* Java Script */
//! /* Socket Start Packet */
//! ccdsoftCamera.Connect();
//! var temp=ccdsoftCamera.Temperature;
//! ...
//! /* Socket End Packet */
//! ```
//!
//! A status that is empty or starts with `no error.` (any case) is success.
//! Anything else is surfaced as [`DaqError::Remote`]. A reply without the `|`
//! delimiter is [`DaqError::MalformedReply`], and a socket closed without any
//! reply is a [`DaqError::Transport`] error naming the operation. Nothing is
//! retried here; retry policy belongs to the session.

use crate::error::{AppResult, DaqError, FrameKind};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Largest reply read from a single exchange.
pub const MAX_REPLY_BYTES: usize = 4096;

/// Nominal exposure used for bias frames, in seconds.
pub const BIAS_EXPOSURE_SECS: f64 = 0.1;

/// Floor for a measured download time, in seconds.
const MIN_DOWNLOAD_SECS: f64 = 0.1;

const SCRIPT_HEADER: &str = "/* Java Script */\n";
const PACKET_START: &str = "/* Socket Start Packet */\n";
const PACKET_END: &str = "/* Socket End Packet */\n";

/// Instrument-level operations of the TheSkyX scripting server.
#[async_trait]
pub trait SkyxDriver: Send + Sync {
    /// Record the server coordinates. Idempotent; opens no socket.
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()>;

    /// Mark the logical session closed. Idempotent.
    async fn close(&mut self) -> AppResult<()>;

    /// Turn on temperature regulation with the given set point.
    async fn start_cooling(&self, temperature: f64) -> AppResult<()>;

    /// Turn off temperature regulation.
    async fn stop_cooling(&self) -> AppResult<()>;

    /// Current sensor temperature in degrees C.
    async fn get_temperature(&self) -> AppResult<f64>;

    /// Start an asynchronous dark exposure and return immediately.
    async fn start_dark_exposure(&self, binning: u32, seconds: f64, download_hint: f64)
        -> AppResult<()>;

    /// Start an asynchronous bias exposure and return immediately.
    async fn start_bias_exposure(&self, binning: u32, download_hint: f64) -> AppResult<()>;

    /// Whether the most recently started exposure has finished downloading.
    async fn is_exposure_done(&self) -> AppResult<bool>;

    /// Take one synchronous, unsaved bias frame and report how long the download took.
    async fn measure_download_time(&self, binning: u32) -> AppResult<f64>;
}

/// Wrap a script body in the begin/end envelope the server expects.
pub fn wrap_script(body: &str) -> String {
    let mut message = String::with_capacity(
        SCRIPT_HEADER.len() + PACKET_START.len() + body.len() + PACKET_END.len(),
    );
    message.push_str(SCRIPT_HEADER);
    message.push_str(PACKET_START);
    message.push_str(body);
    message.push_str(PACKET_END);
    message
}

/// Split a raw reply into payload and status and check the status.
///
/// Returns the trimmed payload on success. The server always sends the
/// delimiter, so a reply without one is never taken as a confirmation.
pub fn parse_reply(raw: &str) -> AppResult<String> {
    let Some((payload, status)) = raw.split_once('|') else {
        return Err(DaqError::MalformedReply(raw.trim().to_string()));
    };
    let status = status.trim().to_lowercase();
    if status.is_empty() || status.starts_with("no error.") {
        Ok(payload.trim().to_string())
    } else {
        Err(DaqError::Remote(status))
    }
}

/// Parse a numeric payload.
pub fn parse_number(payload: &str) -> AppResult<f64> {
    let trimmed = payload.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| DaqError::NumericParse(trimmed.to_string()))
}

/// Parse the exposure-complete flag. The server answers `1`/`0` or `true`/`false`.
pub fn parse_done_flag(payload: &str) -> AppResult<bool> {
    let trimmed = payload.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(false);
    }
    Ok(parse_number(trimmed)? != 0.0)
}

pub(crate) fn start_cooling_script(temperature: f64) -> String {
    let mut body = String::new();
    body.push_str("ccdsoftCamera.Connect();\n");
    body.push_str("ccdsoftCamera.RegulateTemperature=true;\n");
    body.push_str("ccdsoftCamera.ShutDownTemperatureRegulationOnDisconnect=false;\n");
    let _ = writeln!(body, "ccdsoftCamera.TemperatureSetPoint={:.6};", temperature);
    body
}

pub(crate) fn stop_cooling_script() -> String {
    "ccdsoftCamera.Connect();\nccdsoftCamera.RegulateTemperature=false;\n".to_string()
}

pub(crate) fn temperature_script() -> String {
    let mut body = String::new();
    body.push_str("ccdsoftCamera.Connect();\n");
    body.push_str("var temp=ccdsoftCamera.Temperature;\n");
    body.push_str("var Out;\n");
    body.push_str("Out=temp + \"\\n\";\n");
    body
}

pub(crate) fn exposure_done_script() -> String {
    "ccdsoftCamera.Connect();\nvar Out;\nOut=ccdsoftCamera.IsExposureComplete;\n".to_string()
}

/// Frame-type code used by `ccdsoftCamera.Frame`.
fn frame_code(kind: FrameKind) -> u8 {
    match kind {
        FrameKind::Bias => 2,
        FrameKind::Dark => 3,
    }
}

pub(crate) fn exposure_script(
    kind: FrameKind,
    binning: u32,
    seconds: f64,
    asynchronous: bool,
    auto_save: bool,
) -> String {
    let mut body = String::new();
    body.push_str("ccdsoftCamera.Connect();\n");
    let _ = writeln!(body, "ccdsoftCamera.Asynchronous={};", asynchronous);
    let _ = writeln!(body, "ccdsoftCamera.Frame={};", frame_code(kind));
    body.push_str("ccdsoftCamera.ImageReduction=0;\n");
    body.push_str("ccdsoftCamera.ToNewWindow=false;\n");
    let _ = writeln!(body, "ccdsoftCamera.AutoSaveOn={};", auto_save);
    let _ = writeln!(body, "ccdsoftCamera.BinX={};", binning);
    let _ = writeln!(body, "ccdsoftCamera.BinY={};", binning);
    let _ = writeln!(body, "ccdsoftCamera.ExposureTime={:.3};", seconds);
    body.push_str("ccdsoftCamera.Delay=0;\n");
    body.push_str("var Out;\n");
    body.push_str("Out=ccdsoftCamera.TakeImage();\n");
    body
}

/// Production driver speaking to a TheSkyX server over TCP.
pub struct TcpDriver {
    endpoint: Option<(String, u16)>,
    exchange_timeout: Duration,
    /// One exchange in flight at a time; the server cannot interleave.
    exchange_lock: Mutex<()>,
}

impl TcpDriver {
    /// Create a closed driver whose exchanges give up after `exchange_timeout`.
    pub fn new(exchange_timeout: Duration) -> Self {
        Self {
            endpoint: None,
            exchange_timeout,
            exchange_lock: Mutex::new(()),
        }
    }

    /// Whether the logical session is open.
    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    fn endpoint(&self) -> AppResult<(&str, u16)> {
        self.endpoint
            .as_ref()
            .map(|(server, port)| (server.as_str(), *port))
            .ok_or(DaqError::NotConnected)
    }

    /// Send one script body for `operation` and return the checked payload.
    async fn send_command(&self, operation: &'static str, body: &str) -> AppResult<String> {
        let (server, port) = self.endpoint()?;
        let message = wrap_script(body);
        let transport = move |source: std::io::Error| DaqError::Transport { operation, source };

        let _guard = self.exchange_lock.lock().await;
        trace!(operation, server, port, command = body, "opening socket");

        let raw = tokio::time::timeout(self.exchange_timeout, async {
            let mut stream = TcpStream::connect((server, port)).await.map_err(transport)?;

            let written = stream.write(message.as_bytes()).await.map_err(transport)?;
            if written != message.len() {
                return Err(DaqError::ShortWrite {
                    operation,
                    written,
                    expected: message.len(),
                });
            }
            stream.flush().await.map_err(transport)?;

            let mut buffer = vec![0u8; MAX_REPLY_BYTES];
            let read = stream.read(&mut buffer).await.map_err(transport)?;
            if read == 0 {
                return Err(transport(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "server closed the connection without replying",
                )));
            }
            Ok::<String, DaqError>(String::from_utf8_lossy(&buffer[..read]).into_owned())
        })
        .await
        .map_err(|_| DaqError::ExchangeTimeout {
            operation,
            timeout: self.exchange_timeout,
        })??;

        trace!(reply = raw.as_str(), "closing socket");
        parse_reply(&raw)
    }
}

#[async_trait]
impl SkyxDriver for TcpDriver {
    async fn connect(&mut self, server: &str, port: u16) -> AppResult<()> {
        if self.is_open() {
            debug!(server, port, "driver already connected");
            return Ok(());
        }
        self.endpoint = Some((server.to_string(), port));
        debug!(server, port, "driver connected");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.endpoint.take().is_none() {
            debug!("driver not open");
        }
        Ok(())
    }

    async fn start_cooling(&self, temperature: f64) -> AppResult<()> {
        debug!(temperature, "start cooling");
        self.send_command("start cooling", &start_cooling_script(temperature)).await?;
        Ok(())
    }

    async fn stop_cooling(&self) -> AppResult<()> {
        debug!("stop cooling");
        self.send_command("stop cooling", &stop_cooling_script()).await?;
        Ok(())
    }

    async fn get_temperature(&self) -> AppResult<f64> {
        let payload = self.send_command("get temperature", &temperature_script()).await?;
        parse_number(&payload)
    }

    async fn start_dark_exposure(
        &self,
        binning: u32,
        seconds: f64,
        download_hint: f64,
    ) -> AppResult<()> {
        debug!(binning, seconds, download_hint, "start dark exposure");
        let script = exposure_script(FrameKind::Dark, binning, seconds, true, true);
        self.send_command("start dark exposure", &script).await?;
        Ok(())
    }

    async fn start_bias_exposure(&self, binning: u32, download_hint: f64) -> AppResult<()> {
        debug!(binning, download_hint, "start bias exposure");
        let script = exposure_script(FrameKind::Bias, binning, BIAS_EXPOSURE_SECS, true, true);
        self.send_command("start bias exposure", &script).await?;
        Ok(())
    }

    async fn is_exposure_done(&self) -> AppResult<bool> {
        let payload = self.send_command("poll exposure", &exposure_done_script()).await?;
        parse_done_flag(&payload)
    }

    async fn measure_download_time(&self, binning: u32) -> AppResult<f64> {
        let script = exposure_script(FrameKind::Bias, binning, BIAS_EXPOSURE_SECS, false, false);
        let started = Instant::now();
        self.send_command("measure download time", &script).await?;
        let elapsed = started.elapsed().as_secs_f64();
        let download = (elapsed - BIAS_EXPOSURE_SECS).max(MIN_DOWNLOAD_SECS);
        debug!(binning, download, "measured download time");
        Ok(download)
    }
}
