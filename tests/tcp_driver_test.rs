//! TcpDriver against a local stand-in for the TheSkyX scripting server.

use calib_daq::delay::MockDelay;
use calib_daq::error::DaqError;
use calib_daq::skyx::{CameraService, SkyxCamera, SkyxDriver, TcpDriver};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const END_MARKER: &str = "/* Socket End Packet */\n";

/// Requests received, one entry per accepted connection.
type RequestLog = Arc<Mutex<Vec<String>>>;

async fn read_request(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buffer = [0u8; 1024];
    loop {
        let read = stream.read(&mut buffer).await.unwrap();
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..read]);
        if String::from_utf8_lossy(&request).ends_with(END_MARKER) {
            break;
        }
    }
    String::from_utf8(request).unwrap()
}

/// Serve every connection with `reply(request)` after `latency`.
async fn spawn_server(reply: fn(&str) -> String, latency: Duration) -> (u16, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let server_log = log.clone();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let request = read_request(&mut stream).await;
            let response = reply(&request);
            server_log.lock().push(request);
            tokio::time::sleep(latency).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });

    (port, log)
}

async fn connected_driver(port: u16) -> TcpDriver {
    let mut driver = TcpDriver::new(Duration::from_secs(5));
    driver.connect("127.0.0.1", port).await.unwrap();
    driver
}

#[tokio::test]
async fn test_temperature_exchange() {
    let (port, log) = spawn_server(|_| "-9.5|No error. Error = 0.".to_string(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    let temperature = driver.get_temperature().await.unwrap();

    assert_eq!(temperature, -9.5);
    let requests = log.lock().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.starts_with("/* Java Script */\n/* Socket Start Packet */\n"));
    assert!(request.ends_with(END_MARKER));
    assert!(request.contains("ccdsoftCamera.Temperature;"));
}

#[tokio::test]
async fn test_each_command_dials_a_new_connection() {
    let (port, log) = spawn_server(|_| "|No error. Error = 0.".to_string(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    driver.start_cooling(-10.0).await.unwrap();
    driver.stop_cooling().await.unwrap();

    let requests = log.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("RegulateTemperature=true;"));
    assert!(requests[0].contains("TemperatureSetPoint=-10.000000;"));
    assert!(requests[1].contains("RegulateTemperature=false;"));
}

#[tokio::test]
async fn test_remote_error_status() {
    let (port, _) = spawn_server(|_| "|Camera Not Connected".to_string(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    match driver.get_temperature().await {
        Err(DaqError::Remote(status)) => assert_eq!(status, "camera not connected"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_numeric_temperature() {
    let (port, _) = spawn_server(|_| "abc|No error. Error = 0.".to_string(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    assert!(matches!(
        driver.get_temperature().await,
        Err(DaqError::NumericParse(_))
    ));
}

#[tokio::test]
async fn test_exchange_timeout() {
    let (port, _) = spawn_server(|_| "1|".to_string(), Duration::from_secs(30)).await;
    let mut driver = TcpDriver::new(Duration::from_millis(200));
    driver.connect("127.0.0.1", port).await.unwrap();

    assert!(matches!(
        driver.is_exposure_done().await,
        Err(DaqError::ExchangeTimeout {
            operation: "poll exposure",
            ..
        })
    ));
}

#[tokio::test]
async fn test_refused_connection_names_operation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let driver = connected_driver(port).await;

    match driver.get_temperature().await {
        Err(DaqError::Transport { operation, source }) => {
            assert_eq!(operation, "get temperature");
            assert_eq!(source.kind(), ErrorKind::ConnectionRefused);
        }
        other => panic!("expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_without_reply_is_not_confirmation() {
    let (port, log) = spawn_server(|_| String::new(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    match driver.start_cooling(-10.0).await {
        Err(DaqError::Transport { operation, source }) => {
            assert_eq!(operation, "start cooling");
            assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(matches!(
        driver.start_dark_exposure(1, 30.0, 2.0).await,
        Err(DaqError::Transport {
            operation: "start dark exposure",
            ..
        })
    ));
    assert_eq!(log.lock().len(), 2);
}

#[tokio::test]
async fn test_reply_without_delimiter_is_rejected() {
    let (port, _) = spawn_server(|_| "TakeImage done".to_string(), Duration::ZERO).await;
    let driver = connected_driver(port).await;

    assert!(matches!(
        driver.start_bias_exposure(1, 2.0).await,
        Err(DaqError::MalformedReply(_))
    ));
}

#[tokio::test]
async fn test_measure_download_time() {
    let (port, log) = spawn_server(|_| "0|No error. Error = 0.".to_string(), Duration::from_millis(300)).await;
    let driver = connected_driver(port).await;

    let download = driver.measure_download_time(2).await.unwrap();

    assert!(download >= 0.1);
    assert!(download < 5.0);
    let request = log.lock()[0].clone();
    assert!(request.contains("Asynchronous=false;"));
    assert!(request.contains("AutoSaveOn=false;"));
    assert!(request.contains("Frame=2;"));
    assert!(request.contains("BinX=2;"));
}

#[tokio::test]
async fn test_camera_capture_over_tcp() {
    fn reply(request: &str) -> String {
        if request.contains("IsExposureComplete") {
            "1|No error. Error = 0.".to_string()
        } else {
            "0|No error. Error = 0.".to_string()
        }
    }
    let (port, log) = spawn_server(reply, Duration::ZERO).await;
    let delay = MockDelay::new();
    let mut camera = SkyxCamera::new(
        Box::new(TcpDriver::new(Duration::from_secs(5))),
        Arc::new(delay.clone()),
    );
    camera.connect("127.0.0.1", port).await.unwrap();

    camera.capture_dark_frame(1, 20.0, 5.0).await.unwrap();

    assert_eq!(delay.durations(), vec![26]);
    let requests = log.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("Frame=3;"));
    assert!(requests[0].contains("ExposureTime=20.000;"));
    assert!(requests[1].contains("IsExposureComplete"));
}
