use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use trash_tally::api::{ApiConfig, ApiHandle, ApiServer};
use trash_tally::config::CameraSettings;
use trash_tally::storage::DEFAULT_STATE_KEY;
use trash_tally::{
    Aggregator, BBox, CanvasSurface, ControlHandle, ControlLoop, Detector, Facing, FrameSource,
    InMemoryKeyValueStore, LoopSettings, PersistenceStore, Prediction, ScriptedBackend,
    SourceVariant, Threshold, TrashTypeSet, DEFAULT_DEDUP_WINDOW,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    control: ControlHandle,
    loop_thread: Option<JoinHandle<()>>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    /// A running loop on the synthetic camera whose detector sees a bottle
    /// (91%) and a person on every frame.
    fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let loop_thread = std::thread::spawn(move || {
            let trash_types = TrashTypeSet::default();
            let aggregator = Aggregator::new(
                PersistenceStore::in_memory(InMemoryKeyValueStore::new()),
                &trash_types,
                Threshold::default(),
                DEFAULT_DEDUP_WINDOW,
            );
            let backend = ScriptedBackend::repeating(vec![
                Prediction::new("bottle", 0.91, BBox::new(10.0, 20.0, 30.0, 40.0)),
                Prediction::new("person", 0.99, BBox::new(0.0, 0.0, 50.0, 50.0)),
            ]);
            let mut control = ControlLoop::new(
                Detector::from_backend(backend),
                FrameSource::new(CameraSettings::default()),
                aggregator,
                CanvasSurface::new(),
                trash_types,
                LoopSettings {
                    tick_interval: Duration::from_millis(5),
                    ..LoopSettings::default()
                },
            );
            let _ = handle_tx.send(control.handle());
            control.run();
        });
        let control = handle_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow!("control loop did not start"))?;

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, control.clone()).spawn()?;

        Ok(Self {
            control,
            loop_thread: Some(loop_thread),
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str, token: Option<&str>) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let auth = token
            .map(|t| format!("Authorization: Bearer {t}\r\n"))
            .unwrap_or_default();
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n{auth}\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn authed(&self, method: &str, path: &str) -> Result<(String, String)> {
        let token = self.handle().token.clone();
        self.request(method, path, Some(&token))
    }

    fn state(&self) -> Result<Value> {
        let (headers, body) = self.authed("GET", "/state")?;
        assert!(headers.contains("200 OK"), "unexpected response: {headers}");
        Ok(serde_json::from_str(&body)?)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        self.control.shutdown();
        if let Some(join) = self.loop_thread.take() {
            join.join().expect("control loop panicked");
        }
    }
}

fn wait_for(mut check: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check()? {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("condition not met in time"))
}

#[test]
fn health_is_public() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("GET", "/health", None)?;
    assert!(headers.contains("200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json["status"], "ok");
    Ok(())
}

#[test]
fn api_rejects_missing_and_invalid_tokens() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.request("GET", "/state", None)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("missing_token"));

    let (headers, body) = api.request("POST", "/reset", Some("not-the-token"))?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("invalid_token"));
    Ok(())
}

#[test]
fn api_rejects_token_in_query() -> Result<()> {
    let api = TestApi::new()?;
    let path = format!("/state?token={}", api.handle().token);
    let (headers, _body) = api.request("GET", &path, None)?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.authed("GET", "/nope")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.authed("GET", "/pause")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn counting_starts_after_model_and_camera() -> Result<()> {
    let api = TestApi::new()?;

    let state = api.state()?;
    assert_eq!(state["model"]["state"], "not_ready");
    assert_eq!(state["total"], 0);
    assert!(state["source"].is_null());

    let (headers, _) = api.authed("POST", "/model/load")?;
    assert!(headers.contains("200 OK"));
    let (headers, _) = api.authed("POST", "/camera/switch")?;
    assert!(headers.contains("200 OK"));

    wait_for(|| Ok(api.state()?["total"] == 1))?;
    let state = api.state()?;
    assert_eq!(state["counts"]["bottle"], 1);
    assert_eq!(state["counts"]["cup"], 0);
    assert!(state["counts"].get("person").is_none());
    assert_eq!(state["model"]["state"], "ready");
    assert_eq!(state["source"]["variant"], "camera");
    assert_eq!(state["source"]["facing"], "user");
    assert_eq!(state["mirrored"], true);
    let last = state["last_detection"].as_str().unwrap_or_default();
    assert!(last.starts_with("bottle 91% at "), "last detection: {last}");
    assert_eq!(state["log"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[test]
fn threshold_route_validates_and_applies() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.authed("POST", "/threshold?percent=75")?;
    assert!(headers.contains("200 OK"));
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json["threshold_percent"], 75);
    assert_eq!(api.state()?["threshold_percent"], 75);

    for bad in ["/threshold?percent=101", "/threshold?percent=abc", "/threshold"] {
        let (headers, body) = api.authed("POST", bad)?;
        assert!(headers.contains("400 Bad Request"), "{bad}: {headers}");
        assert!(body.contains("invalid_threshold"));
    }
    assert_eq!(api.state()?["threshold_percent"], 75);
    Ok(())
}

#[test]
fn pause_toggles_and_reset_clears() -> Result<()> {
    let api = TestApi::new()?;
    api.control.initialize_model()?;
    api.authed("POST", "/camera/switch")?;
    wait_for(|| Ok(api.state()?["total"] == 1))?;

    let (_, body) = api.authed("POST", "/pause")?;
    assert_eq!(serde_json::from_str::<Value>(&body)?["paused"], true);
    assert_eq!(api.state()?["paused"], true);
    let (_, body) = api.authed("POST", "/pause")?;
    assert_eq!(serde_json::from_str::<Value>(&body)?["paused"], false);

    api.authed("POST", "/pause")?;
    let (headers, body) = api.authed("POST", "/reset")?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains("reset"));
    let state = api.state()?;
    assert_eq!(state["paused"], false);
    assert_eq!(state["counts"]["bottle"], state["total"]);
    Ok(())
}

#[test]
fn stream_failures_map_to_conflict() -> Result<()> {
    let api = TestApi::new()?;
    api.authed("POST", "/camera/switch")?;

    let (headers, body) = api.authed("POST", "/stream?url=")?;
    assert!(headers.contains("409 Conflict"));
    let json: Value = serde_json::from_str(&body)?;
    assert_eq!(json["error"], "remote_stream_failure");
    // An empty URL never tears down the running camera.
    assert_eq!(api.state()?["source"]["variant"], "camera");

    let (headers, body) = api.authed("POST", "/stream?url=stub%3A%2F%2Foffline")?;
    assert!(headers.contains("409 Conflict"));
    assert!(body.contains("remote_stream_failure"));
    let state = api.state()?;
    assert!(state["source"].is_null());
    assert!(state["last_error"].is_string());

    let (headers, _) = api.authed("POST", "/stream?url=stub%3A%2F%2Fgarage")?;
    assert!(headers.contains("200 OK"));
    let state = api.state()?;
    assert_eq!(state["source"]["variant"], "remote");
    assert_eq!(state["mirrored"], false);
    assert!(state["last_error"].is_null());
    Ok(())
}

#[test]
fn log_csv_is_served_as_attachment() -> Result<()> {
    let api = TestApi::new()?;
    api.control.initialize_model()?;
    api.authed("POST", "/camera/switch")?;
    wait_for(|| Ok(api.state()?["total"] == 1))?;

    let (headers, body) = api.authed("GET", "/log.csv")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: text/csv"));
    assert!(headers.contains("attachment; filename=\"detections.csv\""));
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines[0], "\"Time\",\"Event\"");
    assert_eq!(lines.len(), 2);
    assert!(lines[1].ends_with(",\"bottle (91%)\""));
    Ok(())
}

#[test]
fn model_load_failure_is_reported() -> Result<()> {
    let (handle_tx, handle_rx) = mpsc::channel();
    let loop_thread = std::thread::spawn(move || {
        let trash_types = TrashTypeSet::default();
        let aggregator = Aggregator::new(
            PersistenceStore::new(Box::new(InMemoryKeyValueStore::new()), DEFAULT_STATE_KEY),
            &trash_types,
            Threshold::default(),
            DEFAULT_DEDUP_WINDOW,
        );
        let mut control = ControlLoop::new(
            Detector::from_backend(ScriptedBackend::new().failing_load("weights missing")),
            FrameSource::new(CameraSettings::default()),
            aggregator,
            CanvasSurface::new(),
            trash_types,
            LoopSettings::default(),
        );
        let _ = control.activate(SourceVariant::Camera(Facing::Environment));
        let _ = handle_tx.send(control.handle());
        control.run();
    });
    let control = handle_rx.recv_timeout(Duration::from_secs(5))?;
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        control.clone(),
    )
    .spawn()?;

    let mut stream = TcpStream::connect(api.addr)?;
    let request = format!(
        "POST /model/load HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {}\r\n\r\n",
        api.token
    );
    stream.write_all(request.as_bytes())?;
    let (headers, body) = read_response(&mut stream)?;
    assert!(headers.contains("409 Conflict"));
    assert!(body.contains("model_load_failure"));
    assert!(body.contains("weights missing"));

    api.stop()?;
    control.shutdown();
    loop_thread
        .join()
        .map_err(|_| anyhow!("control loop panicked"))?;
    Ok(())
}
