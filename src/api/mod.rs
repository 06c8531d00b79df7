//! Loopback HTTP control API.
//!
//! Maps the dashboard's control surface onto a handful of routes:
//!
//! | Route                      | Action            |
//! |----------------------------|-------------------|
//! | `GET /health`              | liveness (public) |
//! | `GET /state`               | counter panel     |
//! | `GET /log.csv`             | `downloadLog`     |
//! | `POST /threshold?percent=` | `setThreshold`    |
//! | `POST /pause`              | `togglePause`     |
//! | `POST /reset`              | `reset`           |
//! | `POST /camera/switch`      | `switchCamera`    |
//! | `POST /stream?url=`        | `useRemoteStream` |
//! | `POST /model/load`         | retry model load  |
//!
//! Everything except `/health` requires `Authorization: Bearer <token>`.
//! Requests are forwarded to the control loop through a `ControlHandle`;
//! the API thread never touches dashboard state itself.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::control::ControlHandle;
use crate::error::DashboardError;

const MAX_REQUEST_BYTES: usize = 8192;
const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
            token_path: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    control: ControlHandle,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: ControlHandle) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let token = generate_token();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let control = self.control;
        let thread_token = token.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, control, &thread_token, shutdown_thread) {
                log::error!("control api stopped: {}", err);
            }
        });

        log::info!("control api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            token,
            token_path: self.cfg.token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn generate_token() -> String {
    let mut token = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut token);
    hex::encode(token)
}

fn run_api(
    listener: TcpListener,
    control: ControlHandle,
    token: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &control, token) {
                    log::warn!("control api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, control: &ControlHandle, token: &str) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let route = match Route::parse(&request.method, &request.path) {
        Ok(route) => route,
        Err(status) => {
            let error = if status == 405 {
                "method_not_allowed"
            } else {
                "not_found"
            };
            write_json_response(&mut stream, status, &json!({ "error": error }))?;
            return Ok(());
        }
    };

    if route == Route::Health {
        write_json_response(&mut stream, 200, &json!({"status": "ok"}))?;
        return Ok(());
    }

    if request.query.contains_key("token") {
        write_json_response(
            &mut stream,
            400,
            &json!({"error": "token_query_param_not_allowed"}),
        )?;
        return Ok(());
    }
    match request.bearer_token() {
        None => {
            write_json_response(&mut stream, 401, &json!({"error": "missing_token"}))?;
            return Ok(());
        }
        Some(presented) if presented != token => {
            write_json_response(&mut stream, 401, &json!({"error": "invalid_token"}))?;
            return Err(anyhow!("invalid bearer token from {}", peer));
        }
        Some(_) => {}
    }

    dispatch(&mut stream, route, &request, control)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Health,
    State,
    LogCsv,
    Threshold,
    Pause,
    Reset,
    SwitchCamera,
    Stream,
    LoadModel,
}

impl Route {
    /// `Err(404)` for unknown paths, `Err(405)` for a known path with the wrong method.
    fn parse(method: &str, path: &str) -> std::result::Result<Self, u16> {
        let (route, expected) = match path {
            "/health" => (Route::Health, "GET"),
            "/state" => (Route::State, "GET"),
            "/log.csv" => (Route::LogCsv, "GET"),
            "/threshold" => (Route::Threshold, "POST"),
            "/pause" => (Route::Pause, "POST"),
            "/reset" => (Route::Reset, "POST"),
            "/camera/switch" => (Route::SwitchCamera, "POST"),
            "/stream" => (Route::Stream, "POST"),
            "/model/load" => (Route::LoadModel, "POST"),
            _ => return Err(404),
        };
        if method != expected {
            return Err(405);
        }
        Ok(route)
    }
}

fn dispatch(
    stream: &mut TcpStream,
    route: Route,
    request: &HttpRequest,
    control: &ControlHandle,
) -> Result<()> {
    match route {
        Route::Health => write_json_response(stream, 200, &json!({"status": "ok"})),
        Route::State => match control.status() {
            Ok(status) => {
                let payload = serde_json::to_vec(&status)?;
                write_response(stream, 200, "application/json", &[], &payload)
            }
            Err(err) => write_control_error(stream, &err),
        },
        Route::LogCsv => match control.download_log() {
            Ok(csv) => write_response(
                stream,
                200,
                "text/csv",
                &[(
                    "Content-Disposition",
                    "attachment; filename=\"detections.csv\"",
                )],
                csv.as_bytes(),
            ),
            Err(err) => write_control_error(stream, &err),
        },
        Route::Threshold => {
            let percent = request
                .query
                .get("percent")
                .and_then(|value| value.trim().parse::<u8>().ok())
                .filter(|percent| *percent <= 100);
            let Some(percent) = percent else {
                return write_json_response(
                    stream,
                    400,
                    &json!({"error": "invalid_threshold", "message": "percent must be an integer 0-100"}),
                );
            };
            match control.set_threshold(percent) {
                Ok(threshold) => write_json_response(
                    stream,
                    200,
                    &json!({"threshold_percent": threshold.percent()}),
                ),
                Err(err) => write_control_error(stream, &err),
            }
        }
        Route::Pause => {
            let paused = control.toggle_pause();
            log::info!("control api: {}", if paused { "paused" } else { "resumed" });
            write_json_response(stream, 200, &json!({ "paused": paused }))
        }
        Route::Reset => match control.reset() {
            Ok(()) => write_json_response(stream, 200, &json!({"status": "reset"})),
            Err(err) => write_control_error(stream, &err),
        },
        Route::SwitchCamera => action_response(stream, control.switch_camera()),
        Route::Stream => {
            let url = request.query.get("url").map(String::as_str).unwrap_or("");
            action_response(stream, control.use_remote_stream(url))
        }
        Route::LoadModel => action_response(stream, control.initialize_model()),
    }
}

fn action_response(stream: &mut TcpStream, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => write_json_response(stream, 200, &json!({"status": "ok"})),
        Err(err) => write_control_error(stream, &err),
    }
}

/// `DashboardError`s become 409 with a taxonomy code; anything else is a 500.
fn write_control_error(stream: &mut TcpStream, err: &anyhow::Error) -> Result<()> {
    match err.downcast_ref::<DashboardError>() {
        Some(failure) => write_json_response(
            stream,
            409,
            &json!({"error": error_code(failure), "message": failure.to_string()}),
        ),
        None => {
            log::error!("control api: {:#}", err);
            write_json_response(stream, 500, &json!({"error": "control_unavailable"}))
        }
    }
}

fn error_code(err: &DashboardError) -> &'static str {
    match err {
        DashboardError::ModelLoadFailure(_) => "model_load_failure",
        DashboardError::CameraAcquisitionFailure(_) => "camera_acquisition_failure",
        DashboardError::RemoteStreamFailure(_) => "remote_stream_failure",
        DashboardError::DetectionTickFailure(_) => "detection_tick_failure",
        DashboardError::PersistenceCorruption(_) => "persistence_corruption",
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &[], &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_distinguish_unknown_and_wrong_method() {
        assert_eq!(Route::parse("GET", "/state"), Ok(Route::State));
        assert_eq!(Route::parse("POST", "/state"), Err(405));
        assert_eq!(Route::parse("GET", "/pause"), Err(405));
        assert_eq!(Route::parse("GET", "/nope"), Err(404));
    }

    #[test]
    fn tokens_are_random_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(hex::decode(&a).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn error_codes_follow_taxonomy() {
        assert_eq!(
            error_code(&DashboardError::RemoteStreamFailure("x".into())),
            "remote_stream_failure"
        );
        assert_eq!(
            error_code(&DashboardError::ModelLoadFailure("x".into())),
            "model_load_failure"
        );
    }
}
