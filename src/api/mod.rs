//! HTTP surface: health, status snapshot, MJPEG feed.
//!
//! Handlers only read the `StatusBoard` snapshot or a subscriber channel, so
//! no request can stall the ingestion loop. Each accepted connection gets
//! its own thread; `/video` connections live until the client goes away or
//! the hub is closed.

use anyhow::{anyhow, Result};
use crossbeam_channel::RecvTimeoutError;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::publish::SubscriberHub;
use crate::status::StatusBoard;

const MAX_REQUEST_BYTES: usize = 8192;
const VIDEO_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const VIDEO_POLL: Duration = Duration::from_millis(500);
const BOUNDARY: &str = "frame";

const INDEX_HTML: &str = "<!doctype html>\n<html><head><title>vigil</title></head>\n<body>\n<h1>vigil</h1>\n<p><a href=\"/health\">health</a> | <a href=\"/status\">status</a></p>\n<img src=\"/video\" alt=\"annotated feed\">\n</body></html>\n";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8888".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
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

#[derive(Clone)]
struct Shared {
    status: StatusBoard,
    hub: SubscriberHub,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    status: StatusBoard,
    hub: SubscriberHub,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, status: StatusBoard, hub: SubscriberHub) -> Self {
        Self { cfg, status, hub }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("http api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Shared {
            status: self.status,
            hub: self.hub,
            shutdown: shutdown.clone(),
        };
        let join = std::thread::Builder::new()
            .name("vigil-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared) {
                    log::error!("http api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, shared: Shared) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("vigil-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared) {
                            log::debug!("http request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("http api: could not spawn connection thread: {}", err);
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

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    // accepted sockets inherit O_NONBLOCK on some platforms
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/" => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        "/health" => {
            let snapshot = shared.status.snapshot();
            let healthy = snapshot.is_healthy();
            let body = serde_json::json!({
                "status": if healthy { "healthy" } else { "unhealthy" },
                "state": snapshot.pipeline_state,
                "connected": snapshot.stream.connected,
                "consecutive_frame_errors": snapshot.stream.consecutive_frame_errors,
                "consecutive_reconnect_attempts": snapshot.stream.consecutive_reconnect_attempts,
                "last_frame_at": snapshot.stream.last_frame_at,
            });
            let status = if healthy { 200 } else { 503 };
            write_response(&mut stream, status, "application/json", &serde_json::to_vec(&body)?)
        }
        "/status" => {
            let snapshot = shared.status.snapshot();
            let payload = serde_json::to_vec(snapshot.as_ref())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/video" => stream_video(stream, shared),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn stream_video(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let subscription = match shared.hub.subscribe() {
        Ok(sub) => sub,
        Err(_) => {
            return write_json_response(&mut stream, 503, r#"{"error":"stream_closed"}"#);
        }
    };
    stream.set_write_timeout(Some(VIDEO_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    if let Err(err) = stream.write_all(header.as_bytes()) {
        shared.hub.unsubscribe(subscription.id);
        return Err(err.into());
    }
    log::debug!("video subscriber {} connected", subscription.id);

    let result = loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match subscription.frames.recv_timeout(VIDEO_POLL) {
            Ok(jpeg) => {
                if let Err(err) = write_part(&mut stream, &jpeg) {
                    break Err(err);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            // dropped by the hub for lagging, or the hub closed
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    shared.hub.unsubscribe(subscription.id);
    log::debug!("video subscriber {} disconnected", subscription.id);
    result
}

fn write_part(stream: &mut TcpStream, jpeg: &[u8]) -> Result<()> {
    let part = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    stream.write_all(part.as_bytes())?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
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
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
