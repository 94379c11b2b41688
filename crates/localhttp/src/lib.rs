//! Minimal HTTP/1.1 server exposing the commissioning and observability
//! routes over the LAN: `/status`, `/arm`, `/disarm`, `/config`, `/stream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use config::{ConfigStore, ConfigUpdate};

/// Request line + headers must fit in this; overflow is a 400, never a
/// silent truncation.
const MAX_HEADER_BYTES: usize = 8192;
/// Bodies larger than this are rejected with 413 before they are read.
const MAX_BODY_BYTES: u64 = 1024 * 1024;
/// Declared Content-Length above this is treated as malformed input (400),
/// not merely oversized (413); no real request body approaches this.
const MAX_SANE_CONTENT_LENGTH: u64 = 1_000_000_000_000_000;
const CONNECTION_GRACE: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub armed: bool,
    pub needs_setup: bool,
    pub detections_today: u32,
    pub pending_clips: u32,
    pub storage_free_mb: u64,
    pub led: String,
    pub last_heartbeat_age_s: Option<u64>,
    pub uptime_s: u64,
}

/// Supplies the live device snapshot for `/status`. Implemented by the
/// composition root, which is the only place that can see every component.
pub trait StatusProvider: Send + Sync {
    fn status(&self) -> StatusSnapshot;
}

/// Supplies the most recent camera frame, already JPEG-encoded, for `/stream`.
pub trait StreamSource: Send + Sync {
    fn latest_jpeg(&self) -> Option<Vec<u8>>;
}

pub struct LocalHttpServer {
    port: u16,
    config_store: Arc<ConfigStore>,
    status: Arc<dyn StatusProvider>,
    stream: Option<Arc<dyn StreamSource>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl LocalHttpServer {
    pub fn new(
        port: u16,
        config_store: Arc<ConfigStore>,
        status: Arc<dyn StatusProvider>,
        stream: Option<Arc<dyn StreamSource>>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            port,
            config_store,
            status,
            stream,
            stop_tx,
            stop_rx,
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// CREATED -> LISTENING -> (per connection) READING -> ROUTING ->
    /// RESPONDING -> CLOSED.
    pub async fn run(&self) -> std::io::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr, "local http server listening");

        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let result = tokio::time::timeout(
                                CONNECTION_GRACE,
                                handle_connection(
                                    stream,
                                    self.config_store.clone(),
                                    self.status.clone(),
                                    self.stream.clone(),
                                ),
                            )
                            .await;
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => warn!(%peer, error = %e, "connection handler error"),
                                Err(_) => warn!(%peer, "connection handler exceeded grace period"),
                            }
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        info!("local http server closed");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config_store: Arc<ConfigStore>,
    status: Arc<dyn StatusProvider>,
    stream_source: Option<Arc<dyn StreamSource>>,
) -> std::io::Result<()> {
    let header_bytes = match read_headers(&mut stream).await? {
        Some(bytes) => bytes,
        None => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", b"request header too large").await?;
            return Ok(());
        }
    };

    let request = match parse_request(&header_bytes) {
        Some(r) => r,
        None => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", b"malformed request").await?;
            return Ok(());
        }
    };

    let body = match read_body(&mut stream, &request).await? {
        ReadBodyResult::Body(b) => b,
        ReadBodyResult::TooLarge => {
            write_response(&mut stream, 413, "Payload Too Large", "text/plain", b"body exceeds limit").await?;
            return Ok(());
        }
        ReadBodyResult::BadLength => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", b"invalid Content-Length").await?;
            return Ok(());
        }
    };

    route(&mut stream, &request, &body, &config_store, &status, stream_source.as_deref()).await
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

async fn read_headers(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(Some(buf));
        }
    }
}

fn parse_request(header_bytes: &[u8]) -> Option<Request> {
    let text = std::str::from_utf8(header_bytes).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let _version = parts.next()?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(Request { method, path, headers })
}

enum ReadBodyResult {
    Body(Vec<u8>),
    TooLarge,
    BadLength,
}

async fn read_body(stream: &mut TcpStream, request: &Request) -> std::io::Result<ReadBodyResult> {
    let Some(raw_len) = request.headers.get("content-length") else {
        return Ok(ReadBodyResult::Body(Vec::new()));
    };
    // A declared length this large is malformed input, not merely a request
    // over the buffer cap; keep it out of the TooLarge path so it maps to 400.
    let len: u64 = match raw_len.trim().parse::<u64>() {
        Ok(v) if v <= MAX_SANE_CONTENT_LENGTH => v,
        _ => return Ok(ReadBodyResult::BadLength),
    };
    if len > MAX_BODY_BYTES {
        return Ok(ReadBodyResult::TooLarge);
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(ReadBodyResult::Body(body))
}

async fn route(
    stream: &mut TcpStream,
    request: &Request,
    body: &[u8],
    config_store: &ConfigStore,
    status: &Arc<dyn StatusProvider>,
    stream_source: Option<&dyn StreamSource>,
) -> std::io::Result<()> {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/status") => {
            let snapshot = status.status();
            write_json(stream, 200, "OK", &snapshot).await
        }
        ("POST", "/arm") => match config_store.set_armed(true) {
            Ok(()) => write_json(stream, 200, "OK", &serde_json::json!({"armed": true})).await,
            Err(e) => write_json(stream, 400, "Bad Request", &serde_json::json!({"error": e.to_string()})).await,
        },
        ("POST", "/disarm") => match config_store.set_armed(false) {
            Ok(()) => write_json(stream, 200, "OK", &serde_json::json!({"armed": false})).await,
            Err(e) => write_json(stream, 400, "Bad Request", &serde_json::json!({"error": e.to_string()})).await,
        },
        ("GET", "/config") => write_json(stream, 200, "OK", &config_store.get().masked()).await,
        ("POST", "/config") => {
            let update: ConfigUpdate = match serde_json::from_slice(body) {
                Ok(u) => u,
                Err(e) => {
                    return write_json(
                        stream,
                        400,
                        "Bad Request",
                        &serde_json::json!({"error": e.to_string()}),
                    )
                    .await
                }
            };
            match config_store.update(update) {
                Ok(cfg) => write_json(stream, 200, "OK", &cfg.masked()).await,
                Err(e) => write_json(stream, 400, "Bad Request", &serde_json::json!({"error": e.to_string()})).await,
            }
        }
        ("GET", "/stream") => write_stream(stream, stream_source).await,
        _ => {
            let sanitized = sanitize_path(&request.path);
            let body = format!("not found: {sanitized}");
            write_response(stream, 404, "Not Found", "text/plain", body.as_bytes()).await
        }
    }
}

async fn write_stream(stream: &mut TcpStream, source: Option<&dyn StreamSource>) -> std::io::Result<()> {
    const BOUNDARY: &str = "apisframe";
    let Some(source) = source else {
        return write_response(stream, 200, "OK", "text/plain", b"no camera attached").await;
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes()).await?;

    match source.latest_jpeg() {
        Some(jpeg) => {
            let part_header = format!(
                "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            stream.write_all(part_header.as_bytes()).await?;
            stream.write_all(&jpeg).await?;
            stream.write_all(format!("\r\n--{BOUNDARY}--\r\n").as_bytes()).await?;
        }
        None => {
            stream
                .write_all(format!("--{BOUNDARY}--\r\n").as_bytes())
                .await?;
        }
    }
    stream.flush().await
}

fn sanitize_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

async fn write_json<T: Serialize>(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    value: &T,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    write_response(stream, code, reason, "application/json", &body).await
}

async fn write_response(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Awaits `server.run()`, bounded by a grace period, after `server.stop()`
/// has been called.
pub async fn shutdown_with_grace<F>(stop: impl FnOnce(), run_future: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    stop();
    if tokio::time::timeout(SHUTDOWN_GRACE, run_future).await.is_err() {
        warn!("local http server did not shut down within grace period");
    }
}
