//! Heartbeat and clip upload over plain HTTP/1.1, with a hard refusal of TLS
//! rather than a silent cleartext downgrade.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use clipupload::{ClipMetadata, ClipTransport, UploadOutcome};

/// Every formatted request header must fit in this; exceeding it is an
/// error, never a silently truncated send.
pub const BUFFER_CAP: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
pub enum ServerCommError {
    #[error("server configuration is invalid: {0}")]
    InvalidInput(String),
    #[error("request would exceed the {BUFFER_CAP}-byte formatting buffer")]
    Truncation,
    #[error("network error: {0}")]
    IoTransient(String),
    #[error("server rejected the request: HTTP {0}")]
    IoPermanent(u16),
}

impl ServerCommError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            ServerCommError::InvalidInput(_) => "INVALID_INPUT",
            ServerCommError::Truncation => "TRUNCATION",
            ServerCommError::IoTransient(_) => "IO_TRANSIENT",
            ServerCommError::IoPermanent(_) => "IO_PERMANENT",
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerCommError>;

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub device_id: String,
    pub timestamp: String,
    pub armed: bool,
    pub led: String,
    pub detections_today: u32,
    pub pending_clips: u32,
    pub storage_free_mb: u64,
}

#[derive(Debug, Clone)]
pub struct ServerCommConfig {
    /// Empty URL makes every heartbeat a no-op success.
    pub server_url: String,
    pub api_key: String,
}

pub struct ServerComm {
    config: Mutex<ServerCommConfig>,
    last_heartbeat_unix_s: AtomicU64,
    heartbeat_failures: AtomicU64,
}

struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

fn parse_http_url(url: &str) -> Result<ParsedUrl> {
    if let Some(rest) = url.strip_prefix("https://") {
        let _ = rest;
        return Err(ServerCommError::InvalidInput(
            "TLS is not supported on-device; configure an http:// server URL".to_string(),
        ));
    }
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| ServerCommError::InvalidInput(format!("unsupported URL scheme: {url}")))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| ServerCommError::InvalidInput(format!("bad port in {authority}")))?;
            (h.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return Err(ServerCommError::InvalidInput("empty host".to_string()));
    }
    Ok(ParsedUrl {
        host,
        port,
        path: path.to_string(),
    })
}

fn checked_push(buf: &mut String, piece: &str) -> Result<()> {
    if buf.len() + piece.len() > BUFFER_CAP {
        return Err(ServerCommError::Truncation);
    }
    buf.push_str(piece);
    Ok(())
}

fn send_request(url: &ParsedUrl, header: &str, body: &[u8]) -> Result<(u16, Vec<u8>)> {
    let addr = (url.host.as_str(), url.port)
        .to_socket_addrs()
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?
        .next()
        .ok_or_else(|| ServerCommError::IoTransient("DNS resolution returned no address".into()))?;

    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;

    stream
        .write_all(header.as_bytes())
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;
    stream
        .write_all(body)
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .map_err(|e| ServerCommError::IoTransient(e.to_string()))?;

    let status = parse_status_line(&response)
        .ok_or_else(|| ServerCommError::IoTransient("malformed HTTP response".to_string()))?;
    Ok((status, response))
}

fn parse_status_line(response: &[u8]) -> Option<u16> {
    let line_end = response.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    parts.next()?; // "HTTP/1.1"
    parts.next()?.parse().ok()
}

impl ServerComm {
    pub fn new(config: ServerCommConfig) -> Self {
        Self {
            config: Mutex::new(config),
            last_heartbeat_unix_s: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
        }
    }

    pub fn update_config(&self, config: ServerCommConfig) {
        *self.config.lock().expect("servercomm config mutex poisoned") = config;
    }

    pub fn seconds_since_last_heartbeat(&self, now_unix_s: u64) -> u64 {
        let last = self.last_heartbeat_unix_s.load(Ordering::Relaxed);
        if last == 0 {
            u64::MAX
        } else {
            now_unix_s.saturating_sub(last)
        }
    }

    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures.load(Ordering::Relaxed)
    }

    /// A missing server configuration makes this a no-op success, never an error.
    pub fn send_heartbeat(&self, status: &HeartbeatStatus, now_unix_s: u64) -> Result<()> {
        let config = self.config.lock().expect("servercomm config mutex poisoned").clone();
        if config.server_url.trim().is_empty() {
            return Ok(());
        }

        let result = self.send_heartbeat_inner(&config, status);
        match &result {
            Ok(()) => {
                self.last_heartbeat_unix_s.store(now_unix_s, Ordering::Relaxed);
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "heartbeat failed");
            }
        }
        result
    }

    fn send_heartbeat_inner(&self, config: &ServerCommConfig, status: &HeartbeatStatus) -> Result<()> {
        let url = parse_http_url(&config.server_url)?;
        let body = serde_json::to_vec(status)
            .map_err(|e| ServerCommError::InvalidInput(e.to_string()))?;

        let mut header = String::new();
        checked_push(&mut header, &format!("POST {}/heartbeat HTTP/1.1\r\n", url.path.trim_end_matches('/')))?;
        checked_push(&mut header, &format!("Host: {}\r\n", url.host))?;
        checked_push(&mut header, "Content-Type: application/json\r\n")?;
        checked_push(&mut header, &format!("Content-Length: {}\r\n", body.len()))?;
        checked_push(&mut header, &format!("X-API-Key: {}\r\n", config.api_key))?;
        checked_push(&mut header, "Connection: close\r\n\r\n")?;

        let (status_code, _) = send_request(&url, &header, &body)?;
        classify_status(status_code)
    }
}

fn classify_status(status_code: u16) -> Result<()> {
    match status_code {
        200..=299 => Ok(()),
        401 => Err(ServerCommError::IoPermanent(status_code)),
        500..=599 => Err(ServerCommError::IoTransient(format!("HTTP {status_code}"))),
        _ => Err(ServerCommError::IoPermanent(status_code)),
    }
}

fn classify_upload_status(status_code: u16) -> UploadOutcome {
    match status_code {
        200..=299 => UploadOutcome::Success,
        408 | 429 => UploadOutcome::Transient,
        500..=599 => UploadOutcome::Transient,
        400..=499 => UploadOutcome::ClientError,
        _ => UploadOutcome::Transient,
    }
}

impl ClipTransport for ServerComm {
    fn upload(&self, path: &Path, metadata: &ClipMetadata) -> UploadOutcome {
        let config = self.config.lock().expect("servercomm config mutex poisoned").clone();
        if config.server_url.trim().is_empty() {
            return UploadOutcome::Transient;
        }
        match self.upload_inner(&config, path, metadata) {
            Ok(outcome) => outcome,
            Err(ServerCommError::Truncation) => UploadOutcome::RequestTooLarge,
            Err(_) => UploadOutcome::Transient,
        }
    }
}

impl ServerComm {
    fn upload_inner(
        &self,
        config: &ServerCommConfig,
        path: &Path,
        metadata: &ClipMetadata,
    ) -> Result<UploadOutcome> {
        let url = parse_http_url(&config.server_url)?;
        let file_bytes = std::fs::read(path).map_err(|e| ServerCommError::IoTransient(e.to_string()))?;
        let meta_json = serde_json::json!({
            "id": metadata.id,
            "timestamp": metadata.timestamp,
            "confidence": metadata.confidence,
        })
        .to_string();

        let boundary = "apis-edge-clip-boundary";
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clip.mp4");

        let mut preamble = String::new();
        checked_push(&mut preamble, &format!("--{boundary}\r\n"))?;
        checked_push(
            &mut preamble,
            "Content-Disposition: form-data; name=\"meta\"\r\n\r\n",
        )?;
        checked_push(&mut preamble, &meta_json)?;
        checked_push(&mut preamble, "\r\n")?;
        checked_push(&mut preamble, &format!("--{boundary}\r\n"))?;
        checked_push(
            &mut preamble,
            &format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n"),
        )?;
        checked_push(&mut preamble, "Content-Type: video/mp4\r\n\r\n")?;

        let epilogue = format!("\r\n--{boundary}--\r\n");
        let content_length = preamble.len() + file_bytes.len() + epilogue.len();

        let mut header = String::new();
        checked_push(&mut header, &format!("POST {}/clips HTTP/1.1\r\n", url.path.trim_end_matches('/')))?;
        checked_push(&mut header, &format!("Host: {}\r\n", url.host))?;
        checked_push(
            &mut header,
            &format!("Content-Type: multipart/form-data; boundary={boundary}\r\n"),
        )?;
        checked_push(&mut header, &format!("Content-Length: {content_length}\r\n"))?;
        checked_push(&mut header, &format!("X-API-Key: {}\r\n", config.api_key))?;
        checked_push(&mut header, "Connection: close\r\n\r\n")?;

        let mut body = Vec::with_capacity(content_length);
        body.extend_from_slice(preamble.as_bytes());
        body.extend_from_slice(&file_bytes);
        body.extend_from_slice(epilogue.as_bytes());

        let (status_code, _) = send_request(&url, &header, &body)?;
        Ok(classify_upload_status(status_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_url_makes_heartbeat_a_noop_success() {
        let comm = ServerComm::new(ServerCommConfig {
            server_url: String::new(),
            api_key: String::new(),
        });
        let status = HeartbeatStatus {
            device_id: "apis-1".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            armed: true,
            led: "ARMED".into(),
            detections_today: 0,
            pending_clips: 0,
            storage_free_mb: 100,
        };
        assert!(comm.send_heartbeat(&status, 0).is_ok());
    }

    #[test]
    fn https_url_is_refused_not_downgraded() {
        let result = parse_http_url("https://server.example/api");
        assert!(result.is_err());
    }

    #[test]
    fn http_url_parses_host_port_and_path() {
        let parsed = parse_http_url("http://server.example:8080/api").unwrap();
        assert_eq!(parsed.host, "server.example");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/api");
    }

    #[test]
    fn http_url_defaults_to_port_80_and_root_path() {
        let parsed = parse_http_url("http://server.example").unwrap();
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn checked_push_rejects_overflow() {
        let mut buf = String::new();
        let piece = "x".repeat(BUFFER_CAP + 1);
        assert!(checked_push(&mut buf, &piece).is_err());
    }

    #[test]
    fn status_classification_matches_policy() {
        assert!(classify_status(200).is_ok());
        assert!(matches!(
            classify_status(401),
            Err(ServerCommError::IoPermanent(401))
        ));
        assert!(matches!(
            classify_status(500),
            Err(ServerCommError::IoTransient(_))
        ));
    }

    #[test]
    fn upload_status_classification_matches_retry_policy() {
        assert_eq!(classify_upload_status(200), UploadOutcome::Success);
        assert_eq!(classify_upload_status(404), UploadOutcome::ClientError);
        assert_eq!(classify_upload_status(408), UploadOutcome::Transient);
        assert_eq!(classify_upload_status(429), UploadOutcome::Transient);
        assert_eq!(classify_upload_status(503), UploadOutcome::Transient);
    }
}
