//! Camera frame-producer interface. Real GPIO/sensor capture is out of
//! scope here — [`CameraSource`] is the seam a platform backend fills in.
//! This crate also owns JPEG encoding of the latest frame for the `/stream`
//! endpoint.

use std::sync::Mutex;

use tracing::warn;
use types::FrameMeta;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("invalid camera configuration: {0}")]
    InvalidInput(String),
    #[error("camera not ready")]
    NotReady,
    #[error("camera I/O error: {0}")]
    IoTransient(String),
}

impl CameraError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            CameraError::InvalidInput(_) => "INVALID_INPUT",
            CameraError::NotReady => "NOT_READY",
            CameraError::IoTransient(_) => "IO_TRANSIENT",
        }
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One captured frame, owned. Borrowed briefly as a [`types::Frame`] by
/// Motion for the duration of one `detect` call.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub meta: FrameMeta,
    pub luma: Vec<u8>,
}

impl CapturedFrame {
    pub fn as_frame(&self) -> types::Frame<'_> {
        types::Frame::new(self.meta.width, self.meta.height, self.meta.timestamp_ms, &self.luma)
    }
}

/// Platform seam: a real backend opens the sensor/USB device and decodes
/// frames into an 8-bit luminance plane. Called synchronously from the
/// detection pipeline thread — it never blocks on network I/O.
pub trait CameraSource: Send {
    fn next_frame(&mut self) -> Result<CapturedFrame>;
}

/// Lists capture devices the platform backend can see. Interface only — the
/// real enumeration logic lives in the platform backend.
pub fn detect_cameras() -> Vec<String> {
    warn!("detect_cameras: no platform backend wired in this build");
    Vec::new()
}

/// Synthetic frame source for development and integration tests: a bright
/// square drifting diagonally over a flat background.
pub struct SyntheticCameraSource {
    width: u32,
    height: u32,
    frame_no: u32,
    frame_interval_ms: u32,
}

impl SyntheticCameraSource {
    pub fn new(config: &CameraConfig) -> Self {
        let frame_interval_ms = if config.fps == 0 { 33 } else { 1000 / config.fps };
        Self {
            width: config.width,
            height: config.height,
            frame_no: 0,
            frame_interval_ms,
        }
    }
}

impl CameraSource for SyntheticCameraSource {
    fn next_frame(&mut self) -> Result<CapturedFrame> {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return Err(CameraError::InvalidInput("zero-sized frame".to_string()));
        }
        let mut luma = vec![30u8; (w * h) as usize];

        let square_size = (w.min(h) / 8).max(4);
        let travel_w = w.saturating_sub(square_size).max(1);
        let travel_h = h.saturating_sub(square_size).max(1);
        let step = self.frame_no % (travel_w + travel_h).max(1);
        let (sx, sy) = if step < travel_w {
            (step, 0)
        } else {
            (travel_w, (step - travel_w).min(travel_h))
        };

        for y in sy..(sy + square_size).min(h) {
            for x in sx..(sx + square_size).min(w) {
                luma[(y * w + x) as usize] = 220;
            }
        }

        let meta = FrameMeta {
            width: w,
            height: h,
            timestamp_ms: self.frame_no.wrapping_mul(self.frame_interval_ms),
        };
        self.frame_no = self.frame_no.wrapping_add(1);
        Ok(CapturedFrame { meta, luma })
    }
}

/// Holds the most recently captured frame, JPEG-encoded, for the `/stream`
/// endpoint. Updated once per detection pipeline iteration.
pub struct LatestFrameBuffer {
    jpeg: Mutex<Option<Vec<u8>>>,
}

impl LatestFrameBuffer {
    pub fn new() -> Self {
        Self {
            jpeg: Mutex::new(None),
        }
    }

    pub fn update(&self, frame: &CapturedFrame) {
        match encode_jpeg(frame) {
            Ok(bytes) => {
                *self.jpeg.lock().expect("frame buffer mutex poisoned") = Some(bytes);
            }
            Err(e) => warn!(error = %e, "failed to encode frame for stream"),
        }
    }
}

impl Default for LatestFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl localhttp::StreamSource for LatestFrameBuffer {
    fn latest_jpeg(&self) -> Option<Vec<u8>> {
        self.jpeg.lock().expect("frame buffer mutex poisoned").clone()
    }
}

fn encode_jpeg(frame: &CapturedFrame) -> Result<Vec<u8>> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, ImageEncoder};

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, 80);
    encoder
        .write_image(
            &frame.luma,
            frame.meta.width,
            frame.meta.height,
            ExtendedColorType::L8,
        )
        .map_err(|e| CameraError::IoTransient(e.to_string()))?;
    Ok(out)
}
