//! Shared data types for the apis-edge detection and event pipeline.
//!
//! These types are value types: once a call returns, the producer holds no
//! reference into the consumer's copy and vice versa.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unsigned modular subtraction for millisecond timestamps.
///
/// All track-age and duration arithmetic must go through this instead of
/// plain `-`, so a 32-bit millisecond counter rollover (~49 days of uptime)
/// never produces a negative-looking or underflowed duration.
pub fn wrapping_elapsed_ms(now: u32, earlier: u32) -> u32 {
    now.wrapping_sub(earlier)
}

/// Metadata describing a captured camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    /// Capture timestamp, milliseconds since an arbitrary epoch (wraps at u32::MAX).
    pub timestamp_ms: u32,
}

/// A borrowed luminance frame, valid for the duration of one `Motion::detect` call.
pub struct Frame<'a> {
    pub meta: FrameMeta,
    luma: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Build a frame view over a luminance plane. Panics if `luma` is shorter
    /// than `width * height` — callers own frame capture and must size buffers
    /// correctly before handing them to the pipeline.
    pub fn new(width: u32, height: u32, timestamp_ms: u32, luma: &'a [u8]) -> Self {
        assert!(
            luma.len() >= (width as usize) * (height as usize),
            "luma buffer shorter than width*height"
        );
        Self {
            meta: FrameMeta {
                width,
                height,
                timestamp_ms,
            },
            luma,
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.luma[(y * self.meta.width + x) as usize]
    }

    #[inline]
    pub fn luma(&self) -> &[u8] {
        self.luma
    }
}

/// Axis-aligned bounding box produced by Motion, per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn area(&self) -> u32 {
        self.w.saturating_mul(self.h)
    }

    pub fn centroid(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }

    pub fn min_side(&self) -> u32 {
        self.w.min(self.h)
    }

    pub fn max_side(&self) -> u32 {
        self.w.max(self.h)
    }

    /// w/h, following the convention `min_aspect_ratio <= w/h <= max_aspect_ratio`.
    pub fn aspect_ratio(&self) -> f64 {
        if self.h == 0 {
            f64::INFINITY
        } else {
            self.w as f64 / self.h as f64
        }
    }
}

/// Stable per-process track identity, monotonically assigned.
pub type TrackId = u64;

/// Bounded ring of recent centroids, sized to cover the configured hover window.
#[derive(Debug, Clone)]
pub struct CentroidHistory {
    entries: VecDeque<(u32, (f64, f64))>,
    capacity: usize,
}

impl CentroidHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, timestamp_ms: u32, centroid: (f64, f64)) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp_ms, centroid));
    }

    pub fn latest(&self) -> Option<(f64, f64)> {
        self.entries.back().map(|(_, c)| *c)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest pairwise Euclidean distance between any two centroids in the window.
    pub fn max_pairwise_distance(&self) -> f64 {
        let mut max_dist = 0.0f64;
        for i in 0..self.entries.len() {
            for j in (i + 1)..self.entries.len() {
                let (_, (x1, y1)) = self.entries[i];
                let (_, (x2, y2)) = self.entries[j];
                let d = ((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt();
                if d > max_dist {
                    max_dist = d;
                }
            }
        }
        max_dist
    }

    /// Span of the window in milliseconds, wrap-safe.
    pub fn window_duration_ms(&self) -> u32 {
        match (self.entries.front(), self.entries.back()) {
            (Some((oldest, _)), Some((newest, _))) => wrapping_elapsed_ms(*newest, *oldest),
            _ => 0,
        }
    }
}

/// A moving region tracked across frames.
#[derive(Debug, Clone)]
pub struct TrackedRegion {
    pub track_id: TrackId,
    pub region: Region,
    pub created_ms: u32,
    pub last_seen_ms: u32,
    pub centroid: (f64, f64),
    pub history: CentroidHistory,
    /// Frames since the last successful match; retired once this exceeds `max_lost_frames`.
    pub frames_since_match: u32,
}

/// Size classification, assigned before confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeTag {
    TooSmall,
    Unknown,
    Hornet,
    TooLarge,
}

/// Confidence tier assigned to a classified detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
        }
    }
}

/// A tracked region after size and hover classification.
#[derive(Debug, Clone)]
pub struct ClassifiedDetection {
    pub track_id: TrackId,
    pub region: Region,
    pub size_tag: SizeTag,
    pub confidence: Confidence,
    pub is_hovering: bool,
    pub hover_duration_ms: u32,
    pub track_age_ms: u32,
}

/// A row in the local event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    pub confidence: String,
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    pub area: i64,
    pub hover_duration_ms: i64,
    pub laser_fired: bool,
    pub clip_file: Option<String>,
    pub synced: bool,
}

/// A freshly classified HIGH-confidence detection, ready to be logged.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub timestamp: String,
    pub confidence: Confidence,
    pub region: Region,
    pub hover_duration_ms: u32,
    pub laser_fired: bool,
    pub clip_file: Option<String>,
}

/// Lifecycle state of a queued clip upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipStatus {
    Pending,
    Uploading,
    Done,
    FailedPermanent,
}

/// An entry in the ClipUploader's bounded retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedClip {
    pub clip_id: i64,
    pub path: PathBuf,
    pub target_url: String,
    pub retry_count: u32,
    /// Unix milliseconds of the earliest time this entry is eligible to upload again.
    pub next_attempt_unix_ms: u64,
    pub status: ClipStatus,
}
