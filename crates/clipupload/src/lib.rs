//! Bounded retry queue for uploading detection clips, with exponential
//! backoff and a rate-limited worker tick.
//!
//! The queue's exclusive lock is never held during network I/O: the worker
//! takes the lock, picks the next eligible clip, clones it, releases the
//! lock, performs the upload, then re-takes the lock to record the outcome.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;
use types::{ClipStatus, QueuedClip};

/// Queue entries beyond this are dropped, oldest PENDING first.
pub const MAX_QUEUE_LEN: usize = 50;
/// Minimum spacing between two successful uploads.
pub const MIN_UPLOAD_INTERVAL_S: u64 = 30;
/// Interval at which the worker wakes to look for eligible clips.
pub const WORKER_TICK_S: u64 = 5;
/// Retries before a transient failure is treated as permanent.
pub const MAX_RETRIES: u32 = 10;
/// Persisted queue file is discarded, not trusted, past this size.
pub const MAX_PERSISTED_QUEUE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClipMetadata {
    pub id: i64,
    pub timestamp: String,
    pub confidence: String,
}

/// Result of attempting one upload, classified per the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// 4xx other than 408/429 — not worth retrying.
    ClientError,
    /// 408, 429, 5xx, network error, DNS error.
    Transient,
    /// Formatted request would have exceeded the transport's buffer.
    RequestTooLarge,
}

/// Performs the actual network upload. Implemented by ServerComm in the daemon;
/// kept as a trait here so ClipUploader's queue/retry logic has no dependency
/// on any particular transport.
pub trait ClipTransport: Send + Sync {
    fn upload(&self, path: &Path, metadata: &ClipMetadata) -> UploadOutcome;
}

/// Notified when a clip finishes uploading successfully, so the event log's
/// `clip_file` reference can be cleared. Keeps ClipUploader from depending on
/// the event log crate directly.
pub trait ClipCompletionSink: Send + Sync {
    fn clip_uploaded(&self, path: &Path);
}

#[derive(Debug, Default)]
struct Stats {
    enqueued: AtomicU64,
    dropped_overflow: AtomicU64,
    uploaded: AtomicU64,
    retried: AtomicU64,
    failed_permanent: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ClipUploaderStats {
    pub enqueued: u64,
    pub dropped_overflow: u64,
    pub uploaded: u64,
    pub retried: u64,
    pub failed_permanent: u64,
    pub pending: u64,
    pub next_attempt_eta_unix_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedQueue {
    clips: Vec<QueuedClip>,
}

pub struct ClipUploader {
    queue: Mutex<VecDeque<QueuedClip>>,
    stats: Stats,
    persist_path: Option<PathBuf>,
    transport: Option<Box<dyn ClipTransport>>,
    sink: Option<Box<dyn ClipCompletionSink>>,
    last_success_unix_ms: AtomicU64,
}

impl ClipUploader {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let queue = persist_path
            .as_deref()
            .map(load_persisted_queue)
            .unwrap_or_default();
        Self {
            queue: Mutex::new(queue),
            stats: Stats::default(),
            persist_path,
            transport: None,
            sink: None,
            last_success_unix_ms: AtomicU64::new(0),
        }
    }

    pub fn with_transport(mut self, transport: Box<dyn ClipTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ClipCompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Enqueue a clip for upload. A no-op if `path` is already queued.
    /// On overflow, the oldest PENDING entry is dropped to make room.
    pub fn enqueue(&self, clip_id: i64, path: PathBuf, target_url: String, now_unix_ms: u64) {
        let mut queue = self.queue.lock().expect("clip queue mutex poisoned");
        if queue.iter().any(|c| c.path == path) {
            return;
        }
        if queue.len() >= MAX_QUEUE_LEN {
            if let Some(pos) = queue.iter().position(|c| c.status == ClipStatus::Pending) {
                queue.remove(pos);
                self.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
        queue.push_back(QueuedClip {
            clip_id,
            path,
            target_url,
            retry_count: 0,
            next_attempt_unix_ms: now_unix_ms,
            status: ClipStatus::Pending,
        });
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.persist();
    }

    /// One worker wake. Uploads at most one eligible clip, honoring the
    /// minimum spacing between successful uploads.
    pub fn tick(&self, now_unix_ms: u64, metadata_for: impl Fn(i64) -> ClipMetadata) {
        let last_success = self.last_success_unix_ms.load(Ordering::Relaxed);
        if last_success > 0
            && now_unix_ms.saturating_sub(last_success) < MIN_UPLOAD_INTERVAL_S * 1000
        {
            return;
        }

        let Some(transport) = self.transport.as_ref() else {
            return;
        };

        let candidate = {
            let queue = self.queue.lock().expect("clip queue mutex poisoned");
            queue
                .iter()
                .find(|c| c.status == ClipStatus::Pending && c.next_attempt_unix_ms <= now_unix_ms)
                .cloned()
        };
        let Some(mut clip) = candidate else {
            return;
        };

        {
            let mut queue = self.queue.lock().expect("clip queue mutex poisoned");
            if let Some(entry) = queue.iter_mut().find(|c| c.path == clip.path) {
                entry.status = ClipStatus::Uploading;
            }
        }

        let metadata = metadata_for(clip.clip_id);
        let outcome = transport.upload(&clip.path, &metadata);

        match outcome {
            UploadOutcome::Success => {
                self.remove_clip(&clip.path);
                self.stats.uploaded.fetch_add(1, Ordering::Relaxed);
                self.last_success_unix_ms
                    .store(now_unix_ms, Ordering::Relaxed);
                if let Some(sink) = self.sink.as_ref() {
                    sink.clip_uploaded(&clip.path);
                }
                if let Err(e) = std::fs::remove_file(&clip.path) {
                    warn!(path = %clip.path.display(), error = %e, "failed to remove uploaded clip file");
                }
            }
            UploadOutcome::ClientError | UploadOutcome::RequestTooLarge => {
                self.set_status(&clip.path, ClipStatus::FailedPermanent);
                self.stats.failed_permanent.fetch_add(1, Ordering::Relaxed);
            }
            UploadOutcome::Transient => {
                clip.retry_count += 1;
                if clip.retry_count > MAX_RETRIES {
                    self.set_status(&clip.path, ClipStatus::FailedPermanent);
                    self.stats.failed_permanent.fetch_add(1, Ordering::Relaxed);
                } else {
                    let backoff_s = backoff_seconds(clip.retry_count);
                    let next = now_unix_ms + backoff_s * 1000;
                    self.update_retry(&clip.path, clip.retry_count, next);
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.persist();
    }

    fn remove_clip(&self, path: &Path) {
        let mut queue = self.queue.lock().expect("clip queue mutex poisoned");
        queue.retain(|c| c.path != path);
    }

    fn set_status(&self, path: &Path, status: ClipStatus) {
        let mut queue = self.queue.lock().expect("clip queue mutex poisoned");
        if let Some(entry) = queue.iter_mut().find(|c| c.path == path) {
            entry.status = status;
        }
    }

    fn update_retry(&self, path: &Path, retry_count: u32, next_attempt_unix_ms: u64) {
        let mut queue = self.queue.lock().expect("clip queue mutex poisoned");
        if let Some(entry) = queue.iter_mut().find(|c| c.path == path) {
            entry.retry_count = retry_count;
            entry.next_attempt_unix_ms = next_attempt_unix_ms;
            entry.status = ClipStatus::Pending;
        }
    }

    pub fn get_stats(&self) -> ClipUploaderStats {
        let queue = self.queue.lock().expect("clip queue mutex poisoned");
        let pending = queue
            .iter()
            .filter(|c| c.status == ClipStatus::Pending)
            .count() as u64;
        let next_attempt_eta_unix_ms = queue
            .iter()
            .filter(|c| c.status == ClipStatus::Pending)
            .map(|c| c.next_attempt_unix_ms)
            .min();
        ClipUploaderStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped_overflow: self.stats.dropped_overflow.load(Ordering::Relaxed),
            uploaded: self.stats.uploaded.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            failed_permanent: self.stats.failed_permanent.load(Ordering::Relaxed),
            pending,
            next_attempt_eta_unix_ms,
        }
    }

    /// Run the worker loop: wake every [`WORKER_TICK_S`], tick, repeat, until
    /// `stop` is set. `now_unix_ms` supplies wall-clock time so the daemon
    /// controls the clock source (real time on hardware, a test clock in tests).
    pub async fn run(
        self: std::sync::Arc<Self>,
        mut stop: tokio::sync::watch::Receiver<bool>,
        now_unix_ms: impl Fn() -> u64,
        metadata_for: impl Fn(i64) -> ClipMetadata,
    ) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(WORKER_TICK_S));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(now_unix_ms(), &metadata_for);
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn persist(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let queue = self.queue.lock().expect("clip queue mutex poisoned");
        let persisted = PersistedQueue {
            clips: queue.iter().cloned().collect(),
        };
        drop(queue);
        match serde_json::to_string(&persisted) {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "failed to persist clip queue");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize clip queue"),
        }
    }
}

/// `next_attempt - now`, seconds, for the 1-indexed retry count `n`.
fn backoff_seconds(retry_count: u32) -> u64 {
    let exp = 60u64.saturating_mul(1u64 << (retry_count.saturating_sub(1)).min(63));
    exp.min(3600)
}

fn load_persisted_queue(path: &Path) -> VecDeque<QueuedClip> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return VecDeque::new(),
    };
    if meta.len() > MAX_PERSISTED_QUEUE_BYTES {
        warn!(path = %path.display(), "persisted clip queue too large, discarding");
        return VecDeque::new();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<PersistedQueue>(&contents) {
            Ok(persisted) => persisted.clips.into_iter().collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "persisted clip queue unreadable, discarding");
                VecDeque::new()
            }
        },
        Err(_) => VecDeque::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::tempdir;

    struct ScriptedTransport {
        outcomes: StdMutex<Vec<UploadOutcome>>,
        calls: Arc<StdMutex<Vec<PathBuf>>>,
    }

    impl ClipTransport for ScriptedTransport {
        fn upload(&self, path: &Path, _metadata: &ClipMetadata) -> UploadOutcome {
            self.calls.lock().unwrap().push(path.to_path_buf());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                UploadOutcome::Success
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct NullSink;
    impl ClipCompletionSink for NullSink {
        fn clip_uploaded(&self, _path: &Path) {}
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"clip").unwrap();
    }

    #[test]
    fn enqueue_of_duplicate_path_is_a_no_op() {
        let uploader = ClipUploader::new(None);
        uploader.enqueue(1, PathBuf::from("/c/1.mp4"), "http://s/api".into(), 0);
        uploader.enqueue(1, PathBuf::from("/c/1.mp4"), "http://s/api".into(), 0);
        assert_eq!(uploader.get_stats().pending, 1);
    }

    #[test]
    fn overflow_drops_oldest_pending_and_counts_it() {
        let uploader = ClipUploader::new(None);
        for i in 0..60 {
            uploader.enqueue(
                i,
                PathBuf::from(format!("/c/{i}.mp4")),
                "http://s/api".into(),
                0,
            );
        }
        let stats = uploader.get_stats();
        assert_eq!(stats.pending, 50);
        assert_eq!(stats.dropped_overflow, 10);
    }

    #[test]
    fn successful_upload_removes_clip_and_deletes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.mp4");
        touch(&path);

        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![]),
            calls: Arc::new(StdMutex::new(vec![])),
        };
        let uploader = ClipUploader::new(None)
            .with_transport(Box::new(transport))
            .with_sink(Box::new(NullSink));
        uploader.enqueue(1, path.clone(), "http://s/api".into(), 0);

        uploader.tick(1_000, |id| ClipMetadata {
            id,
            timestamp: "2026-01-01T00:00:00Z".into(),
            confidence: "HIGH".into(),
        });

        assert_eq!(uploader.get_stats().uploaded, 1);
        assert_eq!(uploader.get_stats().pending, 0);
        assert!(!path.exists());
    }

    #[test]
    fn client_error_moves_to_failed_permanent_and_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.mp4");
        touch(&path);

        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![UploadOutcome::ClientError]),
            calls: Arc::new(StdMutex::new(vec![])),
        };
        let uploader = ClipUploader::new(None).with_transport(Box::new(transport));
        uploader.enqueue(1, path.clone(), "http://s/api".into(), 0);
        uploader.tick(1_000, |id| ClipMetadata {
            id,
            timestamp: "2026-01-01T00:00:00Z".into(),
            confidence: "HIGH".into(),
        });

        assert_eq!(uploader.get_stats().failed_permanent, 1);
        assert!(path.exists());
    }

    #[test]
    fn transient_failure_schedules_backoff_retry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.mp4");
        touch(&path);

        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![UploadOutcome::Transient]),
            calls: Arc::new(StdMutex::new(vec![])),
        };
        let uploader = ClipUploader::new(None).with_transport(Box::new(transport));
        uploader.enqueue(1, path.clone(), "http://s/api".into(), 0);
        uploader.tick(1_000, |id| ClipMetadata {
            id,
            timestamp: "2026-01-01T00:00:00Z".into(),
            confidence: "HIGH".into(),
        });

        let stats = uploader.get_stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.pending, 1);
        let eta = stats.next_attempt_eta_unix_ms.unwrap();
        assert!(eta - 1_000 >= 60_000);
    }

    #[test]
    fn backoff_is_exponential_capped_at_one_hour() {
        assert_eq!(backoff_seconds(1), 60);
        assert_eq!(backoff_seconds(2), 120);
        assert_eq!(backoff_seconds(3), 240);
        assert_eq!(backoff_seconds(20), 3600);
    }

    #[test]
    fn fifo_order_uploads_in_enqueue_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        let c = dir.path().join("c.mp4");
        for p in [&a, &b, &c] {
            touch(p);
        }
        let calls_handle = Arc::new(StdMutex::new(Vec::new()));
        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![]),
            calls: calls_handle.clone(),
        };
        let uploader = ClipUploader::new(None).with_transport(Box::new(transport));
        uploader.enqueue(1, a.clone(), "http://s/api".into(), 0);
        uploader.enqueue(2, b.clone(), "http://s/api".into(), 0);
        uploader.enqueue(3, c.clone(), "http://s/api".into(), 0);

        let mk = |id: i64| ClipMetadata {
            id,
            timestamp: "2026-01-01T00:00:00Z".into(),
            confidence: "HIGH".into(),
        };
        uploader.tick(0, mk);
        uploader.tick(60_000, mk);
        uploader.tick(120_000, mk);

        let calls = calls_handle.lock().unwrap();
        assert_eq!(*calls, vec![a, b, c]);
    }
}
