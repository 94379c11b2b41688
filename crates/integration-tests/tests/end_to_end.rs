//! Cross-crate scenarios that don't fit naturally in any one crate's own
//! test module: a real `ClipUploader` driving a mock transport and a real
//! `EventLogger`, and a real `ConfigStore` exercising its atomic-save
//! contract.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use clipupload::{ClipCompletionSink, ClipMetadata, ClipTransport, ClipUploader, UploadOutcome};
use config::{ConfigStore, ConfigUpdate};
use eventlog::{EventLogger, RetentionConfig};
use tempfile::tempdir;
use types::{Confidence, NewEvent, Region};

/// Returns a fixed sequence of outcomes, one per `upload` call; repeats the
/// last entry once exhausted.
struct ScriptedTransport {
    outcomes: Mutex<Vec<UploadOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(outcomes: Vec<UploadOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ClipTransport for ScriptedTransport {
    fn upload(&self, _path: &std::path::Path, _metadata: &ClipMetadata) -> UploadOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return UploadOutcome::Transient;
        }
        if outcomes.len() == 1 {
            outcomes[0]
        } else {
            outcomes.remove(0)
        }
    }
}

fn retention() -> RetentionConfig {
    RetentionConfig {
        prune_days: 30,
        min_free_mb: 10,
    }
}

fn write_clip_file(dir: &std::path::Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"fake clip bytes").unwrap();
    path
}

#[test]
fn successful_upload_removes_file_and_clears_event_clip_reference() {
    let dir = tempdir().unwrap();
    let event_logger = EventLogger::init(dir.path().join("events.db"), retention()).unwrap();

    let event_id = event_logger
        .log(NewEvent {
            timestamp: "2026-07-26T00:00:00Z".to_string(),
            confidence: Confidence::High,
            region: Region { x: 1, y: 1, w: 10, h: 10 },
            hover_duration_ms: 2000,
            laser_fired: false,
            clip_file: Some(dir.path().join("c1.mp4").to_string_lossy().to_string()),
        })
        .unwrap();

    let clip_path = write_clip_file(dir.path(), "c1.mp4");

    let uploader = ClipUploader::new(None)
        .with_transport(Box::new(ScriptedTransport::new(vec![UploadOutcome::Success])))
        .with_sink(Box::new(RecordingSinkForLog(&event_logger)));
    uploader.enqueue(event_id, clip_path.clone(), "http://server.local/clips".to_string(), 1_000);

    uploader.tick(1_000, |id| ClipMetadata {
        id,
        timestamp: "2026-07-26T00:00:00Z".to_string(),
        confidence: "HIGH".to_string(),
    });

    assert!(!clip_path.exists(), "uploaded clip file should be removed");
    let stats = uploader.get_stats();
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.pending, 0);

    let events = event_logger.get_events(None, None, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].clip_file, None, "clip reference should be cleared after upload");
}

/// Adapts a borrowed `&EventLogger` into a `ClipCompletionSink`; the daemon
/// uses an `Arc`-owning wrapper instead, but a plain reference is simpler
/// inside a test with a known lifetime.
struct RecordingSinkForLog<'a>(&'a EventLogger);

impl ClipCompletionSink for RecordingSinkForLog<'_> {
    fn clip_uploaded(&self, path: &std::path::Path) {
        if let Some(p) = path.to_str() {
            self.0.clear_clip_reference(p).unwrap();
        }
    }
}

#[test]
fn transient_failures_retry_with_increasing_backoff_then_succeed() {
    let dir = tempdir().unwrap();
    let clip_path = write_clip_file(dir.path(), "c2.mp4");

    let transport = ScriptedTransport::new(vec![
        UploadOutcome::Transient,
        UploadOutcome::Transient,
        UploadOutcome::Success,
    ]);
    let uploader = ClipUploader::new(None).with_transport(Box::new(transport));
    uploader.enqueue(7, clip_path.clone(), "http://server.local/clips".to_string(), 0);

    let metadata_for = |id| ClipMetadata {
        id,
        timestamp: String::new(),
        confidence: "HIGH".to_string(),
    };

    // First attempt fails transiently; retry_count becomes 1, next attempt >= 60s out.
    uploader.tick(0, metadata_for);
    let stats = uploader.get_stats();
    assert_eq!(stats.retried, 1);
    assert!(stats.next_attempt_eta_unix_ms.unwrap() >= 60_000);

    // Ticking before the backoff elapses does nothing.
    uploader.tick(30_000, metadata_for);
    assert_eq!(uploader.get_stats().retried, 1);

    // Second attempt also fails transiently; next attempt >= 120s out from then.
    uploader.tick(60_000, metadata_for);
    let stats = uploader.get_stats();
    assert_eq!(stats.retried, 2);
    assert!(stats.next_attempt_eta_unix_ms.unwrap() >= 60_000 + 120_000);

    // Third attempt (scripted) succeeds.
    uploader.tick(60_000 + 120_000, metadata_for);
    let stats = uploader.get_stats();
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.pending, 0);
    assert!(!clip_path.exists());
}

#[test]
fn client_error_marks_clip_failed_permanent_and_keeps_file_on_disk() {
    let dir = tempdir().unwrap();
    let clip_path = write_clip_file(dir.path(), "c3.mp4");

    let transport = ScriptedTransport::new(vec![UploadOutcome::ClientError]);
    let uploader = ClipUploader::new(None).with_transport(Box::new(transport));
    uploader.enqueue(9, clip_path.clone(), "http://server.local/clips".to_string(), 0);

    uploader.tick(0, |id| ClipMetadata {
        id,
        timestamp: String::new(),
        confidence: "HIGH".to_string(),
    });

    let stats = uploader.get_stats();
    assert_eq!(stats.failed_permanent, 1);
    assert_eq!(stats.uploaded, 0);
    assert!(clip_path.exists(), "client-error clip file must be retained, not deleted");

    // A later tick must not retry a FAILED_PERMANENT clip.
    uploader.tick(10_000_000, |id| ClipMetadata {
        id,
        timestamp: String::new(),
        confidence: "HIGH".to_string(),
    });
    assert_eq!(uploader.get_stats().failed_permanent, 1);
}

#[test]
fn config_update_out_of_range_is_rejected_and_file_is_byte_identical() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::init(&path).unwrap();
    // Force a write so there is a baseline file to compare against.
    store.update(ConfigUpdate {
        armed: Some(true),
        ..Default::default()
    }).unwrap();
    let before = std::fs::read_to_string(&path).unwrap();
    let before_config = store.get();

    let result = store.update(ConfigUpdate {
        heartbeat_interval_s: Some(99_999),
        ..Default::default()
    });
    assert!(result.is_err());

    let after = std::fs::read_to_string(&path).unwrap();
    assert_eq!(before, after, "rejected update must leave config.json untouched");
    assert_eq!(store.get(), before_config);
}

#[test]
fn querying_many_events_respects_limit_and_descending_order() {
    let dir = tempdir().unwrap();
    let event_logger = EventLogger::init(dir.path().join("events.db"), retention()).unwrap();

    for i in 0..200 {
        let ts = format!("2026-07-26T00:{:02}:{:02}Z", i / 60, i % 60);
        event_logger
            .log(NewEvent {
                timestamp: ts,
                confidence: Confidence::High,
                region: Region { x: 0, y: 0, w: 5, h: 5 },
                hover_duration_ms: 1500,
                laser_fired: false,
                clip_file: None,
            })
            .unwrap();
    }

    let events = event_logger.get_events(None, None, 50).unwrap();
    assert_eq!(events.len(), 50);
    for pair in events.windows(2) {
        assert!(pair[0].id > pair[1].id, "ids must be strictly descending");
    }
}

#[test]
fn config_save_round_trips_and_leaves_no_dangling_temp_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    let store = ConfigStore::init(&path).unwrap();

    for i in 0..20 {
        store
            .update(ConfigUpdate {
                heartbeat_interval_s: Some(15 + i),
                ..Default::default()
            })
            .unwrap();
    }

    let reloaded = ConfigStore::init(&path).unwrap();
    assert_eq!(reloaded.get(), store.get());

    let tmp_path = dir.path().join(".config.json.tmp");
    assert!(!tmp_path.exists(), "atomic rename must not leave a temp file behind");
}
