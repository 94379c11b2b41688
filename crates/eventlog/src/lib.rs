//! Durable SQLite-backed event log with write-ahead logging, sync flagging,
//! and retention pruning. The exclusive lock around the connection covers
//! auto-prune and the triggering log write in the same critical section, so
//! two threads can never race to prune.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use types::{Event, NewEvent};

/// Hard ceiling on rows any single query can return, regardless of requested limit.
pub const MAX_PER_QUERY: i64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("invalid query bound: {0}")]
    InvalidInput(String),
    #[error("sqlite error: {0}")]
    IoTransient(#[from] rusqlite::Error),
    #[error("event store integrity check failed: {0}")]
    Corruption(String),
}

impl EventLogError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            EventLogError::InvalidInput(_) => "INVALID_INPUT",
            EventLogError::IoTransient(_) => "IO_TRANSIENT",
            EventLogError::Corruption(_) => "CORRUPTION",
        }
    }
}

pub type Result<T> = std::result::Result<T, EventLogError>;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub prune_days: u32,
    pub min_free_mb: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LogStatus {
    pub total_rows: i64,
    pub free_mb: u64,
    pub total_mb: u64,
    pub db_size_mb: u64,
    pub warning: bool,
}

pub struct EventLogger {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    retention: RetentionConfig,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    confidence TEXT NOT NULL,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    w INTEGER NOT NULL,
    h INTEGER NOT NULL,
    area INTEGER NOT NULL,
    hover_duration_ms INTEGER NOT NULL,
    laser_fired INTEGER NOT NULL,
    clip_file TEXT,
    synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_synced ON events(synced);
CREATE INDEX IF NOT EXISTS idx_events_timestamp_synced ON events(timestamp, synced);
CREATE INDEX IF NOT EXISTS idx_events_clip_file ON events(clip_file);
";

impl EventLogger {
    pub fn init(path: impl AsRef<Path>, retention: RetentionConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EventLogError::IoTransient(rusqlite::Error::ModuleError(e.to_string()))
            })?;
        }
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %db_path.display(), "event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            retention,
        })
    }

    /// Insert a row, then synchronously prune if storage is below the
    /// configured watermark, all within one lock acquisition.
    pub fn log(&self, event: NewEvent) -> Result<i64> {
        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        conn.execute(
            "INSERT INTO events (timestamp, confidence, x, y, w, h, area, hover_duration_ms, laser_fired, clip_file, synced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                event.timestamp,
                event.confidence.as_str(),
                event.region.x,
                event.region.y,
                event.region.w,
                event.region.h,
                event.region.area(),
                event.hover_duration_ms,
                event.laser_fired,
                event.clip_file,
            ],
        )?;
        let id = conn.last_insert_rowid();

        if let Ok(free_mb) = disk_free_mb(&self.db_path) {
            if free_mb < self.retention.min_free_mb as u64 {
                let deleted = prune_locked(&conn, self.retention.prune_days)?;
                if deleted > 0 {
                    warn!(deleted, free_mb, "low storage, pruned old synced events");
                }
            }
        }

        Ok(id)
    }

    pub fn get_events(
        &self,
        since: Option<&str>,
        until: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        if limit <= 0 {
            return Err(EventLogError::InvalidInput(
                "limit must be positive".to_string(),
            ));
        }
        let limit = limit.min(MAX_PER_QUERY);
        for bound in [since, until].into_iter().flatten() {
            if DateTime::parse_from_rfc3339(bound).is_err() {
                return Err(EventLogError::InvalidInput(format!(
                    "`{bound}` is not a valid ISO-8601 timestamp"
                )));
            }
        }

        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        let sql = "SELECT id, timestamp, confidence, x, y, w, h, area, hover_duration_ms, laser_fired, clip_file, synced
                    FROM events
                    WHERE (?1 IS NULL OR timestamp >= ?1)
                      AND (?2 IS NULL OR timestamp <= ?2)
                    ORDER BY timestamp DESC, id DESC
                    LIMIT ?3";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![since, until, limit], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_unsynced(&self, limit: i64) -> Result<Vec<Event>> {
        if limit <= 0 {
            return Err(EventLogError::InvalidInput(
                "limit must be positive".to_string(),
            ));
        }
        let limit = limit.min(MAX_PER_QUERY);
        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, confidence, x, y, w, h, area, hover_duration_ms, laser_fired, clip_file, synced
             FROM events WHERE synced = 0 ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marks a single row synced. Returns the masked-as-bool semantics of
    /// `mark_synced_batch` for a one-element slice.
    pub fn mark_synced(&self, id: i64) -> Result<usize> {
        self.mark_synced_batch(&[id])
    }

    /// NULL/empty input is a distinguished not-an-error: returns `0`.
    pub fn mark_synced_batch(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        let mut marked = 0usize;
        for id in ids {
            marked += conn.execute("UPDATE events SET synced = 1 WHERE id = ?1", params![id])?;
        }
        Ok(marked)
    }

    pub fn clear_clip_reference(&self, path: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        let n = conn.execute(
            "UPDATE events SET clip_file = NULL WHERE clip_file = ?1",
            params![path],
        )?;
        Ok(n)
    }

    pub fn get_status(&self) -> Result<LogStatus> {
        let conn = self.conn.lock().expect("eventlog mutex poisoned");
        let total_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
                .optional()?
                .unwrap_or(0);
        let (free_mb, total_mb) = disk_stats_mb(&self.db_path).unwrap_or((0, 0));
        let db_size_mb = std::fs::metadata(&self.db_path)
            .map(|m| m.len() / (1024 * 1024))
            .unwrap_or(0);
        Ok(LogStatus {
            total_rows,
            free_mb,
            total_mb,
            db_size_mb,
            warning: free_mb < self.retention.min_free_mb as u64,
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        confidence: row.get(2)?,
        x: row.get(3)?,
        y: row.get(4)?,
        w: row.get(5)?,
        h: row.get(6)?,
        area: row.get(7)?,
        hover_duration_ms: row.get(8)?,
        laser_fired: row.get(9)?,
        clip_file: row.get(10)?,
        synced: row.get(11)?,
    })
}

fn prune_locked(conn: &Connection, prune_days: u32) -> Result<usize> {
    let cutoff = Utc::now() - Duration::days(prune_days as i64);
    let cutoff = cutoff.to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM events WHERE synced = 1 AND timestamp < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}

fn disk_free_mb(db_path: &Path) -> std::result::Result<u64, ()> {
    disk_stats_mb(db_path).map(|(free, _)| free)
}

fn disk_stats_mb(db_path: &Path) -> std::result::Result<(u64, u64), ()> {
    use sysinfo::Disks;
    let target = db_path.parent().unwrap_or(Path::new("/"));
    let target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&Path, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let better = match best {
                Some((best_mount, _, _)) => mount.as_os_str().len() > best_mount.as_os_str().len(),
                None => true,
            };
            if better {
                best = Some((mount, disk.available_space(), disk.total_space()));
            }
        }
    }
    match best {
        Some((_, free, total)) => Ok((free / (1024 * 1024), total / (1024 * 1024))),
        None => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use types::{Confidence, Region};

    fn sample_event(ts: &str) -> NewEvent {
        NewEvent {
            timestamp: ts.to_string(),
            confidence: Confidence::High,
            region: Region { x: 1, y: 2, w: 3, h: 4 },
            hover_duration_ms: 2000,
            laser_fired: true,
            clip_file: None,
        }
    }

    fn open(dir: &tempfile::TempDir) -> EventLogger {
        EventLogger::init(
            dir.path().join("events.db"),
            RetentionConfig {
                prune_days: 30,
                min_free_mb: 0, // never trigger auto-prune in these tests
            },
        )
        .unwrap()
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let id1 = log.log(sample_event("2026-01-01T00:00:00+00:00")).unwrap();
        let id2 = log.log(sample_event("2026-01-01T00:00:01+00:00")).unwrap();
        let id3 = log.log(sample_event("2026-01-01T00:00:02+00:00")).unwrap();
        assert!(id1 < id2 && id2 < id3);
    }

    #[test]
    fn get_events_respects_limit_and_order() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        for i in 0..10 {
            log.log(sample_event(&format!("2026-01-01T00:00:{i:02}+00:00")))
                .unwrap();
        }
        let events = log.get_events(None, None, 5).unwrap();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn invalid_timestamp_bound_is_rejected() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let result = log.get_events(Some("not-a-timestamp"), None, 10);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().error_kind(), "INVALID_INPUT");
    }

    #[test]
    fn mark_synced_batch_empty_is_zero_not_error() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let n = log.mark_synced_batch(&[]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn mark_synced_then_unsynced_query_excludes_it() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let id = log.log(sample_event("2026-01-01T00:00:00+00:00")).unwrap();
        assert_eq!(log.mark_synced(id).unwrap(), 1);
        let unsynced = log.get_unsynced(10).unwrap();
        assert!(unsynced.is_empty());
    }

    #[test]
    fn clear_clip_reference_nulls_matching_rows() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let mut event = sample_event("2026-01-01T00:00:00+00:00");
        event.clip_file = Some("/clips/1.mp4".to_string());
        log.log(event).unwrap();
        let n = log.clear_clip_reference("/clips/1.mp4").unwrap();
        assert_eq!(n, 1);
        let rows = log.get_events(None, None, 10).unwrap();
        assert_eq!(rows[0].clip_file, None);
    }

    #[test]
    fn prune_removes_old_synced_rows_and_keeps_unsynced() {
        let dir = tempdir().unwrap();
        let log = open(&dir);
        let old_id = log.log(sample_event("2000-01-01T00:00:00+00:00")).unwrap();
        let unsynced_old_id = log.log(sample_event("2000-01-01T00:00:01+00:00")).unwrap();
        log.mark_synced(old_id).unwrap();

        let conn = log.conn.lock().unwrap();
        let deleted = prune_locked(&conn, 30).unwrap();
        drop(conn);
        assert_eq!(deleted, 1);

        let remaining = log.get_events(None, None, 10).unwrap();
        assert!(remaining.iter().any(|e| e.id == unsynced_old_id));
        assert!(!remaining.iter().any(|e| e.id == old_id));
    }
}
