//! ConfigStore: typed, validated, atomically-persisted device configuration.
//!
//! The on-disk record (`config.json`) is always a complete, valid document —
//! writes go to a temp file in the same directory followed by a rename, so a
//! crash mid-save can never leave a partial file behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("config store not initialized")]
    NotReady,
    #[error("I/O error persisting configuration: {0}")]
    IoTransient(#[from] io::Error),
    #[error("configuration file is corrupt: {0}")]
    Corruption(String),
}

impl ConfigError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            ConfigError::InvalidInput { .. } => "INVALID_INPUT",
            ConfigError::NotReady => "NOT_READY",
            ConfigError::IoTransient(_) => "IO_TRANSIENT",
            ConfigError::Corruption(_) => "CORRUPTION",
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Full configuration record, versioned for forward migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub schema_version: u32,
    pub device_id: String,
    pub device_name: String,
    pub network: NetworkConfig,
    pub detection: DetectionConfig,
    pub actuator: ActuatorConfig,
    pub retention: RetentionConfig,
    pub armed: bool,
    pub needs_setup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub server_url: String,
    pub api_key: String,
    pub heartbeat_interval_s: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub min_size_px: u32,
    pub hornet_min_size_px: u32,
    pub hornet_max_size_px: u32,
    pub hover_time_ms: u32,
    pub hover_radius_px: f64,
    pub learning_rate: f64,
    pub min_area: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Accepted and logged, never implemented — see Motion's detect().
    pub detect_shadows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub servo_enabled: bool,
    pub pan_limit_deg: f64,
    pub tilt_limit_deg: f64,
    pub laser_enabled: bool,
    pub laser_safety_timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub prune_days: u32,
    pub min_free_mb: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            device_id: format!("apis-{}", uuid::Uuid::new_v4().simple()),
            device_name: "apis-edge".to_string(),
            network: NetworkConfig {
                wifi_ssid: String::new(),
                wifi_password: String::new(),
                server_url: String::new(),
                api_key: String::new(),
                heartbeat_interval_s: 30,
            },
            detection: DetectionConfig {
                min_size_px: 8,
                hornet_min_size_px: 20,
                hornet_max_size_px: 80,
                hover_time_ms: 1500,
                hover_radius_px: 12.0,
                learning_rate: 0.001,
                min_area: 16,
                min_aspect_ratio: 0.3,
                max_aspect_ratio: 3.0,
                detect_shadows: false,
            },
            actuator: ActuatorConfig {
                servo_enabled: false,
                pan_limit_deg: 45.0,
                tilt_limit_deg: 30.0,
                laser_enabled: false,
                laser_safety_timeout_ms: 2000,
            },
            retention: RetentionConfig {
                prune_days: 30,
                min_free_mb: 200,
            },
            armed: false,
            needs_setup: true,
        }
    }
}

/// Masked configuration, safe to hand to an untrusted caller (the `/config` endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct MaskedConfig {
    pub schema_version: u32,
    pub device_id: String,
    pub device_name: String,
    pub server_url: String,
    pub api_key: String,
    pub heartbeat_interval_s: u32,
    pub armed: bool,
    pub needs_setup: bool,
}

fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}…{}", &key[..4], &key[key.len() - 4..])
    }
}

impl Config {
    pub fn masked(&self) -> MaskedConfig {
        MaskedConfig {
            schema_version: self.schema_version,
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            server_url: self.network.server_url.clone(),
            api_key: mask_api_key(&self.network.api_key),
            heartbeat_interval_s: self.network.heartbeat_interval_s,
            armed: self.armed,
            needs_setup: self.needs_setup,
        }
    }
}

/// Partial update applied to a [`Config`]. Every field is optional; absent
/// fields keep the prior value. Validation is total: every present field is
/// range-checked before anything is mutated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub device_name: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub heartbeat_interval_s: Option<u32>,
    pub min_size_px: Option<u32>,
    pub hornet_min_size_px: Option<u32>,
    pub hornet_max_size_px: Option<u32>,
    pub hover_time_ms: Option<u32>,
    pub hover_radius_px: Option<f64>,
    pub learning_rate: Option<f64>,
    pub min_area: Option<u32>,
    pub min_aspect_ratio: Option<f64>,
    pub max_aspect_ratio: Option<f64>,
    pub detect_shadows: Option<bool>,
    pub servo_enabled: Option<bool>,
    pub pan_limit_deg: Option<f64>,
    pub tilt_limit_deg: Option<f64>,
    pub laser_enabled: Option<bool>,
    pub laser_safety_timeout_ms: Option<u32>,
    pub prune_days: Option<u32>,
    pub min_free_mb: Option<u32>,
    pub armed: Option<bool>,
}

fn in_range_u32(field: &'static str, value: u32, lo: u32, hi: u32) -> Result<()> {
    if value < lo || value > hi {
        Err(ConfigError::invalid(
            field,
            format!("{value} not in [{lo}, {hi}]"),
        ))
    } else {
        Ok(())
    }
}

fn in_range_f64(field: &'static str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if !(lo..=hi).contains(&value) {
        Err(ConfigError::invalid(
            field,
            format!("{value} not in [{lo}, {hi}]"),
        ))
    } else {
        Ok(())
    }
}

/// Validate an update against a base config and return the merged result.
/// Performs no mutation of `base`; every field is checked before any is applied.
fn apply_update(base: &Config, update: &ConfigUpdate) -> Result<Config> {
    if let Some(v) = update.heartbeat_interval_s {
        in_range_u32("heartbeat_interval_s", v, 10, 3600)?;
    }
    if let Some(v) = update.min_size_px {
        in_range_u32("min_size_px", v, 1, 200)?;
    }
    if let Some(v) = update.hover_time_ms {
        in_range_u32("hover_time_ms", v, 0, 10_000)?;
    }
    if let Some(v) = update.learning_rate {
        if !(v > 0.0 && v <= 1.0) {
            return Err(ConfigError::invalid(
                "learning_rate",
                format!("{v} not in (0.0, 1.0]"),
            ));
        }
    }
    if let Some(v) = update.min_area {
        if v == 0 {
            return Err(ConfigError::invalid("min_area", "must be > 0"));
        }
    }
    if let Some(v) = update.prune_days {
        in_range_u32("prune_days", v, 1, 365)?;
    }
    if let Some(v) = update.min_free_mb {
        in_range_u32("min_free_mb", v, 10, 10_000)?;
    }
    let hornet_min = update
        .hornet_min_size_px
        .unwrap_or(base.detection.hornet_min_size_px);
    let hornet_max = update
        .hornet_max_size_px
        .unwrap_or(base.detection.hornet_max_size_px);
    if hornet_min == 0 || hornet_max == 0 || hornet_min > hornet_max {
        return Err(ConfigError::invalid(
            "hornet_min_size_px",
            format!("min {hornet_min} must be > 0 and <= max {hornet_max}"),
        ));
    }
    let min_ar = update
        .min_aspect_ratio
        .unwrap_or(base.detection.min_aspect_ratio);
    let max_ar = update
        .max_aspect_ratio
        .unwrap_or(base.detection.max_aspect_ratio);
    if min_ar <= 0.0 || max_ar <= 0.0 || min_ar > max_ar {
        return Err(ConfigError::invalid(
            "min_aspect_ratio",
            format!("min {min_ar} must be > 0 and <= max {max_ar}"),
        ));
    }
    if let Some(v) = update.laser_safety_timeout_ms {
        if v == 0 {
            return Err(ConfigError::invalid(
                "laser_safety_timeout_ms",
                "must be > 0",
            ));
        }
    }
    if let Some(url) = update.server_url.as_deref() {
        if !url.is_empty() && url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "server_url",
                "TLS is not supported on-device; use http://",
            ));
        }
    }

    let mut merged = base.clone();
    if let Some(v) = &update.device_name {
        merged.device_name = v.clone();
    }
    if let Some(v) = &update.wifi_ssid {
        merged.network.wifi_ssid = v.clone();
    }
    if let Some(v) = &update.wifi_password {
        merged.network.wifi_password = v.clone();
    }
    if let Some(v) = &update.server_url {
        merged.network.server_url = v.clone();
    }
    if let Some(v) = &update.api_key {
        merged.network.api_key = v.clone();
    }
    if let Some(v) = update.heartbeat_interval_s {
        merged.network.heartbeat_interval_s = v;
    }
    if let Some(v) = update.min_size_px {
        merged.detection.min_size_px = v;
    }
    merged.detection.hornet_min_size_px = hornet_min;
    merged.detection.hornet_max_size_px = hornet_max;
    if let Some(v) = update.hover_time_ms {
        merged.detection.hover_time_ms = v;
    }
    if let Some(v) = update.hover_radius_px {
        merged.detection.hover_radius_px = v;
    }
    if let Some(v) = update.learning_rate {
        merged.detection.learning_rate = v;
    }
    if let Some(v) = update.min_area {
        merged.detection.min_area = v;
    }
    merged.detection.min_aspect_ratio = min_ar;
    merged.detection.max_aspect_ratio = max_ar;
    if let Some(v) = update.detect_shadows {
        merged.detection.detect_shadows = v;
    }
    if let Some(v) = update.servo_enabled {
        merged.actuator.servo_enabled = v;
    }
    if let Some(v) = update.pan_limit_deg {
        merged.actuator.pan_limit_deg = v;
    }
    if let Some(v) = update.tilt_limit_deg {
        merged.actuator.tilt_limit_deg = v;
    }
    if let Some(v) = update.laser_enabled {
        merged.actuator.laser_enabled = v;
    }
    if let Some(v) = update.laser_safety_timeout_ms {
        merged.actuator.laser_safety_timeout_ms = v;
    }
    if let Some(v) = update.prune_days {
        merged.retention.prune_days = v;
    }
    if let Some(v) = update.min_free_mb {
        merged.retention.min_free_mb = v;
    }
    if let Some(v) = update.armed {
        merged.armed = v;
    }
    Ok(merged)
}

fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("config")
    ));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}

/// Owns the one process-wide configuration record. Guarded by a single
/// exclusive lock: readers take it, copy what they need, and release before
/// doing any work of their own.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Config>,
    load_error: Option<String>,
}

impl ConfigStore {
    /// Load from `path`, or synthesize defaults if the file is absent.
    /// A corrupt file is never overwritten: the error is recorded and
    /// surfaced via [`ConfigStore::load_error`], but defaults are used in
    /// memory so the device can still boot and let an operator recover.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (config, load_error) = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(cfg) => (cfg, None),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file is corrupt, retaining in-memory defaults"
                    );
                    (Config::default(), Some(e.to_string()))
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, synthesizing defaults");
                (Config::default(), None)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(config),
            load_error,
        })
    }

    /// The most recent load-time corruption error, if any. Surfaced via `/status`.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn get(&self) -> Config {
        self.inner.lock().expect("config mutex poisoned").clone()
    }

    /// Validate `update` against the current value and, on success, persist
    /// the merged record. On failure the stored config is untouched and the
    /// on-disk file is unchanged.
    pub fn update(&self, update: ConfigUpdate) -> Result<Config> {
        let mut guard = self.inner.lock().expect("config mutex poisoned");
        let merged = apply_update(&guard, &update)?;
        *guard = merged.clone();
        drop(guard);
        self.save()?;
        Ok(merged)
    }

    pub fn mark_setup_complete(&self) -> Result<()> {
        {
            let mut guard = self.inner.lock().expect("config mutex poisoned");
            guard.needs_setup = false;
        }
        self.save()
    }

    pub fn set_armed(&self, armed: bool) -> Result<()> {
        {
            let mut guard = self.inner.lock().expect("config mutex poisoned");
            guard.armed = armed;
        }
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let snapshot = self.get();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| ConfigError::Corruption(e.to_string()))?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_synthesizes_defaults_with_needs_setup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::init(&path).unwrap();
        assert!(store.get().needs_setup);
        assert!(store.load_error().is_none());
    }

    #[test]
    fn corrupt_file_is_not_overwritten_and_surfaces_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not valid json").unwrap();
        let store = ConfigStore::init(&path).unwrap();
        assert!(store.load_error().is_some());
        // defaults in memory, but the corrupt file on disk is untouched
        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "{ not valid json");
    }

    #[test]
    fn valid_update_round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::init(&path).unwrap();
        let update = ConfigUpdate {
            heartbeat_interval_s: Some(60),
            armed: Some(true),
            ..Default::default()
        };
        let updated = store.update(update).unwrap();
        assert_eq!(updated.network.heartbeat_interval_s, 60);
        assert!(updated.armed);

        let reloaded = ConfigStore::init(&path).unwrap();
        assert_eq!(reloaded.get(), updated);
    }

    #[test]
    fn invalid_update_leaves_prior_value_and_file_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::init(&path).unwrap();
        store.save().unwrap();
        let before_file = fs::read_to_string(&path).unwrap();
        let before_value = store.get();

        let bad_update = ConfigUpdate {
            heartbeat_interval_s: Some(99_999),
            ..Default::default()
        };
        let result = store.update(bad_update);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().error_kind(), "INVALID_INPUT");
        assert_eq!(store.get(), before_value);
        assert_eq!(fs::read_to_string(&path).unwrap(), before_file);
    }

    #[test]
    fn partial_update_only_touches_named_fields() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::init(dir.path().join("config.json")).unwrap();
        let before = store.get();
        let update = ConfigUpdate {
            device_name: Some("hive-7".to_string()),
            ..Default::default()
        };
        let after = store.update(update).unwrap();
        assert_eq!(after.device_name, "hive-7");
        assert_eq!(after.network, before.network);
        assert_eq!(after.detection, before.detection);
    }

    #[test]
    fn api_key_is_masked_for_external_view() {
        let mut cfg = Config::default();
        cfg.network.api_key = "sk-abcdefgh1234".to_string();
        let masked = cfg.masked();
        assert_eq!(masked.api_key, "sk-a…1234");
    }

    #[test]
    fn https_server_url_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::init(dir.path().join("config.json")).unwrap();
        let update = ConfigUpdate {
            server_url: Some("https://server.example/api".to_string()),
            ..Default::default()
        };
        let result = store.update(update);
        assert!(result.is_err());
    }
}
