//! apisd — main daemon for the apis-edge hornet-detection device.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use actuator::{Actuator, NullActuatorDriver};
use camera::{CameraConfig, CameraSource, LatestFrameBuffer, SyntheticCameraSource};
use classifier::{Classifier, ClassifierConfig};
use clipupload::{ClipCompletionSink, ClipMetadata, ClipTransport, ClipUploader, UploadOutcome};
use config::ConfigStore;
use eventlog::{EventLogger, RetentionConfig};
use ledctl::{LedController, LedState, NullLedDriver};
use localhttp::{LocalHttpServer, StatusProvider, StatusSnapshot};
use motion::{Motion, MotionConfig};
use servercomm::{HeartbeatStatus, ServerComm, ServerCommConfig};
use tracker::{Tracker, TrackerConfig};
use types::{Confidence, NewEvent, Region};

const DEFAULT_CAMERA_WIDTH: u32 = 320;
const DEFAULT_CAMERA_HEIGHT: u32 = 240;
const DEFAULT_CAMERA_FPS: u32 = 15;
const LOCAL_HTTP_PORT: u16 = 8080;
const DETECTION_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const LED_SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Two or more consecutive heartbeat failures light the OFFLINE overlay.
const OFFLINE_FAILURE_THRESHOLD: u64 = 2;
/// Three consecutive CORRUPTION/NOT_READY cycles light ERROR.
const ERROR_CYCLE_THRESHOLD: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "apisd", about = "apis-edge hornet detection daemon")]
struct Args {
    /// Directory holding config.json, events.db, clip_queue.json, and clips/.
    /// Overridable so the in-repo test suite never touches a real device's
    /// configuration directory.
    #[arg(short, long, default_value = "/etc/apis-edge")]
    config_dir: PathBuf,

    #[arg(long, default_value = "/var/log/apis-edge")]
    log_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(
    log_dir: &Path,
    level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Error: Cannot create log directory '{}': {}", log_dir.display(), e);
        eprintln!();
        eprintln!("Try running with a local directory, e.g.:");
        eprintln!();
        eprintln!("  cargo run --bin apisd -- --config-dir ./devconfig --log-dir ./logs");
        eprintln!();
        return Err(e.into());
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "apisd.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("apisd={level},eventlog=info,clipupload=info")));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_unix_s() -> u64 {
    now_unix_ms() / 1000
}

fn led_state_str(state: LedState) -> &'static str {
    match state {
        LedState::Off => "OFF",
        LedState::Boot => "BOOT",
        LedState::Disarmed => "DISARMED",
        LedState::Armed => "ARMED",
        LedState::Detection => "DETECTION",
        LedState::Error => "ERROR",
        LedState::Offline => "OFFLINE",
    }
}

fn detections_today(event_logger: &EventLogger) -> u32 {
    let since = chrono::Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
        .to_rfc3339();
    match event_logger.get_events(Some(since.as_str()), None, eventlog::MAX_PER_QUERY) {
        Ok(events) => events.len() as u32,
        Err(e) => {
            warn!(error = %e, "failed to count today's detections for status");
            0
        }
    }
}

/// Delegates ClipTransport to the shared ServerComm instance, so ClipUploader
/// never depends on servercomm directly.
struct SharedTransport(Arc<ServerComm>);

impl ClipTransport for SharedTransport {
    fn upload(&self, path: &Path, metadata: &ClipMetadata) -> UploadOutcome {
        self.0.upload(path, metadata)
    }
}

/// Clears an event row's clip_file reference once its upload succeeds, so
/// ClipUploader never depends on eventlog directly.
struct EventLogSink(Arc<EventLogger>);

impl ClipCompletionSink for EventLogSink {
    fn clip_uploaded(&self, path: &Path) {
        let Some(path_str) = path.to_str() else {
            warn!(?path, "clip path is not valid UTF-8, cannot clear reference");
            return;
        };
        if let Err(e) = self.0.clear_clip_reference(path_str) {
            warn!(error = %e, "failed to clear clip reference after upload");
        }
    }
}

/// Aggregates every component's live state into the single snapshot `/status` serves.
struct DeviceStatus {
    config_store: Arc<ConfigStore>,
    event_logger: Arc<EventLogger>,
    clip_uploader: Arc<ClipUploader>,
    server_comm: Arc<ServerComm>,
    led: Arc<LedController>,
    started_at: Instant,
}

impl StatusProvider for DeviceStatus {
    fn status(&self) -> StatusSnapshot {
        let cfg = self.config_store.get();
        let log_status = self.event_logger.get_status().unwrap_or_default();
        let stats = self.clip_uploader.get_stats();
        let heartbeat_age = self.server_comm.seconds_since_last_heartbeat(now_unix_s());
        StatusSnapshot {
            device_id: cfg.device_id,
            armed: cfg.armed,
            needs_setup: cfg.needs_setup,
            detections_today: detections_today(&self.event_logger),
            pending_clips: stats.pending as u32,
            storage_free_mb: log_status.free_mb,
            led: led_state_str(self.led.get_state()).to_string(),
            last_heartbeat_age_s: if heartbeat_age == u64::MAX { None } else { Some(heartbeat_age) },
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Counts consecutive heartbeat failures and consecutive CORRUPTION/NOT_READY
/// pipeline cycles, driving the OFFLINE and ERROR LED overlays. Named
/// directly by the error-handling design's aggregate rule but not owned by
/// any single component, so it lives here next to the rest of the glue.
struct OperationalHealth {
    error_streak: AtomicU32,
}

impl OperationalHealth {
    fn new() -> Self {
        Self {
            error_streak: AtomicU32::new(0),
        }
    }

    fn record_heartbeat_failures(&self, failures: u64, led: &LedController) {
        led.set_state(LedState::Offline, failures >= OFFLINE_FAILURE_THRESHOLD);
    }

    fn record_cycle_result(&self, ok: bool, led: &LedController) {
        let streak = if ok {
            self.error_streak.store(0, Ordering::Relaxed);
            0
        } else {
            self.error_streak.fetch_add(1, Ordering::Relaxed) + 1
        };
        led.set_state(LedState::Error, streak >= ERROR_CYCLE_THRESHOLD);
    }
}

fn region_to_pan_tilt(region: &Region, frame_w: u32, frame_h: u32, actuator_cfg: &config::ActuatorConfig) -> (f64, f64) {
    let (cx, cy) = region.centroid();
    let norm_x = (cx / frame_w.max(1) as f64) * 2.0 - 1.0;
    let norm_y = (cy / frame_h.max(1) as f64) * 2.0 - 1.0;
    (norm_x * actuator_cfg.pan_limit_deg, norm_y * actuator_cfg.tilt_limit_deg)
}

/// Clips are not really recorded (camera capture is an interface-only seam
/// here); a single JPEG snapshot stands in for the clip body, named with the
/// `.mp4` extension the server upload contract expects.
fn write_clip_snapshot(path: &Path, jpeg: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(jpeg)?;
    file.sync_all()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_one_frame(
    camera: &mut dyn CameraSource,
    motion: &mut Motion,
    tracker: &mut Tracker,
    classifier: &Classifier,
    config_store: &ConfigStore,
    event_logger: &EventLogger,
    clip_uploader: &ClipUploader,
    actuator: &Actuator,
    led: &LedController,
    frame_buffer: &LatestFrameBuffer,
    clip_metadata: &Mutex<HashMap<i64, ClipMetadata>>,
    clips_dir: &Path,
    runtime: &tokio::runtime::Handle,
) -> bool {
    let captured = match camera.next_frame() {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, kind = e.error_kind(), "camera frame capture failed");
            return e.error_kind() != "NOT_READY";
        }
    };
    frame_buffer.update(&captured);
    let frame = captured.as_frame();
    let frame_w = frame.meta.width;
    let frame_h = frame.meta.height;
    let now_ms = frame.meta.timestamp_ms;

    let regions = motion.detect(&frame);
    let tracked = tracker.update(&regions, now_ms);
    let classified = classifier.classify(&tracked, now_ms);

    let cfg = config_store.get();
    let mut ok = true;

    for detection in classified {
        if detection.confidence != Confidence::High {
            continue;
        }
        led.flash_detection();
        if !cfg.armed {
            continue;
        }

        let mut laser_fired = false;
        if cfg.actuator.laser_enabled && detection.is_hovering {
            let (pan, tilt) = region_to_pan_tilt(&detection.region, frame_w, frame_h, &cfg.actuator);
            if actuator.point(pan, tilt).is_ok() {
                let fired = runtime.block_on(actuator.fire_laser(cfg.actuator.laser_safety_timeout_ms));
                laser_fired = fired.is_ok();
            }
        }

        let clip_path = clips_dir.join(format!("{}-{}.mp4", detection.track_id, now_ms));
        let jpeg = frame_buffer.latest_jpeg();
        let clip_written = jpeg
            .as_deref()
            .map(|bytes| write_clip_snapshot(&clip_path, bytes).is_ok())
            .unwrap_or(false);

        let timestamp = chrono::Utc::now().to_rfc3339();
        let new_event = NewEvent {
            timestamp: timestamp.clone(),
            confidence: detection.confidence,
            region: detection.region,
            hover_duration_ms: detection.hover_duration_ms,
            laser_fired,
            clip_file: if clip_written {
                Some(clip_path.to_string_lossy().to_string())
            } else {
                None
            },
        };

        match event_logger.log(new_event) {
            Ok(event_id) => {
                if clip_written {
                    let target_url = format!("{}/clips", cfg.network.server_url.trim_end_matches('/'));
                    clip_metadata.lock().expect("clip metadata mutex poisoned").insert(
                        event_id,
                        ClipMetadata {
                            id: event_id,
                            timestamp,
                            confidence: detection.confidence.as_str().to_string(),
                        },
                    );
                    clip_uploader.enqueue(event_id, clip_path.clone(), target_url, now_unix_ms());
                }
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "failed to log detection event");
                ok = false;
            }
        }
    }

    ok
}

#[allow(clippy::too_many_arguments)]
fn run_detection_pipeline(
    mut camera: Box<dyn CameraSource>,
    config_store: Arc<ConfigStore>,
    event_logger: Arc<EventLogger>,
    clip_uploader: Arc<ClipUploader>,
    actuator: Arc<Actuator>,
    led: Arc<LedController>,
    health: Arc<OperationalHealth>,
    frame_buffer: Arc<LatestFrameBuffer>,
    clip_metadata: Arc<Mutex<HashMap<i64, ClipMetadata>>>,
    clips_dir: PathBuf,
    runtime: tokio::runtime::Handle,
    running: Arc<AtomicBool>,
) {
    let cfg = config_store.get();
    let mut motion = Motion::new(MotionConfig {
        learning_rate: cfg.detection.learning_rate,
        threshold: MotionConfig::default().threshold,
        min_size: cfg.detection.min_size_px,
        max_size: cfg.detection.hornet_max_size_px,
        min_area: cfg.detection.min_area,
        min_aspect_ratio: cfg.detection.min_aspect_ratio,
        max_aspect_ratio: cfg.detection.max_aspect_ratio,
        detect_shadows: cfg.detection.detect_shadows,
    });
    let mut tracker = Tracker::new(TrackerConfig::default());
    let classifier = Classifier::new(ClassifierConfig {
        min_size_px: cfg.detection.min_size_px,
        hornet_min_size_px: cfg.detection.hornet_min_size_px,
        hornet_max_size_px: cfg.detection.hornet_max_size_px,
        hover_time_ms: cfg.detection.hover_time_ms,
        hover_radius_px: cfg.detection.hover_radius_px,
    });

    info!("detection pipeline thread started");
    while running.load(Ordering::Relaxed) {
        let ok = process_one_frame(
            camera.as_mut(),
            &mut motion,
            &mut tracker,
            &classifier,
            &config_store,
            &event_logger,
            &clip_uploader,
            &actuator,
            &led,
            &frame_buffer,
            &clip_metadata,
            &clips_dir,
            &runtime,
        );
        health.record_cycle_result(ok, &led);
        std::thread::sleep(DETECTION_FRAME_INTERVAL);
    }
    info!("detection pipeline thread stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args.log_dir, &args.log_level)?;

    info!(config_dir = %args.config_dir.display(), "starting apisd");

    let config_path = args.config_dir.join("config.json");
    let config_store = Arc::new(ConfigStore::init(&config_path)?);
    if let Some(err) = config_store.load_error() {
        warn!(error = err, "config file was corrupt on load, running with in-memory defaults");
    }
    let initial = config_store.get();
    info!(device_id = %initial.device_id, needs_setup = initial.needs_setup, "configuration loaded");

    let event_logger = Arc::new(EventLogger::init(
        args.config_dir.join("events.db"),
        RetentionConfig {
            prune_days: initial.retention.prune_days,
            min_free_mb: initial.retention.min_free_mb,
        },
    )?);

    let server_comm = Arc::new(ServerComm::new(ServerCommConfig {
        server_url: initial.network.server_url.clone(),
        api_key: initial.network.api_key.clone(),
    }));

    let clip_uploader = Arc::new(
        ClipUploader::new(Some(args.config_dir.join("clip_queue.json")))
            .with_transport(Box::new(SharedTransport(server_comm.clone())))
            .with_sink(Box::new(EventLogSink(event_logger.clone()))),
    );

    let led = Arc::new(LedController::new(Arc::new(NullLedDriver)));
    let actuator = Arc::new(Actuator::new(
        actuator::ActuatorConfig {
            servo_enabled: initial.actuator.servo_enabled,
            pan_limit_deg: initial.actuator.pan_limit_deg,
            tilt_limit_deg: initial.actuator.tilt_limit_deg,
            laser_enabled: initial.actuator.laser_enabled,
            laser_safety_timeout_ms: initial.actuator.laser_safety_timeout_ms,
        },
        Box::new(NullActuatorDriver),
    ));

    let frame_buffer = Arc::new(LatestFrameBuffer::new());
    let camera_source: Box<dyn CameraSource> = Box::new(SyntheticCameraSource::new(&CameraConfig {
        device: "synthetic0".to_string(),
        width: DEFAULT_CAMERA_WIDTH,
        height: DEFAULT_CAMERA_HEIGHT,
        fps: DEFAULT_CAMERA_FPS,
    }));

    let health = Arc::new(OperationalHealth::new());
    let clip_metadata: Arc<Mutex<HashMap<i64, ClipMetadata>>> = Arc::new(Mutex::new(HashMap::new()));

    let status_provider = Arc::new(DeviceStatus {
        config_store: config_store.clone(),
        event_logger: event_logger.clone(),
        clip_uploader: clip_uploader.clone(),
        server_comm: server_comm.clone(),
        led: led.clone(),
        started_at: Instant::now(),
    });

    let local_http = Arc::new(LocalHttpServer::new(
        LOCAL_HTTP_PORT,
        config_store.clone(),
        status_provider,
        Some(frame_buffer.clone()),
    ));
    {
        let local_http = local_http.clone();
        tokio::spawn(async move {
            if let Err(e) = local_http.run().await {
                warn!(error = %e, "local http server exited, continuing without it");
            }
        });
    }

    {
        let led = led.clone();
        tokio::spawn(async move { led.run().await });
    }

    let (clip_stop_tx, clip_stop_rx) = watch::channel(false);
    {
        let clip_uploader = clip_uploader.clone();
        let clip_metadata = clip_metadata.clone();
        tokio::spawn(async move {
            clip_uploader
                .run(clip_stop_rx, now_unix_ms, move |id| {
                    clip_metadata
                        .lock()
                        .expect("clip metadata mutex poisoned")
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| ClipMetadata {
                            id,
                            timestamp: String::new(),
                            confidence: "UNKNOWN".to_string(),
                        })
                })
                .await;
        });
    }

    {
        let config_store = config_store.clone();
        let event_logger = event_logger.clone();
        let clip_uploader = clip_uploader.clone();
        let server_comm = server_comm.clone();
        let led = led.clone();
        let health = health.clone();
        tokio::spawn(async move {
            loop {
                let cfg = config_store.get();
                let status = HeartbeatStatus {
                    device_id: cfg.device_id.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    armed: cfg.armed,
                    led: led_state_str(led.get_state()).to_string(),
                    detections_today: detections_today(&event_logger),
                    pending_clips: clip_uploader.get_stats().pending as u32,
                    storage_free_mb: event_logger.get_status().map(|s| s.free_mb).unwrap_or(0),
                };
                let _ = server_comm.send_heartbeat(&status, now_unix_s());
                health.record_heartbeat_failures(server_comm.heartbeat_failures(), &led);
                tokio::time::sleep(Duration::from_secs(cfg.network.heartbeat_interval_s.max(1) as u64)).await;
            }
        });
    }

    {
        let config_store = config_store.clone();
        let led = led.clone();
        tokio::spawn(async move {
            loop {
                let cfg = config_store.get();
                led.set_state(LedState::Boot, cfg.needs_setup);
                led.set_state(LedState::Armed, !cfg.needs_setup && cfg.armed);
                led.set_state(LedState::Disarmed, !cfg.needs_setup && !cfg.armed);
                tokio::time::sleep(LED_SYNC_INTERVAL).await;
            }
        });
    }

    let detection_running = Arc::new(AtomicBool::new(true));
    let detection_handle = {
        let config_store = config_store.clone();
        let event_logger = event_logger.clone();
        let clip_uploader = clip_uploader.clone();
        let actuator = actuator.clone();
        let led = led.clone();
        let health = health.clone();
        let frame_buffer = frame_buffer.clone();
        let clips_dir = args.config_dir.join("clips");
        let runtime = tokio::runtime::Handle::current();
        let running = detection_running.clone();
        std::thread::spawn(move || {
            run_detection_pipeline(
                camera_source,
                config_store,
                event_logger,
                clip_uploader,
                actuator,
                led,
                health,
                frame_buffer,
                clip_metadata,
                clips_dir,
                runtime,
                running,
            );
        })
    };

    info!("apisd is up");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");

    detection_running.store(false, Ordering::Relaxed);
    local_http.stop();
    let _ = clip_stop_tx.send(true);
    led.cleanup().await;
    if let Err(e) = config_store.close() {
        warn!(error = %e, "failed to persist configuration during shutdown");
    }

    let join = tokio::task::spawn_blocking(move || detection_handle.join());
    if tokio::time::timeout(Duration::from_secs(2), join).await.is_err() {
        warn!("detection pipeline thread did not stop within the shutdown grace period");
    }

    Ok(())
}
