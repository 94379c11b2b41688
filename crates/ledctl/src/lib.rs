//! Priority-ordered LED indicator: ERROR > DETECTION > OFFLINE > ARMED >
//! DISARMED > BOOT > OFF, with DETECTION as a time-limited overlay.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::warn;

pub const PATTERN_TICK_MS: u64 = 100;
const DETECTION_FLASH_MS: u64 = 200;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedState {
    Off,
    Boot,
    Disarmed,
    Armed,
    Detection,
    Error,
    Offline,
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    struct LedMask: u8 {
        const BOOT     = 0b0000_0001;
        const DISARMED = 0b0000_0010;
        const ARMED    = 0b0000_0100;
        const ERROR    = 0b0000_1000;
        const OFFLINE  = 0b0001_0000;
    }
}

impl LedMask {
    fn for_state(state: LedState) -> Option<Self> {
        match state {
            LedState::Boot => Some(LedMask::BOOT),
            LedState::Disarmed => Some(LedMask::DISARMED),
            LedState::Armed => Some(LedMask::ARMED),
            LedState::Error => Some(LedMask::ERROR),
            LedState::Offline => Some(LedMask::OFFLINE),
            LedState::Off | LedState::Detection => None,
        }
    }
}

/// Rendered appearance for one pattern tick. Hardware drivers translate this
/// into PWM duty cycles; test/hosted drivers can just record it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedPattern {
    Off,
    SolidGreen,
    SolidYellow,
    /// Triangular brightness ramp in [0.0, 1.0], ~2s period.
    BreathingBlue { brightness: f64 },
    RedBlink { on: bool },
    OrangeBlink { on: bool },
    WhiteFlash,
}

pub trait LedDriver: Send + Sync {
    fn render(&self, pattern: LedPattern);
}

/// Driver that does nothing; used when no LED hardware is attached (dev
/// platform) or in tests.
pub struct NullLedDriver;

impl LedDriver for NullLedDriver {
    fn render(&self, _pattern: LedPattern) {}
}

struct Inner {
    mask: LedMask,
    detection_until: Option<Instant>,
}

pub struct LedController {
    inner: Mutex<Inner>,
    driver: Arc<dyn LedDriver>,
    started_at: Instant,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl LedController {
    pub fn new(driver: Arc<dyn LedDriver>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                mask: LedMask::empty(),
                detection_until: None,
            }),
            driver,
            started_at: Instant::now(),
            stop_tx,
            stop_rx,
        }
    }

    pub fn set_state(&self, state: LedState, active: bool) {
        let Some(bit) = LedMask::for_state(state) else {
            warn!(?state, "set_state is not meaningful for this state; ignoring");
            return;
        };
        let mut inner = self.inner.lock().expect("led mutex poisoned");
        inner.mask.set(bit, active);
    }

    /// DETECTION is never reported active here — the asymmetry is contractual.
    pub fn is_state_active(&self, state: LedState) -> bool {
        let inner = self.inner.lock().expect("led mutex poisoned");
        match state {
            LedState::Detection => false,
            LedState::Off => inner.mask.is_empty(),
            _ => LedMask::for_state(state)
                .map(|bit| inner.mask.contains(bit))
                .unwrap_or(false),
        }
    }

    pub fn get_state(&self) -> LedState {
        let inner = self.inner.lock().expect("led mutex poisoned");
        highest_priority_state(&inner, Instant::now())
    }

    /// Sets the detection overlay deadline and releases the lock immediately.
    pub fn flash_detection(&self) {
        let mut inner = self.inner.lock().expect("led mutex poisoned");
        inner.detection_until = Some(Instant::now() + Duration::from_millis(DETECTION_FLASH_MS));
    }

    /// Runs the ~100ms pattern-render loop until `cleanup` signals stop.
    pub async fn run(&self) {
        let mut stop_rx = self.stop_rx.clone();
        let mut ticker = tokio::time::interval(Duration::from_millis(PATTERN_TICK_MS));
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.render_tick();
                }
            }
        }
    }

    fn render_tick(&self) {
        let now = Instant::now();
        let state = {
            let inner = self.inner.lock().expect("led mutex poisoned");
            highest_priority_state(&inner, now)
        };
        let elapsed_ms = now.duration_since(self.started_at).as_millis() as u64;
        self.driver.render(pattern_for(state, elapsed_ms));
    }

    /// Stops the pattern thread (bounded by a grace period) before freeing
    /// LED resources.
    pub async fn cleanup(&self) {
        let _ = self.stop_tx.send(true);
        tokio::time::sleep(SHUTDOWN_GRACE.min(Duration::from_millis(PATTERN_TICK_MS * 2))).await;
        self.driver.render(LedPattern::Off);
    }
}

fn highest_priority_state(inner: &Inner, now: Instant) -> LedState {
    if inner.mask.contains(LedMask::ERROR) {
        return LedState::Error;
    }
    if inner.detection_until.map(|d| now < d).unwrap_or(false) {
        return LedState::Detection;
    }
    if inner.mask.contains(LedMask::OFFLINE) {
        return LedState::Offline;
    }
    if inner.mask.contains(LedMask::ARMED) {
        return LedState::Armed;
    }
    if inner.mask.contains(LedMask::DISARMED) {
        return LedState::Disarmed;
    }
    if inner.mask.contains(LedMask::BOOT) {
        return LedState::Boot;
    }
    LedState::Off
}

fn pattern_for(state: LedState, elapsed_ms: u64) -> LedPattern {
    match state {
        LedState::Off => LedPattern::Off,
        LedState::Armed => LedPattern::SolidGreen,
        LedState::Disarmed => LedPattern::SolidYellow,
        LedState::Boot => LedPattern::BreathingBlue {
            brightness: triangular_ramp(elapsed_ms, 2000),
        },
        LedState::Error => LedPattern::RedBlink {
            on: (elapsed_ms / 500) % 2 == 0,
        },
        LedState::Offline => LedPattern::OrangeBlink {
            on: (elapsed_ms % 4000) < 200,
        },
        LedState::Detection => LedPattern::WhiteFlash,
    }
}

/// Triangular ramp in [0.0, 1.0] over `period_ms`.
fn triangular_ramp(elapsed_ms: u64, period_ms: u64) -> f64 {
    let phase = (elapsed_ms % period_ms) as f64 / period_ms as f64;
    if phase < 0.5 {
        phase * 2.0
    } else {
        2.0 - phase * 2.0
    }
}
