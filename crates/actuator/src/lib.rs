//! Servo/laser actuator interface. Deliberately thin: frame-in,
//! actuator-out. GPIO bit-banging and PWM generation are out of scope here —
//! [`ActuatorDriver`] is the seam a platform-specific implementation fills in.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("invalid actuator command: {0}")]
    InvalidInput(String),
    #[error("actuator disabled in configuration")]
    NotReady,
}

impl ActuatorError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            ActuatorError::InvalidInput(_) => "INVALID_INPUT",
            ActuatorError::NotReady => "NOT_READY",
        }
    }
}

pub type Result<T> = std::result::Result<T, ActuatorError>;

#[derive(Debug, Clone, Copy)]
pub struct ActuatorConfig {
    pub servo_enabled: bool,
    pub pan_limit_deg: f64,
    pub tilt_limit_deg: f64,
    pub laser_enabled: bool,
    pub laser_safety_timeout_ms: u32,
}

/// Platform seam: a real implementation drives servo PWM and a laser GPIO
/// pin; the dev platform and tests use [`NullActuatorDriver`].
pub trait ActuatorDriver: Send + Sync {
    fn set_servo(&self, pan_deg: f64, tilt_deg: f64);
    fn set_laser(&self, on: bool);
}

pub struct NullActuatorDriver;

impl ActuatorDriver for NullActuatorDriver {
    fn set_servo(&self, pan_deg: f64, tilt_deg: f64) {
        debug!(pan_deg, tilt_deg, "null actuator driver: set_servo (no-op)");
    }

    fn set_laser(&self, on: bool) {
        debug!(on, "null actuator driver: set_laser (no-op)");
    }
}

pub struct Actuator {
    config: Mutex<ActuatorConfig>,
    driver: Box<dyn ActuatorDriver>,
}

impl Actuator {
    pub fn new(config: ActuatorConfig, driver: Box<dyn ActuatorDriver>) -> Self {
        Self {
            config: Mutex::new(config),
            driver,
        }
    }

    pub fn update_config(&self, config: ActuatorConfig) {
        *self.config.lock().expect("actuator config mutex poisoned") = config;
    }

    /// Points the servo, clamping the request into the configured pan/tilt
    /// limits rather than rejecting an out-of-range request outright.
    pub fn point(&self, pan_deg: f64, tilt_deg: f64) -> Result<()> {
        let config = *self.config.lock().expect("actuator config mutex poisoned");
        if !config.servo_enabled {
            return Err(ActuatorError::NotReady);
        }
        if !pan_deg.is_finite() || !tilt_deg.is_finite() {
            return Err(ActuatorError::InvalidInput(
                "pan/tilt must be finite".to_string(),
            ));
        }
        let pan = pan_deg.clamp(-config.pan_limit_deg, config.pan_limit_deg);
        let tilt = tilt_deg.clamp(-config.tilt_limit_deg, config.tilt_limit_deg);
        self.driver.set_servo(pan, tilt);
        Ok(())
    }

    pub fn center(&self) -> Result<()> {
        self.point(0.0, 0.0)
    }

    /// Fires the laser for `requested_duration_ms`, clamped to the
    /// configured safety timeout, then turns it off before returning.
    pub async fn fire_laser(&self, requested_duration_ms: u32) -> Result<()> {
        let config = *self.config.lock().expect("actuator config mutex poisoned");
        if !config.laser_enabled {
            return Err(ActuatorError::NotReady);
        }
        let duration_ms = requested_duration_ms.min(config.laser_safety_timeout_ms);
        if duration_ms < requested_duration_ms {
            warn!(
                requested_duration_ms,
                clamped_to = duration_ms,
                "laser fire duration clamped to safety timeout"
            );
        }
        self.driver.set_laser(true);
        tokio::time::sleep(Duration::from_millis(duration_ms as u64)).await;
        self.driver.set_laser(false);
        Ok(())
    }
}
