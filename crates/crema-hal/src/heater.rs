//! Heater actuation: the 8-bit PWM duty endpoint for the boiler's
//! solid-state relay.
//!
//! The heater is the last line of defense, so [`Heater::off`] is infallible:
//! on any driver error it records the intent, logs, and returns, leaving the
//! supervisor free to attempt further shutdowns.

use std::io::Write;
use std::path::PathBuf;

use tracing::error;

use crema_types::CoreError;

/// Abstract PWM endpoint. Implementations may map a duty write to a daemon
/// socket, a kernel interface, or a test double.
pub trait PwmOutput: Send {
    /// Program `duty` (0 = fully off, 255 = fully on).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Hardware`] when the command cannot be applied.
    fn set_duty(&mut self, duty: u8) -> Result<(), CoreError>;
}

/// Stateless wrapper over a [`PwmOutput`] with a shutdown primitive safe to
/// call from any path.
pub struct Heater {
    out: Box<dyn PwmOutput>,
    last_duty: u8,
}

impl Heater {
    pub fn new(out: Box<dyn PwmOutput>) -> Self {
        Self { out, last_duty: 0 }
    }

    /// Program `duty` on the underlying endpoint.
    ///
    /// The `u8` argument carries the `[0, 255]` clamp in the type; callers
    /// clamp their raw PID output before converting.
    pub fn write(&mut self, duty: u8) -> Result<(), CoreError> {
        self.last_duty = duty;
        self.out.set_duty(duty)
    }

    /// Force the heater off. Never fails: a driver error is logged and the
    /// intent (duty 0) is still recorded.
    pub fn off(&mut self) {
        self.last_duty = 0;
        if let Err(e) = self.out.set_duty(0) {
            error!(error = %e, "heater off() failed at the driver; duty 0 intent recorded");
        }
    }

    /// The most recently commanded duty.
    pub fn last_duty(&self) -> u8 {
        self.last_duty
    }
}

/// [`PwmOutput`] writing `p <pin> <duty>` lines to the pigpiod command pipe.
///
/// pigpiod owns the GPIO hardware; this endpoint only enqueues duty updates
/// on `/dev/pigpio`, so a crashed daemon shows up as a write error rather
/// than a wedged pin.
pub struct PigpioPwm {
    pin: u8,
    pipe: PathBuf,
}

impl PigpioPwm {
    /// Target `pin` through the default `/dev/pigpio` command pipe.
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            pipe: PathBuf::from("/dev/pigpio"),
        }
    }

    /// Override the command pipe path (builder-style, used by tests).
    pub fn with_pipe(mut self, pipe: impl Into<PathBuf>) -> Self {
        self.pipe = pipe.into();
        self
    }
}

impl PwmOutput for PigpioPwm {
    fn set_duty(&mut self, duty: u8) -> Result<(), CoreError> {
        let mut pipe = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.pipe)
            .map_err(|e| CoreError::Hardware {
                component: "heater_pwm".to_string(),
                details: format!("open {}: {e}", self.pipe.display()),
            })?;
        writeln!(pipe, "p {} {}", self.pin, duty).map_err(|e| CoreError::Hardware {
            component: "heater_pwm".to_string(),
            details: format!("write {}: {e}", self.pipe.display()),
        })
    }
}
