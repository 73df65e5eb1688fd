//! Safety supervisor: the pre-PID checks that stand between a sensor sample
//! and the heater.
//!
//! Per tick, in order, first match wins: sensor failure handling (with the
//! consecutive-failure shutdown), the hard overtemp latch, and the
//! at-or-above-setpoint output override. The control loop consults the
//! supervisor before every PID step; the supervisor itself never touches
//! the actuator – it tells the loop what the actuator must receive.

use tracing::{error, info, warn};

use crema_hal::sensor::SensorError;

/// Consecutive sensor failures that trigger a hard shutdown.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Hard safety ceiling in Celsius; anything above this is an emergency.
pub const MAX_SAFE_TEMP: f64 = 160.0;

/// Tracks consecutive sensor failures and the overtemp latch.
#[derive(Debug, Default)]
pub struct SafetySupervisor {
    consecutive_failures: u32,
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed sensor read.
    ///
    /// Returns `true` once the failure count has reached
    /// [`MAX_CONSECUTIVE_FAILURES`], meaning the caller must force the
    /// heater off and keep it off until a valid reading arrives.
    pub fn record_failure(&mut self, err: &SensorError) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                failures = self.consecutive_failures,
                error = %err,
                "sensor failure threshold reached; heater shutdown"
            );
            true
        } else {
            warn!(
                failures = self.consecutive_failures,
                error = %err,
                "sensor read failed; skipping control actions this tick"
            );
            false
        }
    }

    /// Record one valid sensor reading, clearing the failure count and any
    /// latched shutdown.
    pub fn record_success(&mut self) {
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            info!("valid reading received; sensor failure latch cleared");
        }
        self.consecutive_failures = 0;
    }

    /// Hard overtemp check.
    ///
    /// Above [`MAX_SAFE_TEMP`] the failure counter is latched to the
    /// shutdown threshold and `true` is returned: the caller must force the
    /// heater off before doing anything else this tick.
    pub fn check_overtemp(&mut self, temperature: f64) -> bool {
        if temperature > MAX_SAFE_TEMP {
            self.consecutive_failures = MAX_CONSECUTIVE_FAILURES;
            error!(
                temperature,
                limit = MAX_SAFE_TEMP,
                "EMERGENCY: boiler over hard safety limit; heater forced off"
            );
            true
        } else {
            false
        }
    }

    /// Whether the shutdown latch is currently engaged.
    pub fn shutdown_latched(&self) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
