//! Recovery detector.
//!
//! A cold-water refill is a sudden, large disturbance best handled by a
//! more aggressive gain profile. The detector watches the last minute of
//! samples: an abrupt drop below setpoint engages recovery, and a 5 °C
//! hysteresis below setpoint releases it so the recovery gains are not
//! carried into the final approach (which would overshoot).

use tracing::info;

use crema_types::PidMode;

use crate::window::TempWindow;

/// Span of history consulted for the drop test.
pub const RECOVERY_WINDOW_SECONDS: i64 = 60;
/// Drop (°C) from the window maximum that engages recovery.
pub const RECOVERY_DROP_THRESHOLD: f64 = 5.0;
/// Exit once within this many °C below setpoint.
const RECOVERY_EXIT_MARGIN: f64 = 5.0;

/// Tracks whether the recovery gain profile is engaged.
#[derive(Debug, Default)]
pub struct RecoveryDetector {
    active: bool,
}

impl RecoveryDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluate against the latest window contents; returns the gain
    /// profile the engine should be running.
    pub fn update(&mut self, window: &TempWindow, target: f64, now_ms: i64) -> PidMode {
        let Some((_, t_now)) = window.latest() else {
            return self.mode();
        };

        if self.active {
            if t_now >= target - RECOVERY_EXIT_MARGIN {
                self.active = false;
                info!(temperature = t_now, target, "temperature recovered; normal gains restored");
            }
        } else if let Some(t_max) = window.max_over(RECOVERY_WINDOW_SECONDS * 1000, now_ms) {
            if t_max - t_now >= RECOVERY_DROP_THRESHOLD && t_now < target && t_now < t_max {
                self.active = true;
                info!(
                    temperature = t_now,
                    window_max = t_max,
                    target,
                    "abrupt temperature drop; recovery gains engaged"
                );
            }
        }

        self.mode()
    }

    pub fn mode(&self) -> PidMode {
        if self.active {
            PidMode::Recovery
        } else {
            PidMode::Normal
        }
    }
}
