//! Machine-state classifier.
//!
//! Derives the observed `off` / `heating` / `ready` label from the sliding
//! temperature window and the currently commanded output, and decides which
//! ticks are worth a telemetry write.
//!
//! The rule ordering matters. The cooling-under-drive rule comes first so
//! that a machine switched off at the wall – software still commanding heat
//! while the element is disconnected – is reported `off` rather than
//! `heating`. The active zone above 80 °C is treated as a whole so that
//! fluctuation around the setpoint does not flicker the label into `off`.

use crema_types::MachineState;

use crate::window::{STATE_DETECTION_WINDOW_MS, TempWindow};

/// While `off`, record one telemetry sample this often to track cooling
/// with minimal flash writes.
pub const OFF_STATE_RECORDING_INTERVAL_MS: i64 = 180_000;

/// Fraction below target still considered "at temperature".
const READY_BAND: f64 = 0.02;
/// Window drop (°C) that, under drive, indicates the element is dead.
const COOLING_UNDER_DRIVE_DROP: f64 = -0.3;
/// Window rise (°C) treated as actively heating.
const HEATING_RISE: f64 = 1.0;

/// Classifies machine state from temperature history and commanded output.
#[derive(Debug)]
pub struct StateClassifier {
    state: MachineState,
    last_off_record_ms: Option<i64>,
}

impl Default for StateClassifier {
    fn default() -> Self {
        Self {
            state: MachineState::Unknown,
            last_off_record_ms: None,
        }
    }
}

impl StateClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify the current tick. First match wins:
    ///
    /// 1. cooling while driven ⇒ `off` (power absent)
    /// 2. active zone above 80 °C ⇒ `ready` within the band, else `heating`
    /// 3. at/above setpoint in the cool zone ⇒ `ready`
    /// 4. rising and warm ⇒ `heating`
    /// 5. driven but unclear ⇒ `heating` when warm, else `off`
    /// 6. default ⇒ `off`
    pub fn classify(
        &mut self,
        temperature: f64,
        output_percent: f64,
        target: f64,
        window: &TempWindow,
        now_ms: i64,
    ) -> MachineState {
        let rise = window.rise_over(STATE_DETECTION_WINDOW_MS, now_ms);
        let at_temperature = temperature >= target * (1.0 - READY_BAND);

        let state = if rise.is_some_and(|r| r <= COOLING_UNDER_DRIVE_DROP) && output_percent > 10.0
        {
            MachineState::Off
        } else if temperature > 80.0 {
            if at_temperature {
                MachineState::Ready
            } else {
                MachineState::Heating
            }
        } else if at_temperature || temperature >= target {
            MachineState::Ready
        } else if rise.is_some_and(|r| r >= HEATING_RISE) && temperature > 40.0 {
            MachineState::Heating
        } else if output_percent > 20.0 {
            if temperature > 40.0 {
                MachineState::Heating
            } else {
                MachineState::Off
            }
        } else {
            MachineState::Off
        };

        self.state = state;
        state
    }

    /// The most recently classified state ([`MachineState::Unknown`] before
    /// the first tick).
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Smart recording policy: record while heating or ready; while off,
    /// record once per [`OFF_STATE_RECORDING_INTERVAL_MS`].
    pub fn should_record(&mut self, now_ms: i64) -> bool {
        match self.state {
            MachineState::Heating | MachineState::Ready => {
                self.last_off_record_ms = None;
                true
            }
            MachineState::Off | MachineState::Unknown => {
                let due = self
                    .last_off_record_ms
                    .is_none_or(|last| now_ms - last >= OFF_STATE_RECORDING_INTERVAL_MS);
                if due {
                    self.last_off_record_ms = Some(now_ms);
                }
                due
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Window with a flat temperature history ending at `temp`.
    fn flat_window(temp: f64) -> TempWindow {
        let mut window = TempWindow::new();
        for i in 0..5 {
            window.push(i * 1000, temp);
        }
        window
    }

    fn sloped_window(start: f64, end: f64) -> TempWindow {
        let mut window = TempWindow::new();
        for i in 0..5 {
            window.push(i * 1000, start + (end - start) * i as f64 / 4.0);
        }
        window
    }

    #[test]
    fn cooling_under_drive_is_off() {
        let mut classifier = StateClassifier::new();
        let window = sloped_window(95.0, 94.0); // −1.0 over the window
        let state = classifier.classify(94.0, 50.0, 100.0, &window, 4000);
        assert_eq!(state, MachineState::Off);
    }

    #[test]
    fn cooling_without_drive_is_not_forced_off() {
        let mut classifier = StateClassifier::new();
        // Same drop, but output ≤ 10: falls through to the active zone.
        let window = sloped_window(95.0, 94.0);
        let state = classifier.classify(94.0, 5.0, 100.0, &window, 4000);
        assert_eq!(state, MachineState::Heating);
    }

    #[test]
    fn active_zone_splits_on_ready_band() {
        let mut classifier = StateClassifier::new();
        // 98 ≥ 100 · 0.98 → ready
        assert_eq!(
            classifier.classify(98.0, 30.0, 100.0, &flat_window(98.0), 4000),
            MachineState::Ready
        );
        // 97.9 just under the band → heating
        assert_eq!(
            classifier.classify(97.9, 30.0, 100.0, &flat_window(97.9), 4000),
            MachineState::Heating
        );
    }

    #[test]
    fn at_setpoint_in_cool_zone_is_ready() {
        let mut classifier = StateClassifier::new();
        // Steam-down scenario: target dropped to 75, boiler already there.
        let state = classifier.classify(76.0, 0.0, 75.0, &flat_window(76.0), 4000);
        assert_eq!(state, MachineState::Ready);
    }

    #[test]
    fn rising_and_warm_is_heating() {
        let mut classifier = StateClassifier::new();
        let window = sloped_window(42.0, 45.0); // +3 over the window
        let state = classifier.classify(45.0, 0.0, 100.0, &window, 4000);
        assert_eq!(state, MachineState::Heating);
    }

    #[test]
    fn driven_but_unclear_splits_at_forty_degrees() {
        let mut classifier = StateClassifier::new();
        // Flat history, strong drive: warm → heating, cold → off.
        assert_eq!(
            classifier.classify(60.0, 40.0, 100.0, &flat_window(60.0), 4000),
            MachineState::Heating
        );
        assert_eq!(
            classifier.classify(25.0, 40.0, 100.0, &flat_window(25.0), 4000),
            MachineState::Off
        );
    }

    #[test]
    fn idle_and_cold_defaults_to_off() {
        let mut classifier = StateClassifier::new();
        let state = classifier.classify(22.0, 0.0, 100.0, &flat_window(22.0), 4000);
        assert_eq!(state, MachineState::Off);
    }

    #[test]
    fn state_starts_unknown() {
        assert_eq!(StateClassifier::new().state(), MachineState::Unknown);
    }

    #[test]
    fn records_every_tick_while_active() {
        let mut classifier = StateClassifier::new();
        classifier.classify(90.0, 50.0, 100.0, &flat_window(90.0), 0);
        assert!(classifier.should_record(0));
        assert!(classifier.should_record(1000));
        assert!(classifier.should_record(2000));
    }

    #[test]
    fn records_sparsely_while_off() {
        let mut classifier = StateClassifier::new();
        classifier.classify(22.0, 0.0, 100.0, &flat_window(22.0), 0);
        assert!(classifier.should_record(0));
        assert!(!classifier.should_record(1000));
        assert!(!classifier.should_record(OFF_STATE_RECORDING_INTERVAL_MS - 1));
        assert!(classifier.should_record(OFF_STATE_RECORDING_INTERVAL_MS));
    }

    #[test]
    fn off_interval_restarts_after_an_active_period() {
        let mut classifier = StateClassifier::new();
        classifier.classify(22.0, 0.0, 100.0, &flat_window(22.0), 0);
        assert!(classifier.should_record(0));

        classifier.classify(90.0, 50.0, 100.0, &flat_window(90.0), 1000);
        assert!(classifier.should_record(1000));

        classifier.classify(22.0, 0.0, 100.0, &flat_window(22.0), 2000);
        // Back in off: the interval clock starts fresh.
        assert!(classifier.should_record(2000));
    }
}
