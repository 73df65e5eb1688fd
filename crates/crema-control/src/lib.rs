//! `crema-control` – Safety-critical control core for the boiler.
//!
//! The central regulator of the machine. It does not serve operators; it
//! enforces limits and holds temperature.
//!
//! # Modules
//!
//! - [`supervisor`] – [`SafetySupervisor`][supervisor::SafetySupervisor]:
//!   consecutive-failure shutdown, hard overtemp latch, and the
//!   above-setpoint output override.
//! - [`window`] – [`TempWindow`][window::TempWindow]: the bounded sliding
//!   window of recent samples shared by the classifier and the recovery
//!   detector.
//! - [`classifier`] – [`StateClassifier`][classifier::StateClassifier]:
//!   derives the observed machine state (off/heating/ready) from
//!   temperature history and commanded output, and drives the smart
//!   telemetry recording policy.
//! - [`recovery`] – [`RecoveryDetector`][recovery::RecoveryDetector]:
//!   engages the aggressive recovery gain profile after an abrupt
//!   temperature drop.
//! - [`mode`] – [`ModeController`][mode::ModeController]: the
//!   off/espresso/steam mode machine with the self-terminating steam
//!   watchdog.
//! - [`bus`] – [`EventBus`][bus::EventBus]: broadcast channel carrying
//!   mode-change and machine-state events to the external push layer.
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   1 Hz orchestrator composing sensor → supervisor → PID → actuator →
//!   classifier → telemetry.

pub mod bus;
pub mod classifier;
pub mod control_loop;
pub mod mode;
pub mod recovery;
pub mod supervisor;
pub mod window;

pub use bus::EventBus;
pub use classifier::StateClassifier;
pub use control_loop::ControlLoop;
pub use mode::ModeController;
pub use recovery::RecoveryDetector;
pub use supervisor::{MAX_CONSECUTIVE_FAILURES, MAX_SAFE_TEMP, SafetySupervisor};
pub use window::TempWindow;
