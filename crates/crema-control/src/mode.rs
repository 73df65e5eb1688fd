//! Operating-mode state machine: off / espresso / steam.
//!
//! The controller owns the commanded mode and the steam watchdog. Steam is
//! self-terminating: arming steam spawns a timer task that hands control
//! back to espresso at the deadline. While a watchdog lives, its presence –
//! not the stored mode – is the source of truth for "is steam active",
//! which closes the race between "mode written" and "timer fired".
//!
//! Watchdog cancellation is idempotent and generation-tagged: a timer that
//! fires after being superseded by a newer steam command finds a foreign
//! generation and stands down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crema_store::ConfigStore;
use crema_types::{CoreError, Event, EventPayload, Mode, ModeChangeReason, ModeKind};

use crate::bus::EventBus;

/// Accepted steam watchdog duration bounds, in seconds.
pub const STEAM_MIN_SECS: u64 = 10;
pub const STEAM_MAX_SECS: u64 = 600;
/// Steam duration applied when the caller gives none.
pub const STEAM_DEFAULT_SECS: u64 = 300;

const EVENT_SOURCE: &str = "crema-control::mode";

/// Result of a mode or setpoint command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeUpdate {
    pub mode: ModeKind,
    pub target: f64,
}

struct SteamWatchdog {
    deadline: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

struct ModeInner {
    mode: Mode,
    watchdog: Option<SteamWatchdog>,
}

/// Owner of the commanded mode and the steam watchdog.
///
/// Safe for concurrent use from the command-interface threads and the
/// watchdog timer task.
pub struct ModeController {
    config: Arc<ConfigStore>,
    bus: EventBus,
    inner: Mutex<ModeInner>,
    generation: AtomicU64,
}

impl ModeController {
    /// Create the controller in espresso mode (the startup default).
    pub fn new(config: Arc<ConfigStore>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            inner: Mutex::new(ModeInner {
                mode: Mode::Espresso,
                watchdog: None,
            }),
            generation: AtomicU64::new(0),
        })
    }

    /// Command a mode change.
    ///
    /// For steam, `duration_secs` must be within
    /// `[STEAM_MIN_SECS, STEAM_MAX_SECS]`; absent means
    /// [`STEAM_DEFAULT_SECS`]. Re-entering steam extends the watchdog with
    /// the new duration. A `mode_change` event is emitted on every actual
    /// transition (repeating the current mode emits nothing).
    pub fn set_mode(
        self: &Arc<Self>,
        target: ModeKind,
        duration_secs: Option<u64>,
    ) -> Result<ModeUpdate, CoreError> {
        let duration = match (target, duration_secs) {
            (ModeKind::Steam, Some(secs)) => {
                if !(STEAM_MIN_SECS..=STEAM_MAX_SECS).contains(&secs) {
                    return Err(CoreError::Validation(format!(
                        "steam duration {secs} s outside [{STEAM_MIN_SECS}, {STEAM_MAX_SECS}] s"
                    )));
                }
                Duration::from_secs(secs)
            }
            (ModeKind::Steam, None) => Duration::from_secs(STEAM_DEFAULT_SECS),
            _ => Duration::ZERO,
        };

        let mut inner = self.inner.lock().expect("mode lock poisoned");
        let previous = inner.mode.kind();

        let cfg = self.config.snapshot();
        let setpoint = match target {
            ModeKind::Off => 0.0,
            ModeKind::Espresso => cfg.espresso_temperature,
            ModeKind::Steam => cfg.steam_temperature,
        };
        self.config
            .update(|c| c.target_temperature = setpoint)
            .map_err(|e| CoreError::Config(e.to_string()))?;

        if let Some(wd) = inner.watchdog.take() {
            wd.handle.abort();
        }

        inner.mode = match target {
            ModeKind::Off => Mode::Off,
            ModeKind::Espresso => Mode::Espresso,
            ModeKind::Steam => {
                let deadline = Instant::now() + duration;
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let me: Weak<Self> = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    if let Some(ctrl) = me.upgrade() {
                        ctrl.steam_expired(generation);
                    }
                });
                inner.watchdog = Some(SteamWatchdog {
                    deadline,
                    generation,
                    handle,
                });
                Mode::Steam { deadline }
            }
        };
        drop(inner);

        if previous != target {
            info!(mode = %target, reason = "manual", "mode change");
            self.bus.publish(Event::new(
                EVENT_SOURCE,
                EventPayload::ModeChange {
                    mode: target,
                    reason: ModeChangeReason::Manual,
                },
            ));
        }

        Ok(ModeUpdate {
            mode: target,
            target: setpoint,
        })
    }

    /// Watchdog expiry: hand control back to espresso unless this timer was
    /// superseded or cancelled.
    fn steam_expired(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("mode lock poisoned");
        if inner
            .watchdog
            .take_if(|wd| wd.generation == generation)
            .is_none()
        {
            return;
        }
        inner.mode = Mode::Espresso;
        if let Err(e) = self
            .config
            .update(|c| c.target_temperature = c.espresso_temperature)
        {
            warn!(error = %e, "could not persist espresso setpoint after steam timeout");
        }
        drop(inner);

        info!(mode = "espresso", reason = "steam_timeout", "mode change");
        self.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::ModeChange {
                mode: ModeKind::Espresso,
                reason: ModeChangeReason::SteamTimeout,
            },
        ));
    }

    /// The active mode. Steam if and only if a watchdog is armed; a stored
    /// steam mode whose watchdog is gone reads as espresso (the timer fired
    /// and the transition is in flight).
    pub fn current(&self) -> Mode {
        let inner = self.inner.lock().expect("mode lock poisoned");
        match (&inner.watchdog, inner.mode) {
            (Some(wd), _) => Mode::Steam {
                deadline: wd.deadline,
            },
            (None, Mode::Steam { .. }) => Mode::Espresso,
            (None, mode) => mode,
        }
    }

    /// Seconds until the steam watchdog fires, `None` outside steam.
    pub fn steam_remaining(&self) -> Option<f64> {
        self.current()
            .steam_remaining(Instant::now())
            .map(|d| d.as_secs_f64())
    }

    /// Set the active setpoint, and fold it into the per-mode preference of
    /// the current mode (espresso or steam; in off only the active setpoint
    /// changes).
    pub fn set_target(&self, target: f64) -> Result<ModeUpdate, CoreError> {
        if !(0.0..=200.0).contains(&target) {
            return Err(CoreError::Validation(format!(
                "target {target} °C outside [0, 200] °C"
            )));
        }
        let kind = self.current().kind();
        self.config
            .update(|c| {
                c.target_temperature = target;
                match kind {
                    ModeKind::Espresso => c.espresso_temperature = target,
                    ModeKind::Steam => c.steam_temperature = target,
                    ModeKind::Off => {}
                }
            })
            .map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(ModeUpdate { mode: kind, target })
    }
}
