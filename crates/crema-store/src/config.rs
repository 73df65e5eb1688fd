//! The on-disk JSON configuration document.
//!
//! One document holds the active setpoint, per-mode setpoint preferences,
//! both PID gain sets, and the classifier's last published machine state.
//! Writes are whole-file replacements via a temp-file-then-rename so readers
//! never observe a partial document; unknown keys are preserved on
//! write-back so external tooling can annotate the file freely.
//!
//! Numeric validation is permissive-then-fallback: an out-of-range or
//! wrongly-typed field is replaced by the last-known-good value for that
//! field (kept in memory), then by the compiled-in default. A corrupt
//! document never crashes the core.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crema_types::{Gains, MachineState};

// ────────────────────────────────────────────────────────────────────────────
// Document
// ────────────────────────────────────────────────────────────────────────────

/// Validated configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BoilerConfig {
    /// Active setpoint in Celsius.
    pub target_temperature: f64,
    /// Preferred espresso setpoint.
    pub espresso_temperature: f64,
    /// Preferred steam setpoint.
    pub steam_temperature: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub recovery_proportional: f64,
    pub recovery_integral: f64,
    pub recovery_derivative: f64,
    /// Classifier snapshot for external observers.
    pub machine_state: MachineState,
    pub machine_state_updated: Option<DateTime<Utc>>,
    /// Unrecognized keys, carried through write-back untouched.
    pub extra: Map<String, Value>,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            target_temperature: 100.0,
            espresso_temperature: 100.0,
            steam_temperature: 140.0,
            proportional: 4.0,
            integral: 0.1,
            derivative: 5.0,
            recovery_proportional: 6.0,
            recovery_integral: 0.2,
            recovery_derivative: 8.0,
            machine_state: MachineState::Unknown,
            machine_state_updated: None,
            extra: Map::new(),
        }
    }
}

/// Recognized numeric fields with their accepted ranges.
const NUMERIC_FIELDS: [(&str, f64, f64); 9] = [
    ("target_temperature", 0.0, 200.0),
    ("espresso_temperature", 80.0, 150.0),
    ("steam_temperature", 80.0, 150.0),
    ("proportional", 0.0, 10.0),
    ("integral", 0.0, 5.0),
    ("derivative", 0.0, 100.0),
    ("recovery_proportional", 0.0, 10.0),
    ("recovery_integral", 0.0, 5.0),
    ("recovery_derivative", 0.0, 100.0),
];

const KNOWN_KEYS: [&str; 11] = [
    "target_temperature",
    "espresso_temperature",
    "steam_temperature",
    "proportional",
    "integral",
    "derivative",
    "recovery_proportional",
    "recovery_integral",
    "recovery_derivative",
    "machine_state",
    "machine_state_updated",
];

impl BoilerConfig {
    /// The normal-operation gain set.
    pub fn normal_gains(&self) -> Gains {
        Gains {
            kp: self.proportional,
            ki: self.integral,
            kd: self.derivative,
        }
    }

    /// The recovery gain set, engaged after an abrupt temperature drop.
    pub fn recovery_gains(&self) -> Gains {
        Gains {
            kp: self.recovery_proportional,
            ki: self.recovery_integral,
            kd: self.recovery_derivative,
        }
    }

    /// Build a validated snapshot from a raw JSON document.
    ///
    /// Each recognized field that is missing, wrongly typed, or out of range
    /// falls back to `fallback` (the caller's last-known-good snapshot,
    /// itself seeded from compiled-in defaults).
    pub fn from_value(value: &Value, fallback: &BoilerConfig) -> Self {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                warn!("config document is not a JSON object; keeping last-known-good values");
                return fallback.clone();
            }
        };

        let mut config = fallback.clone();
        for (key, min, max) in NUMERIC_FIELDS {
            let field = field_mut(&mut config, key);
            match obj.get(key).and_then(Value::as_f64) {
                Some(v) if (min..=max).contains(&v) => *field = v,
                Some(v) => {
                    warn!(key, value = v, min, max, "config field out of range; keeping {}", *field);
                }
                None if obj.contains_key(key) => {
                    warn!(key, "config field is not a number; keeping {}", *field);
                }
                None => {}
            }
        }

        config.machine_state = obj
            .get("machine_state")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
            .unwrap_or(fallback.machine_state);

        config.machine_state_updated = obj
            .get("machine_state_updated")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or(fallback.machine_state_updated);

        config.extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        config
    }

    /// Serialize to a JSON document, recognized keys over the preserved
    /// unknown ones.
    pub fn to_value(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("target_temperature".into(), self.target_temperature.into());
        obj.insert("espresso_temperature".into(), self.espresso_temperature.into());
        obj.insert("steam_temperature".into(), self.steam_temperature.into());
        obj.insert("proportional".into(), self.proportional.into());
        obj.insert("integral".into(), self.integral.into());
        obj.insert("derivative".into(), self.derivative.into());
        obj.insert("recovery_proportional".into(), self.recovery_proportional.into());
        obj.insert("recovery_integral".into(), self.recovery_integral.into());
        obj.insert("recovery_derivative".into(), self.recovery_derivative.into());
        obj.insert(
            "machine_state".into(),
            Value::String(self.machine_state.to_string()),
        );
        if let Some(updated) = self.machine_state_updated {
            obj.insert(
                "machine_state_updated".into(),
                Value::String(updated.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        Value::Object(obj)
    }
}

fn field_mut<'a>(config: &'a mut BoilerConfig, key: &str) -> &'a mut f64 {
    match key {
        "target_temperature" => &mut config.target_temperature,
        "espresso_temperature" => &mut config.espresso_temperature,
        "steam_temperature" => &mut config.steam_temperature,
        "proportional" => &mut config.proportional,
        "integral" => &mut config.integral,
        "derivative" => &mut config.derivative,
        "recovery_proportional" => &mut config.recovery_proportional,
        "recovery_integral" => &mut config.recovery_integral,
        "recovery_derivative" => &mut config.recovery_derivative,
        _ => unreachable!("unknown numeric field {key}"),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────────────

/// Errors from configuration persistence.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("permission denied writing {path}")]
    PermissionDenied { path: PathBuf },

    #[error("config serialization failure: {0}")]
    Serialization(String),

    #[error("config I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Owner of the configuration file path.
///
/// Readers get whole-document snapshots; writers go through a copy-on-write
/// [`ConfigStore::update`] that commits to memory only after the atomic disk
/// replacement succeeds, so a failed write rolls the in-memory state back to
/// match the on-disk document.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    current: BoilerConfig,
    last_good: BoilerConfig,
    disk_modified: Option<SystemTime>,
}

impl ConfigStore {
    /// Open the document at `path`, creating it with defaults on first
    /// install.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let defaults = BoilerConfig::default();

        let current = if path.exists() {
            read_document(&path, &defaults)
        } else {
            info!(path = %path.display(), "no configuration found; writing defaults");
            write_document(&defaults, &path)?;
            defaults.clone()
        };

        let disk_modified = modified_time(&path);
        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                last_good: current.clone(),
                current,
                disk_modified,
            }),
        })
    }

    /// A whole-document snapshot of the current configuration.
    pub fn snapshot(&self) -> BoilerConfig {
        self.inner.read().expect("config lock poisoned").current.clone()
    }

    /// Re-read the file if it changed on disk since the last load.
    ///
    /// Returns `Ok(false)` when the file is unchanged (no-op). Field-level
    /// validation failures fall back to the last-known-good values and are
    /// logged; nothing is written back to disk.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let modified = modified_time(&self.path);
        let mut inner = self.inner.write().expect("config lock poisoned");
        if modified.is_some() && modified == inner.disk_modified {
            return Ok(false);
        }

        let next = read_document(&self.path, &inner.last_good);
        inner.current = next.clone();
        inner.last_good = next;
        inner.disk_modified = modified;
        Ok(true)
    }

    /// Copy-on-write update: mutate a copy of the snapshot, persist it
    /// atomically, then commit it to memory.
    ///
    /// # Errors
    ///
    /// On any write failure the in-memory state is left untouched (matching
    /// the on-disk document) and the error is returned to the caller.
    pub fn update<F>(&self, mutate: F) -> Result<BoilerConfig, ConfigError>
    where
        F: FnOnce(&mut BoilerConfig),
    {
        let mut inner = self.inner.write().expect("config lock poisoned");
        let mut next = inner.current.clone();
        mutate(&mut next);

        write_document(&next, &self.path)?;
        inner.disk_modified = modified_time(&self.path);
        // The LKG set only ever holds values that pass validation, even when
        // a cross-field write (e.g. a low target copied into a per-mode
        // preference) lands something out of range on disk.
        inner.last_good = BoilerConfig::from_value(&next.to_value(), &inner.last_good);
        inner.current = next.clone();
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_document(path: &Path, fallback: &BoilerConfig) -> BoilerConfig {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable; keeping last-known-good values");
            return fallback.clone();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => BoilerConfig::from_value(&value, fallback),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unparseable; keeping last-known-good values");
            fallback.clone()
        }
    }
}

fn write_document(config: &BoilerConfig, path: &Path) -> Result<(), ConfigError> {
    let text = serde_json::to_string_pretty(&config.to_value())
        .map_err(|e| ConfigError::Serialization(e.to_string()))?;

    match replace_file(&text, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            // One repair attempt, then surface the failure.
            repair_permissions(path);
            replace_file(&text, path).map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => ConfigError::PermissionDenied {
                    path: path.to_path_buf(),
                },
                _ => ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                },
            })
        }
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn replace_file(text: &str, path: &Path) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

fn repair_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
                warn!(path = %path.display(), error = %e, "config permission repair failed");
            } else {
                info!(path = %path.display(), "repaired config file permissions");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("config.json")).expect("open")
    }

    #[test]
    fn open_creates_defaults_on_first_install() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();

        assert!(path.exists());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.target_temperature, 100.0);
        assert_eq!(snapshot.steam_temperature, 140.0);
        assert_eq!(snapshot.machine_state, MachineState::Unknown);
    }

    #[test]
    fn update_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|c| {
                c.proportional = 7.5;
                c.target_temperature = 95.0;
            })
            .unwrap();

        let reopened = ConfigStore::open(store.path()).unwrap();
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.proportional, 7.5);
        assert_eq!(snapshot.target_temperature, 95.0);
    }

    #[test]
    fn unknown_keys_survive_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"target_temperature": 92, "dashboard_theme": "dark"}"#,
        )
        .unwrap();

        let store = ConfigStore::open(&path).unwrap();
        store.update(|c| c.target_temperature = 93.0).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["dashboard_theme"], "dark");
        assert_eq!(raw["target_temperature"], 93.0);
    }

    #[test]
    fn out_of_range_field_falls_back_to_default_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"proportional": 99.0, "integral": 0.3}"#).unwrap();

        let snapshot = ConfigStore::open(&path).unwrap().snapshot();
        assert_eq!(snapshot.proportional, 4.0); // default
        assert_eq!(snapshot.integral, 0.3); // in range, kept
    }

    #[test]
    fn corrupted_field_falls_back_to_last_known_good_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.update(|c| c.proportional = 7.5).unwrap();

        // External corruption: the gain becomes a string.
        let mut raw: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        raw["proportional"] = Value::String("broken".into());
        fs::write(store.path(), serde_json::to_string(&raw).unwrap()).unwrap();

        assert!(store.reload().unwrap());
        assert_eq!(store.snapshot().proportional, 7.5);
    }

    #[test]
    fn unparseable_document_keeps_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.update(|c| c.derivative = 9.0).unwrap();

        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.reload().unwrap());
        assert_eq!(store.snapshot().derivative, 9.0);
    }

    #[test]
    fn reload_is_a_noop_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.reload().unwrap());
        store.update(|c| c.target_temperature = 96.0).unwrap();
        // The store's own write refreshed its modification stamp.
        assert!(!store.reload().unwrap());
    }

    #[test]
    fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut raw: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        raw["target_temperature"] = 94.0_f64.into();
        fs::write(store.path(), serde_json::to_string(&raw).unwrap()).unwrap();

        assert!(store.reload().unwrap());
        assert_eq!(store.snapshot().target_temperature, 94.0);
    }

    #[test]
    fn machine_state_snapshot_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let stamp = Utc::now();
        store
            .update(|c| {
                c.machine_state = MachineState::Ready;
                c.machine_state_updated = Some(stamp);
            })
            .unwrap();

        let reopened = ConfigStore::open(store.path()).unwrap().snapshot();
        assert_eq!(reopened.machine_state, MachineState::Ready);
        let updated = reopened.machine_state_updated.unwrap();
        assert!((updated - stamp).num_seconds().abs() <= 1);
    }

    #[test]
    fn failed_write_leaves_memory_matching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let before = store.snapshot();

        // Make the rename target un-replaceable: a non-empty directory at
        // the config path.
        fs::remove_file(store.path()).unwrap();
        fs::create_dir(store.path()).unwrap();
        fs::write(store.path().join("occupied"), "x").unwrap();

        let result = store.update(|c| c.target_temperature = 90.0);
        assert!(result.is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.update(|c| c.integral = 0.4).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
