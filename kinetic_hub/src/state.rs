//! In-process owner of the system mode and the last commanded motor states.
//!
//! Both values live here and nowhere else. The files under the state
//! directory (`system_mode.txt`, `last_motor_states.json`) are snapshots
//! for restart continuity only and are never read back while running.

use crate::store::{StorageError, write_atomic, write_json};
use kinetic_common::motor::{MotorMap, MotorName, MotorSnapshot, MotorState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info, warn};

pub const MODE_FILE: &str = "system_mode.txt";
pub const MOTOR_STATES_FILE: &str = "last_motor_states.json";

/// Who drives the motors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// The control loop of a blockchain session.
    #[default]
    Auto,
    /// Hub clients.
    Manual,
}

impl SystemMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" | "auto-blockchain" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(other.to_string()),
        }
    }
}

fn idle_snapshots() -> MotorMap<MotorSnapshot> {
    MotorMap::from_fn(|_| MotorSnapshot::from_state(&MotorState::default()))
}

fn same_target(a: &MotorSnapshot, b: &MotorSnapshot) -> bool {
    a.velocity_rpm == b.velocity_rpm && a.direction == b.direction && a.is_enabled == b.is_enabled
}

struct Values {
    mode: SystemMode,
    motors: MotorMap<MotorSnapshot>,
}

/// Single owner of the shared installation state.
pub struct StateStore {
    dir: Option<PathBuf>,
    values: Mutex<Values>,
}

impl StateStore {
    /// A store without snapshot files.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            values: Mutex::new(Values {
                mode: SystemMode::default(),
                motors: idle_snapshots(),
            }),
        }
    }

    /// Restore from the snapshots in `dir`. Missing or unreadable snapshots
    /// fall back to auto mode with idle motors.
    pub async fn load(dir: &Path) -> Self {
        let mode = match fs::read_to_string(dir.join(MODE_FILE)).await {
            Ok(text) => text.parse().unwrap_or_else(|bad| {
                warn!("Unknown mode '{bad}' in snapshot, using auto");
                SystemMode::default()
            }),
            Err(_) => SystemMode::default(),
        };
        let motors = match fs::read_to_string(dir.join(MOTOR_STATES_FILE)).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Ignoring malformed motor state snapshot: {e}");
                idle_snapshots()
            }),
            Err(_) => idle_snapshots(),
        };
        info!(%mode, dir = %dir.display(), "State restored");
        Self {
            dir: Some(dir.to_path_buf()),
            values: Mutex::new(Values { mode, motors }),
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.values.lock().mode
    }

    /// Switch mode; returns the previous one.
    pub fn set_mode(&self, mode: SystemMode) -> SystemMode {
        std::mem::replace(&mut self.values.lock().mode, mode)
    }

    pub fn motor_snapshots(&self) -> MotorMap<MotorSnapshot> {
        self.values.lock().motors
    }

    /// Take in the coordinator's motor states and return the motors whose
    /// commanded target changed.
    pub fn record_motor_states(
        &self,
        states: &MotorMap<MotorState>,
    ) -> Vec<(MotorName, MotorSnapshot)> {
        let mut values = self.values.lock();
        let mut changed = Vec::new();
        for (motor, state) in states.iter() {
            let next = MotorSnapshot::from_state(state);
            let slot = &mut values.motors[motor];
            if !same_target(slot, &next) {
                changed.push((motor, next));
            }
            *slot = next;
        }
        changed
    }

    /// Write both snapshots.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let (mode, motors) = {
            let values = self.values.lock();
            (values.mode, values.motors)
        };
        write_atomic(&dir.join(MODE_FILE), mode.as_str().as_bytes()).await?;
        write_json(&dir.join(MOTOR_STATES_FILE), &motors).await?;
        debug!(%mode, "State snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kinetic_common::motor::MotorCommand;
    use tempfile::TempDir;

    fn states_with_canvas(velocity: f64) -> MotorMap<MotorState> {
        let mut states = MotorMap::<MotorState>::default();
        states[MotorName::Canvas].apply_command(&MotorCommand::from_velocity(velocity).unwrap(), Utc::now());
        states
    }

    #[test]
    fn mode_accepts_the_legacy_auto_name() {
        assert_eq!("auto-blockchain".parse::<SystemMode>(), Ok(SystemMode::Auto));
        assert_eq!("manual\n".parse::<SystemMode>(), Ok(SystemMode::Manual));
        assert!("turbo".parse::<SystemMode>().is_err());
    }

    #[test]
    fn only_changed_targets_are_reported() {
        let store = StateStore::in_memory();
        let changed = store.record_motor_states(&states_with_canvas(12.0));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, MotorName::Canvas);
        assert_eq!(changed[0].1.velocity_rpm, 12.0);

        assert!(store.record_motor_states(&states_with_canvas(12.0)).is_empty());
        assert_eq!(store.motor_snapshots()[MotorName::Canvas].velocity_rpm, 12.0);
    }

    #[tokio::test]
    async fn snapshots_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).await;
        assert_eq!(store.mode(), SystemMode::Auto);

        assert_eq!(store.set_mode(SystemMode::Manual), SystemMode::Auto);
        store.record_motor_states(&states_with_canvas(-30.0));
        store.persist().await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join(MODE_FILE)).unwrap(), "manual");
        let restored = StateStore::load(dir.path()).await;
        assert_eq!(restored.mode(), SystemMode::Manual);
        assert_eq!(restored.motor_snapshots()[MotorName::Canvas].velocity_rpm, -30.0);
    }

    #[tokio::test]
    async fn malformed_snapshot_falls_back_to_idle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MOTOR_STATES_FILE), r#"{"motor_canvas": {}}"#).unwrap();
        let store = StateStore::load(dir.path()).await;
        assert_eq!(store.motor_snapshots()[MotorName::PenBrush].velocity_rpm, 0.0);
    }
}
