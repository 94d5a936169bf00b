//! Recording of manual motor commands.
//!
//! While a recording is active every manual command accepted by the
//! hardware is appended with its offset from the start. Stopping writes
//! `{dir}/{session_name}.json`.

use crate::store::{StorageError, write_json};
use chrono::{DateTime, Utc};
use kinetic_common::motor::{MotorCommand, MotorDirection, MotorName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Recording '{0}' is already active")]
    AlreadyRecording(String),

    #[error("No recording is active")]
    NotRecording,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedCommand {
    /// Seconds since the recording started.
    pub offset_secs: f64,
    pub motor_name: MotorName,
    pub velocity_rpm: f64,
    pub direction: MotorDirection,
    pub client_id: String,
}

/// Contents of a recording file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub session_name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub commands: Vec<RecordedCommand>,
}

/// What a finished recording produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub session_name: String,
    pub commands: usize,
    pub path: PathBuf,
}

pub struct Recorder {
    dir: PathBuf,
    active: Mutex<Option<Recording>>,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn start(&self, session_name: &str) -> Result<(), RecorderError> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(RecorderError::AlreadyRecording(current.session_name.clone()));
        }
        *active = Some(Recording {
            session_name: session_name.to_string(),
            started_at: Utc::now(),
            stopped_at: None,
            commands: Vec::new(),
        });
        info!(session_name, "⏺️ Recording started");
        Ok(())
    }

    /// Append a command if a recording is active.
    pub fn record(&self, motor: MotorName, command: &MotorCommand, client_id: &str) {
        if let Some(recording) = self.active.lock().as_mut() {
            let offset = Utc::now() - recording.started_at;
            recording.commands.push(RecordedCommand {
                offset_secs: offset.num_milliseconds() as f64 / 1000.0,
                motor_name: motor,
                velocity_rpm: command.velocity_rpm(),
                direction: command.direction(),
                client_id: client_id.to_string(),
            });
        }
    }

    /// Finish the recording and write it out.
    pub async fn stop(&self) -> Result<RecordingSummary, RecorderError> {
        let mut recording = self.active.lock().take().ok_or(RecorderError::NotRecording)?;
        recording.stopped_at = Some(Utc::now());

        let path = self.dir.join(format!("{}.json", file_stem(&recording.session_name)));
        write_json(&path, &recording).await?;
        info!(
            session_name = %recording.session_name,
            commands = recording.commands.len(),
            path = %path.display(),
            "Recording saved"
        );
        Ok(RecordingSummary {
            session_name: recording.session_name,
            commands: recording.commands.len(),
            path,
        })
    }
}

/// Keep names usable as file names.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "recording".to_string() } else { stem }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn recording_is_written_on_stop() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::new(dir.path().join("recordings"));
        recorder.record(MotorName::Canvas, &MotorCommand::STOP, "ignored");

        recorder.start("evening/show").unwrap();
        assert!(matches!(recorder.start("other"), Err(RecorderError::AlreadyRecording(_))));
        recorder.record(MotorName::PenBrush, &MotorCommand::from_velocity(-15.0).unwrap(), "c1");

        let summary = recorder.stop().await.unwrap();
        assert_eq!(summary.commands, 1);
        assert!(summary.path.ends_with("recordings/evening_show.json"));
        assert!(!recorder.is_active());

        let saved: Recording =
            serde_json::from_str(&std::fs::read_to_string(&summary.path).unwrap()).unwrap();
        assert_eq!(saved.session_name, "evening/show");
        assert_eq!(saved.commands[0].motor_name, MotorName::PenBrush);
        assert_eq!(saved.commands[0].direction, MotorDirection::Ccw);
        assert!(saved.stopped_at.is_some());

        assert!(matches!(recorder.stop().await, Err(RecorderError::NotRecording)));
    }
}
