//! Command sources: where the control loop gets its per-epoch intent.
//!
//! The mapping from external data to velocities lives outside this crate.
//! [`CommandSource`] is the seam; two local implementations ship here:
//!
//! | Source            | Behavior                                             |
//! |-------------------|------------------------------------------------------|
//! | [`StillSource`]   | Every motor held at zero                             |
//! | [`ReplaySource`]  | Per-epoch velocities from a JSON file, clamped       |

use async_trait::async_trait;
use kinetic_common::motor::{CommandSet, MotorCommand, MotorMap, MotorName, SafetyLimits};
use serde_json::json;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Failure to produce a command set. Counted by the control loop, never fatal
/// on its own.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// Upstream data is temporarily unavailable.
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    /// The source has nothing for this epoch.
    #[error("No command set for epoch {epoch}")]
    Exhausted { epoch: u64 },

    /// Upstream data could not be turned into a command set.
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// A bug or broken invariant, not an upstream condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Producer of the command set for an epoch.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Compute the command set for `epoch`. May be retried.
    async fn next_command_set(&self, epoch: u64) -> Result<CommandSet, DataError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

// ─── Still ──────────────────────────────────────────────────────────

/// Holds every motor at zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct StillSource;

#[async_trait]
impl CommandSource for StillSource {
    async fn next_command_set(&self, epoch: u64) -> Result<CommandSet, DataError> {
        Ok(CommandSet::stopped(epoch))
    }

    fn name(&self) -> &str {
        "still"
    }
}

// ─── Replay ─────────────────────────────────────────────────────────

/// Plays back recorded per-epoch velocities.
///
/// Each frame is a motor map of signed velocities. Speeds are clamped to the
/// generator ceiling, `limit × (1 − margin)`, so a replayed file never asks
/// for more than a live generator would.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    frames: Vec<MotorMap<f64>>,
    limits: SafetyLimits,
    margin: f64,
    looping: bool,
}

impl ReplaySource {
    pub fn new(frames: Vec<MotorMap<f64>>, limits: SafetyLimits, margin: f64) -> Self {
        Self {
            frames,
            limits,
            margin,
            looping: false,
        }
    }

    /// Parse frames from a JSON array.
    pub fn from_json(text: &str, limits: SafetyLimits, margin: f64) -> Result<Self, DataError> {
        let frames: Vec<MotorMap<f64>> =
            serde_json::from_str(text).map_err(|e| DataError::Malformed(e.to_string()))?;
        Ok(Self::new(frames, limits, margin))
    }

    /// Load frames from a JSON file.
    pub fn from_file(path: &Path, limits: SafetyLimits, margin: f64) -> Result<Self, DataError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DataError::Unavailable(format!("{}: {e}", path.display())))?;
        let source = Self::from_json(&text, limits, margin)?;
        info!("Loaded {} replay frames from {}", source.frames.len(), path.display());
        Ok(source)
    }

    /// Wrap around at the end instead of reporting exhaustion.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn frame(&self, epoch: u64) -> Option<&MotorMap<f64>> {
        let index = usize::try_from(epoch).ok()?;
        if self.looping && !self.frames.is_empty() {
            self.frames.get(index % self.frames.len())
        } else {
            self.frames.get(index)
        }
    }

    fn clamp(&self, motor: MotorName, velocity: f64) -> Result<MotorCommand, DataError> {
        if !velocity.is_finite() {
            return Err(DataError::Malformed(format!("{motor} velocity is not finite")));
        }
        let ceiling = self.limits.generator_ceiling(motor, self.margin);
        MotorCommand::from_velocity(velocity.clamp(-ceiling, ceiling))
            .map_err(|e| DataError::Internal(e.to_string()))
    }
}

#[async_trait]
impl CommandSource for ReplaySource {
    async fn next_command_set(&self, epoch: u64) -> Result<CommandSet, DataError> {
        let frame = self.frame(epoch).ok_or(DataError::Exhausted { epoch })?;

        let mut motors = MotorMap::<MotorCommand>::default();
        for (motor, velocity) in frame.iter() {
            motors[motor] = self.clamp(motor, *velocity)?;
        }
        debug!(epoch, "Replay frame");
        Ok(CommandSet::new(epoch, motors)
            .with_limits(self.limits)
            .with_source(json!({ "source": "replay", "frame": epoch })))
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FRAMES: &str = r#"[
        {"motor_canvas": 50.0, "motor_pb": -10.0, "motor_pcd": 0.0, "motor_pe": 5.0},
        {"canvas": 500.0, "pb": -500.0, "pcd": 1.0, "pe": 0.0}
    ]"#;

    #[tokio::test]
    async fn still_source_is_all_zero() {
        let set = StillSource.next_command_set(9).await.unwrap();
        assert_eq!(set.epoch, 9);
        assert!(set.is_emergency_stop());
    }

    #[tokio::test]
    async fn replay_clamps_to_generator_ceiling() {
        let source = ReplaySource::from_json(FRAMES, SafetyLimits::default(), 0.10).unwrap();
        let first = source.next_command_set(0).await.unwrap();
        assert_eq!(first.command(MotorName::PenBrush).velocity_rpm(), -10.0);

        let second = source.next_command_set(1).await.unwrap();
        let canvas = second.command(MotorName::Canvas).velocity_rpm();
        let pb = second.command(MotorName::PenBrush).velocity_rpm();
        assert!((canvas - 108.0).abs() < 1e-9);
        assert!((pb + 72.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replay_reports_exhaustion_unless_looping() {
        let source = ReplaySource::from_json(FRAMES, SafetyLimits::default(), 0.10).unwrap();
        assert!(matches!(
            source.next_command_set(2).await,
            Err(DataError::Exhausted { epoch: 2 })
        ));

        let looping = source.looping();
        let wrapped = looping.next_command_set(2).await.unwrap();
        assert_eq!(wrapped.command(MotorName::Canvas).velocity_rpm(), 50.0);
        assert_eq!(wrapped.epoch, 2);
    }

    #[test]
    fn replay_rejects_frames_missing_a_motor() {
        let err = ReplaySource::from_json(r#"[{"canvas": 1.0}]"#, SafetyLimits::default(), 0.1)
            .unwrap_err();
        assert!(matches!(err, DataError::Malformed(_)));
    }

    #[test]
    fn replay_loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FRAMES.as_bytes()).unwrap();
        let source = ReplaySource::from_file(file.path(), SafetyLimits::default(), 0.1).unwrap();
        assert_eq!(source.len(), 2);

        let missing = ReplaySource::from_file(Path::new("/nonexistent/replay.json"), SafetyLimits::default(), 0.1);
        assert!(matches!(missing, Err(DataError::Unavailable(_))));
    }
}
