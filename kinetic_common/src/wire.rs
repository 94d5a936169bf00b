//! Device wire protocol.
//!
//! Newline-delimited JSON objects tagged by `type`. Every message is sent
//! from the controller to the motor process; the device does not answer.
//!
//! ```text
//! {"type":"init","timestamp":1700000000.12}
//! {"type":"motor_commands","timestamp":…,"session_id":"…","epoch":12,
//!  "motors":{"canvas":{"velocity":40.0,"direction":"CW"},"pb":…,"pcd":…,"pe":…}}
//! {"type":"emergency_stop","timestamp":…}
//! {"type":"heartbeat","timestamp":…}
//! {"type":"disconnect"}
//! ```

use crate::motor::{CommandSet, MotorCommand, MotorDirection, MotorName};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current Unix time in seconds with microsecond precision.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// One motor entry of a `motor_commands` message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireMotor {
    pub velocity: f64,
    pub direction: MotorDirection,
}

impl From<&MotorCommand> for WireMotor {
    fn from(cmd: &MotorCommand) -> Self {
        Self {
            velocity: cmd.velocity_rpm(),
            direction: cmd.direction(),
        }
    }
}

/// The four motors keyed by their short device names.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceMotors {
    pub canvas: WireMotor,
    pub pb: WireMotor,
    pub pcd: WireMotor,
    pub pe: WireMotor,
}

impl DeviceMotors {
    pub fn from_command_set(set: &CommandSet) -> Self {
        let wire = |m: MotorName| WireMotor::from(set.command(m));
        Self {
            canvas: wire(MotorName::Canvas),
            pb: wire(MotorName::PenBrush),
            pcd: wire(MotorName::PenColorDepth),
            pe: wire(MotorName::PenElevation),
        }
    }

    pub fn get(&self, motor: MotorName) -> &WireMotor {
        match motor {
            MotorName::Canvas => &self.canvas,
            MotorName::PenBrush => &self.pb,
            MotorName::PenColorDepth => &self.pcd,
            MotorName::PenElevation => &self.pe,
        }
    }
}

/// Message sent to the motor process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Init {
        timestamp: f64,
    },
    MotorCommands {
        timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        epoch: u64,
        motors: DeviceMotors,
    },
    EmergencyStop {
        timestamp: f64,
    },
    Heartbeat {
        timestamp: f64,
    },
    Disconnect,
}

impl DeviceMessage {
    pub fn init() -> Self {
        Self::Init {
            timestamp: unix_timestamp(),
        }
    }

    pub fn motor_commands(set: &CommandSet, session_id: Option<&str>) -> Self {
        Self::MotorCommands {
            timestamp: unix_timestamp(),
            session_id: session_id.map(str::to_owned),
            epoch: set.epoch,
            motors: DeviceMotors::from_command_set(set),
        }
    }

    pub fn emergency_stop() -> Self {
        Self::EmergencyStop {
            timestamp: unix_timestamp(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: unix_timestamp(),
        }
    }

    /// Wire `type` tag.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::MotorCommands { .. } => "motor_commands",
            Self::EmergencyStop { .. } => "emergency_stop",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Disconnect => "disconnect",
        }
    }

    /// Encode as one line, terminator included.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (terminator optional).
    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
