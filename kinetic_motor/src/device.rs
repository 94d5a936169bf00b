//! Device client: wire-protocol client to the motor process.
//!
//! Tracks the connection state and a per-motor [`MotorState`] that is
//! updated optimistically on every send. Speeds are checked against the
//! safety limits once more before anything is written; this duplicates the
//! safety controller on purpose.

use crate::link::DeviceLink;
use chrono::{DateTime, Utc};
use kinetic_common::motor::{CommandSet, MotorMap, MotorName, MotorState, SafetyLimits};
use kinetic_common::wire::DeviceMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Error type for device communication.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Operation requires a connected device.
    #[error("Device not connected")]
    NotConnected,

    /// Bounded operation exceeded its deadline.
    #[error("Device timeout: {0}")]
    Timeout(String),

    /// Writing to the device failed.
    #[error("Send failed: {0}")]
    Send(String),

    /// Message could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// Command refused by the client-side limit check.
    #[error("Motor {motor} speed {speed:.1} RPM exceeds limit {limit:.1} RPM")]
    LimitExceeded {
        motor: MotorName,
        speed: f64,
        limit: f64,
    },
}

/// Connection state of the device client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

/// Client for the motor process.
pub struct DeviceClient {
    link: Box<dyn DeviceLink>,
    status: ConnectionStatus,
    limits: SafetyLimits,
    motors: MotorMap<MotorState>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl DeviceClient {
    pub fn new(link: Box<dyn DeviceLink>, limits: SafetyLimits) -> Self {
        Self {
            link,
            status: ConnectionStatus::Disconnected,
            limits,
            motors: MotorMap::default(),
            last_heartbeat: None,
        }
    }

    #[inline]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn endpoint(&self) -> String {
        self.link.endpoint()
    }

    pub fn motor_state(&self, motor: MotorName) -> &MotorState {
        &self.motors[motor]
    }

    pub fn motor_states(&self) -> &MotorMap<MotorState> {
        &self.motors
    }

    /// Record a temperature reading on the local motor state.
    pub fn set_temperature(&mut self, motor: MotorName, temperature_c: f64) {
        self.motors[motor].temperature_c = Some(temperature_c);
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// Open the link and announce ourselves with `init`.
    pub async fn connect(&mut self) -> Result<(), DeviceError> {
        if self.is_connected() {
            return Ok(());
        }
        self.status = ConnectionStatus::Connecting;
        info!("🔌 Connecting to motor device at {}", self.link.endpoint());

        if let Err(e) = self.link.open().await {
            self.status = ConnectionStatus::Error;
            error!("Motor device connection failed: {e}");
            return Err(e);
        }
        self.status = ConnectionStatus::Connected;
        self.send(&DeviceMessage::init()).await?;
        info!("✅ Connected to motor device");
        Ok(())
    }

    /// Stop the motors, say goodbye and close the link. Best effort.
    pub async fn disconnect(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.emergency_stop().await {
                warn!("Emergency stop during disconnect failed: {e}");
            }
            if let Err(e) = self.send(&DeviceMessage::Disconnect).await {
                warn!("Disconnect message failed: {e}");
            }
        }
        self.link.close().await;
        self.status = ConnectionStatus::Disconnected;
        info!("Motor device disconnected");
    }

    /// Send a command set and update motor states optimistically.
    pub async fn send_command_set(
        &mut self,
        set: &CommandSet,
        session_id: Option<&str>,
    ) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        for (motor, command) in set.motors.iter() {
            let limit = self.limits.max_rpm(motor);
            if !self.limits.permits(motor, command.speed()) {
                return Err(DeviceError::LimitExceeded {
                    motor,
                    speed: command.speed(),
                    limit,
                });
            }
        }

        self.send(&DeviceMessage::motor_commands(set, session_id)).await?;

        let now = Utc::now();
        for (motor, state) in self.motors.iter_mut() {
            state.apply_command(set.command(motor), now);
        }
        debug!(epoch = set.epoch, "Motor commands sent");
        Ok(())
    }

    /// Command every motor to stop and zero the local state.
    pub async fn emergency_stop(&mut self) -> Result<(), DeviceError> {
        self.send(&DeviceMessage::emergency_stop()).await?;
        let now = Utc::now();
        for (_, state) in self.motors.iter_mut() {
            state.halt(now);
        }
        warn!("🛑 Emergency stop sent to motor device");
        Ok(())
    }

    /// Keep-alive. Requires a connected device.
    pub async fn heartbeat(&mut self) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.send(&DeviceMessage::heartbeat()).await?;
        self.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn send(&mut self, message: &DeviceMessage) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let line = message
            .encode_line()
            .map_err(|e| DeviceError::Encode(e.to_string()))?;
        if let Err(e) = self.link.send_line(&line).await {
            self.status = ConnectionStatus::Error;
            error!(kind = message.kind(), "Device send failed: {e}");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedLink;
    use kinetic_common::motor::MotorCommand;

    fn client() -> (DeviceClient, SimulatedLink) {
        let link = SimulatedLink::new();
        (
            DeviceClient::new(Box::new(link.clone()), SafetyLimits::default()),
            link,
        )
    }

    #[tokio::test]
    async fn connect_sends_init() {
        let (mut client, link) = client();
        client.connect().await.unwrap();
        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(link.device().lock().count("init"), 1);
    }

    #[tokio::test]
    async fn refused_connection_sets_error_status() {
        let (mut client, link) = client();
        link.device().lock().refuse_connections = true;
        assert!(client.connect().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (mut client, _) = client();
        let err = client
            .send_command_set(&CommandSet::stopped(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
        assert!(matches!(client.heartbeat().await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn send_updates_motor_state_optimistically() {
        let (mut client, link) = client();
        client.connect().await.unwrap();
        let set = CommandSet::stopped(3).with_motor(
            MotorName::PenBrush,
            MotorCommand::from_velocity(-40.0).unwrap(),
        );
        client.send_command_set(&set, Some("s")).await.unwrap();

        let pb = client.motor_state(MotorName::PenBrush);
        assert_eq!(pb.target_velocity_rpm, -40.0);
        assert!(pb.is_moving);
        assert!(!client.motor_state(MotorName::Canvas).is_moving);
        assert_eq!(link.device().lock().count("motor_commands"), 1);
    }

    #[tokio::test]
    async fn client_side_limit_check_refuses_before_sending() {
        let (mut client, link) = client();
        client.connect().await.unwrap();
        let set = CommandSet::stopped(0).with_motor(
            MotorName::PenColorDepth,
            MotorCommand::from_velocity(61.0).unwrap(),
        );
        let err = client.send_command_set(&set, None).await.unwrap_err();
        assert!(matches!(err, DeviceError::LimitExceeded { motor: MotorName::PenColorDepth, .. }));
        assert_eq!(link.device().lock().count("motor_commands"), 0);
    }

    #[tokio::test]
    async fn failed_send_moves_to_error() {
        let (mut client, link) = client();
        client.connect().await.unwrap();
        link.device().lock().fail_sends = true;
        assert!(client.heartbeat().await.is_err());
        assert_eq!(client.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_stops_then_says_goodbye() {
        let (mut client, link) = client();
        client.connect().await.unwrap();
        client.disconnect().await;
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        let device = link.device();
        let device = device.lock();
        let kinds: Vec<_> = device.received.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["init", "emergency_stop", "disconnect"]);
        assert!(!device.open);
    }
}
