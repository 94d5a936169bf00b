//! Device links: the byte transport beneath the device client.
//!
//! | Link            | Use                                          |
//! |-----------------|----------------------------------------------|
//! | [`TcpLink`]       | Production; TCP to the motor process         |
//! | [`SimulatedLink`] | `--simulate` and tests; records every line   |
//!
//! A link only moves lines. Connection state, message encoding and motor
//! bookkeeping live in [`crate::device::DeviceClient`].

use crate::device::DeviceError;
use async_trait::async_trait;
use kinetic_common::wire::DeviceMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Line transport to the motor process.
#[async_trait]
pub trait DeviceLink: Send {
    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> String;

    /// Open the transport. Must be bounded in time.
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Write one newline-terminated line.
    async fn send_line(&mut self, line: &str) -> Result<(), DeviceError>;

    /// Close the transport. Never fails.
    async fn close(&mut self);
}

// ─── TCP ────────────────────────────────────────────────────────────

/// TCP link with bounded connect and write times.
pub struct TcpLink {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            io_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl DeviceLink for TcpLink {
    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DeviceError::Timeout(format!("connect to {addr}")))?
            .map_err(|e| DeviceError::Connect(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DeviceError::Connect(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        match timeout(self.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeviceError::Send(e.to_string())),
            Err(_) => Err(DeviceError::Timeout("write".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {e}");
            }
        }
    }
}

// ─── Simulation ─────────────────────────────────────────────────────

/// Shared view of what a [`SimulatedLink`] received.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    /// Decoded messages in arrival order.
    pub received: Vec<DeviceMessage>,
    /// Whether the link is currently open.
    pub open: bool,
    /// Make `open` fail.
    pub refuse_connections: bool,
    /// Make `send_line` fail.
    pub fail_sends: bool,
    /// Lines that failed to decode.
    pub malformed: usize,
}

impl SimulatedDevice {
    /// Count received messages with the given wire `type`.
    pub fn count(&self, kind: &str) -> usize {
        self.received.iter().filter(|m| m.kind() == kind).count()
    }

    /// Most recent message with the given wire `type`.
    pub fn last(&self, kind: &str) -> Option<&DeviceMessage> {
        self.received.iter().rev().find(|m| m.kind() == kind)
    }
}

/// In-process link that decodes and records every line.
#[derive(Clone, Default)]
pub struct SimulatedLink {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for inspecting or scripting the simulated device.
    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        Arc::clone(&self.device)
    }
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    fn endpoint(&self) -> String {
        "sim://motors".to_string()
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        let mut device = self.device.lock();
        if device.refuse_connections {
            return Err(DeviceError::Connect("simulated device refused connection".into()));
        }
        device.open = true;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let mut device = self.device.lock();
        if !device.open {
            return Err(DeviceError::NotConnected);
        }
        if device.fail_sends {
            return Err(DeviceError::Send("simulated send failure".into()));
        }
        match DeviceMessage::decode_line(line) {
            Ok(message) => device.received.push(message),
            Err(_) => device.malformed += 1,
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.device.lock().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_link_records_decoded_lines() {
        let mut link = SimulatedLink::new();
        let device = link.device();
        link.open().await.unwrap();
        link.send_line(&DeviceMessage::heartbeat().encode_line().unwrap())
            .await
            .unwrap();
        link.send_line("not json\n").await.unwrap();
        link.close().await;

        let device = device.lock();
        assert_eq!(device.count("heartbeat"), 1);
        assert_eq!(device.malformed, 1);
        assert!(!device.open);
    }

    #[tokio::test]
    async fn simulated_link_requires_open() {
        let mut link = SimulatedLink::new();
        let err = link.send_line("{}\n").await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
    }

    #[tokio::test]
    async fn tcp_link_times_out_on_unroutable_address() {
        // 10.255.255.1 is non-routable in most environments; either a timeout
        // or an immediate connect error is acceptable.
        let mut link = TcpLink::new(
            "10.255.255.1",
            9,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        assert!(link.open().await.is_err());
    }
}
