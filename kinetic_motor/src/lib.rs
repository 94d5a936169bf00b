//! # Kinetic Motor Library
//!
//! Hardware side of the installation: everything between a computed
//! command set and the motor process.
//!
//! # Module Structure
//!
//! - [`safety`] - Safety state machine, alerts and the emergency stop latch
//! - [`link`] - Line transports (TCP and simulated)
//! - [`device`] - Device protocol client and per-motor state
//! - [`supervisor`] - Background task ownership and cancellation
//! - [`coordinator`] - Single owner of the hardware path
//! - [`source`] - Command source seam and local sources
//! - [`control_loop`] - Fixed-cadence pipeline with error escalation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         kinetic_motor                            │
//! │  ┌───────────────┐   ┌──────────────────────┐                    │
//! │  │ CommandSource │──►│     ControlLoop      │                    │
//! │  └───────────────┘   └──────────┬───────────┘                    │
//! │                                 │      manual override (hub)     │
//! │                                 ▼             │                  │
//! │                   ┌───────────────────────────▼──┐               │
//! │                   │     HardwareCoordinator      │               │
//! │                   │  SafetyController → Device   │               │
//! │                   └──────────────┬───────────────┘               │
//! │                                  ▼                               │
//! │                         DeviceLink (TCP / sim)                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod control_loop;
pub mod coordinator;
pub mod device;
pub mod link;
pub mod safety;
pub mod source;
pub mod supervisor;

pub use crate::control_loop::{ControlLoop, LoopHealth, LoopSettings, LoopStats, OrchestrationError};
pub use crate::coordinator::{HardwareCoordinator, HardwareError, HardwareEvent, HardwareStatus, StopReason};
pub use crate::device::{ConnectionStatus, DeviceClient, DeviceError};
pub use crate::link::{DeviceLink, SimulatedLink, TcpLink};
pub use crate::safety::SafetyController;
pub use crate::source::{CommandSource, DataError, ReplaySource, StillSource};
pub use crate::supervisor::{Schedule, ShutdownSignal, TaskSupervisor};
