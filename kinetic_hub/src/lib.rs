//! # Kinetic Hub Library
//!
//! Operator-facing side of the installation: session lifecycle, persisted
//! installation state and the WebSocket hub that browsers and tools talk to.
//!
//! # Module Structure
//!
//! - [`session`] - Session lifecycle, persistence and housekeeping
//! - [`store`] - Atomic JSON files on disk
//! - [`state`] - Operating mode and last motor targets
//! - [`auth`] - Shared-secret authentication and access levels
//! - [`recorder`] - Recording of manual motor commands
//! - [`protocol`] - JSON messages exchanged with clients
//! - [`hub`] - Client registry, request routing and event fan-out
//! - [`server`] - WebSocket listener and per-connection tasks
//! - [`error`] - Request errors reported to clients
//!
//! # Architecture
//!
//! ```text
//!  browser ──ws──► server ──► ClientHub ──► SessionManager ──► ControlLoop
//!                               │   ▲                               │
//!                               │   └──── HardwareEvent ────┐       ▼
//!                               └── manual commands ──► HardwareCoordinator
//! ```

pub mod auth;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod session;
pub mod state;
pub mod store;

pub use crate::auth::{Access, Authenticator};
pub use crate::error::HubError;
pub use crate::hub::{ClientHub, HubEvent, Outbound};
pub use crate::protocol::{ClientMessage, ServerMessage};
pub use crate::recorder::Recorder;
pub use crate::server::ServerSettings;
pub use crate::session::{SessionError, SessionEvent, SessionManager};
pub use crate::state::{StateStore, SystemMode};
