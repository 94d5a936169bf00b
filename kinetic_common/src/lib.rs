//! Kinetic Common Library
//!
//! Shared vocabulary for the kinetic workspace: the motor model, safety
//! alerts and violations, sessions, the device wire protocol and TOML
//! configuration loading.
//!
//! # Module Structure
//!
//! - [`consts`] - Limits, default timings and paths
//! - [`config`] - Configuration loading traits and the installation config tree
//! - [`motor`] - Motor names, commands, command sets and device-side state
//! - [`safety`] - Alert levels, violation kinds and `SafetyViolation`
//! - [`session`] - Session modes, statuses and lifecycle
//! - [`wire`] - Newline-delimited JSON device protocol
//! - [`prelude`] - Common re-exports for convenience

pub mod config;
pub mod consts;
pub mod motor;
pub mod prelude;
pub mod safety;
pub mod session;
pub mod wire;
