//! System-wide constants for the kinetic workspace.
//!
//! Single source of truth for numeric limits, default timings and default
//! paths. Imported by all crates.

/// Number of motors driven by the installation.
pub const MOTOR_COUNT: usize = 4;

// ─── Safety limits (RPM) ────────────────────────────────────────────

/// Default canvas rotation limit.
pub const DEFAULT_CANVAS_MAX_RPM: f64 = 120.0;
/// Default pen-brush limit.
pub const DEFAULT_PEN_BRUSH_MAX_RPM: f64 = 80.0;
/// Default pen-color-depth limit.
pub const DEFAULT_PEN_COLOR_DEPTH_MAX_RPM: f64 = 60.0;
/// Default pen-elevation limit.
pub const DEFAULT_PEN_ELEVATION_MAX_RPM: f64 = 90.0;
/// Velocity commanded on emergency stop.
pub const EMERGENCY_STOP_RPM: f64 = 0.0;
/// Absolute ceiling accepted on the wire, regardless of configured limits.
pub const ABSOLUTE_MAX_RPM: f64 = 200.0;
/// Fraction subtracted from a hard limit on the generator side.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.10;

// ─── Thermal & run-time thresholds ──────────────────────────────────

/// Temperature above which a motor is reported as overheating [°C].
pub const OVERHEAT_WARNING_C: f64 = 70.0;
/// Temperature above which commands are vetoed [°C].
pub const MAX_MOTOR_TEMPERATURE_C: f64 = 85.0;
/// Plausible temperature sensor range [°C].
pub const TEMPERATURE_RANGE_C: (f64, f64) = (-40.0, 100.0);
/// Continuous run time raising a WARNING [s].
pub const RUNTIME_WARNING_SECS: f64 = 60.0 * 60.0;
/// Continuous run time raising a CRITICAL alert and emergency stop [s].
pub const RUNTIME_CRITICAL_SECS: f64 = 2.0 * 60.0 * 60.0;
/// Pen-elevation speed above which a fast canvas is considered a conflict.
pub const CONFLICT_PEN_ELEVATION_RPM: f64 = 20.0;
/// Canvas speed above which a fast pen-elevation is considered a conflict.
pub const CONFLICT_CANVAS_RPM: f64 = 25.0;
/// Relative tolerance used by `MotorState::is_at_target`.
pub const AT_TARGET_TOLERANCE: f64 = 0.05;

// ─── Command sets ───────────────────────────────────────────────────

/// Default duration a command set is held [s].
pub const DEFAULT_COMMAND_DURATION_SECS: f64 = 3.4;
/// Accepted command duration range [s].
pub const COMMAND_DURATION_RANGE_SECS: (f64, f64) = (0.1, 60.0);

// ─── Device link ────────────────────────────────────────────────────

/// Default device host.
pub const DEFAULT_DEVICE_HOST: &str = "127.0.0.1";
/// Default device TCP port.
pub const DEFAULT_DEVICE_PORT: u16 = 8888;
/// Device connect timeout [s].
pub const DEVICE_CONNECT_TIMEOUT_SECS: f64 = 5.0;
/// Per-line device write timeout [s].
pub const DEVICE_IO_TIMEOUT_SECS: f64 = 1.0;
/// Heartbeat period [s].
pub const HEARTBEAT_INTERVAL_SECS: f64 = 10.0;
/// Heartbeat retry delay after a failure [s].
pub const HEARTBEAT_RETRY_SECS: f64 = 5.0;
/// Monitoring loop period [s].
pub const MONITOR_INTERVAL_SECS: f64 = 5.0;

// ─── Control loop ───────────────────────────────────────────────────

/// Target time between control cycles [s].
pub const DEFAULT_CYCLE_INTERVAL_SECS: f64 = 3.4;
/// Consecutive failed cycles before the loop halts.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Safety violations before the loop escalates to an emergency stop.
pub const EMERGENCY_STOP_THRESHOLD: u32 = 3;
/// Sleep after an unexpected cycle failure [s].
pub const CYCLE_RETRY_DELAY_SECS: f64 = 2.0;
/// Health-check period [s].
pub const HEALTH_CHECK_INTERVAL_SECS: f64 = 30.0;
/// Recent cycle errors kept for diagnostics.
pub const RECENT_ERROR_CAPACITY: usize = 50;

// ─── Sessions ───────────────────────────────────────────────────────

/// Default session snapshot directory.
pub const DEFAULT_SESSION_DIR: &str = "./sessions";
/// Sessions allowed outside COMPLETED/FAILED at once.
pub const MAX_CONCURRENT_SESSIONS: usize = 1;
/// Autosave period [s].
pub const SESSION_AUTOSAVE_SECS: f64 = 5.0 * 60.0;
/// Cleanup sweep period [s].
pub const SESSION_CLEANUP_SECS: f64 = 60.0 * 60.0;
/// Retention of completed sessions [h].
pub const SESSION_RETENTION_HOURS: i64 = 48;

// ─── Client hub ─────────────────────────────────────────────────────

/// Default hub listen address.
pub const DEFAULT_HUB_HOST: &str = "0.0.0.0";
/// Default hub port.
pub const DEFAULT_HUB_PORT: u16 = 8768;
/// Liveness ping period [s].
pub const HUB_PING_INTERVAL_SECS: f64 = 30.0;
/// Pong deadline after a ping [s].
pub const HUB_PING_TIMEOUT_SECS: f64 = 10.0;
/// Largest inbound client message [bytes].
pub const HUB_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// Default directory for mode/motor-state snapshots and recordings.
pub const DEFAULT_STATE_DIR: &str = "./state";
/// Environment variable carrying the shared secret.
pub const API_KEY_ENV: &str = "KINETIC_API_KEY";
