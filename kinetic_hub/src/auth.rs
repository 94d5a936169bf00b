//! Shared-secret authentication and per-client access levels.
//!
//! | Secret configured | Request                      | Outcome                |
//! |-------------------|------------------------------|------------------------|
//! | no                | any                          | demo, every permission |
//! | yes               | `client_type == "visitor"`   | demo                   |
//! | yes               | matching `api_key`           | full                   |
//! | yes               | anything else                | rejected               |

use bitflags::bitflags;

bitflags! {
    /// Permissions of one hub client.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// Status queries, session membership, ping.
        const OBSERVE        = 0x01;
        /// Drive motors, change mode, record.
        const MOTORS         = 0x02;
        /// Trigger the emergency stop.
        const EMERGENCY_STOP = 0x04;
        /// Create, start, stop, pause and resume sessions.
        const SESSIONS       = 0x08;
        /// Release the emergency stop and resolve alerts.
        const SAFETY         = 0x10;
    }
}

impl Access {
    /// Visitor level when a secret is configured.
    pub const DEMO: Self = Self::OBSERVE
        .union(Self::MOTORS)
        .union(Self::EMERGENCY_STOP);
}

/// Client type assumed when the client does not name one.
pub const DEFAULT_CLIENT_TYPE: &str = "web_ui";

const VISITOR: &str = "visitor";

/// Result of an `authenticate` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Demo { reason: &'static str },
    Full,
    Rejected,
}

impl AuthOutcome {
    /// Whether the client got API access.
    pub fn api_access(self) -> bool {
        matches!(self, Self::Full)
    }

    pub fn message(self) -> String {
        match self {
            Self::Demo { reason } => format!("Demo mode - {reason}"),
            Self::Full => "Full access - blockchain API enabled".to_string(),
            Self::Rejected => "Invalid API key - access denied".to_string(),
        }
    }
}

/// Checks API keys against the configured secret.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    api_key: Option<String>,
}

impl Authenticator {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn requires_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Access of a client that has not authenticated.
    pub fn initial_access(&self) -> Access {
        if self.requires_key() {
            Access::OBSERVE
        } else {
            Access::all()
        }
    }

    pub fn authenticate(&self, client_type: Option<&str>, api_key: Option<&str>) -> AuthOutcome {
        let Some(required) = &self.api_key else {
            return AuthOutcome::Demo {
                reason: "No API key configured",
            };
        };
        if client_type == Some(VISITOR) {
            return AuthOutcome::Demo {
                reason: "Visitor mode",
            };
        }
        match api_key {
            Some(key) if key == required => AuthOutcome::Full,
            _ => AuthOutcome::Rejected,
        }
    }

    /// Access granted for `outcome`. `None` when rejected.
    pub fn access_for(&self, outcome: AuthOutcome) -> Option<Access> {
        match outcome {
            AuthOutcome::Full => Some(Access::all()),
            AuthOutcome::Demo { .. } if !self.requires_key() => Some(Access::all()),
            AuthOutcome::Demo { .. } => Some(Access::DEMO),
            AuthOutcome::Rejected => None,
        }
    }
}
