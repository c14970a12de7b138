use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type SessionId = String;
pub type AppId = String;
pub type TaskId = String;
pub type ConnId = ulid::Ulid;

/// Role a WebSocket client picks at upgrade time via `?role=`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Agent,
}

impl Role {
    /// Parse the `role` query parameter. Anything other than the two known
    /// roles is rejected.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            Some("admin") => Some(Role::Admin),
            Some("agent") => Some(Role::Agent),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch, used for the `ts` field of notifications
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Nanoseconds since the Unix epoch.
///
/// Used for generated session and task ids. Two calls within the same
/// nanosecond yield the same value, so ids derived from it are unique only
/// in practice, not by construction.
pub fn now_nanos() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Session id handed to agents that connect without `?session=`
pub fn generated_session_id() -> SessionId {
    format!("unknown-{}", now_nanos())
}
