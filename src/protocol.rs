use crate::types::*;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form JSON object, key order preserved.
pub type Document = Map<String, Value>;

/// Body of `POST /tasks`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub session_id: SessionId,
    /// Free-form task kind, e.g. "cpu" or "fetch"
    #[serde(rename = "type", default)]
    pub task_type: String,
    /// Absent and `null` both decode to an empty object
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Document,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Document, D::Error> {
    Ok(Option::<Document>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reply to a successful `POST /tasks`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub ok: bool,
    pub task_id: TaskId,
}

/// Inner `task` object of a [`TaskEnvelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Document,
}

/// Frame pushed to exactly one agent: `{"type":"task","id":..,"task":{..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "task")]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub task: TaskSpec,
}

/// Server-originated messages fanned out to admin dashboards.
///
/// Agent telemetry is relayed as a raw [`Document`] instead, since the hub
/// does not know its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    SessionJoin {
        session_id: SessionId,
        app_id: AppId,
        ts: i64,
    },
    SessionLeave {
        session_id: SessionId,
        ts: i64,
    },
    TaskEnqueued {
        session_id: SessionId,
        task_id: TaskId,
        task_type: String,
        ts: i64,
    },
}

/// Single frame sent to a client that asked for an unknown role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorFrame {
    pub msg: String,
}

impl ErrorFrame {
    pub fn unknown_role() -> Self {
        Self {
            msg: "role must be admin or agent".to_string(),
        }
    }
}

/// Parse an agent frame and stamp it with its origin.
///
/// Returns `None` for anything that is not a JSON object. `sessionId` and
/// `appId` are only added when the agent did not set them itself.
pub fn enrich_agent_frame(raw: &[u8], session_id: &str, app_id: &str) -> Option<Document> {
    let mut doc: Document = serde_json::from_slice(raw).ok()?;
    doc.entry("sessionId")
        .or_insert_with(|| Value::String(session_id.to_string()));
    doc.entry("appId")
        .or_insert_with(|| Value::String(app_id.to_string()));
    Some(doc)
}
