//! Task dispatch to a single agent.
//!
//! There is no queue: a task is either written into the target agent's
//! outbound buffer right away or reported as undelivered.

use crate::hub::{Hub, Outbound};
use crate::protocol::{Document, Notification, TaskEnvelope, TaskSpec};
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on waiting for room in a slow agent's buffer
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("sessionId/type required")]
    Validation,

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("send failed: {0}")]
    Delivery(String),
}

/// Build a task id from the wall clock.
///
/// Two tasks created within the same nanosecond collide; acceptable at the
/// request rates this service sees.
pub fn new_task_id() -> TaskId {
    format!("t-{}", now_nanos())
}

pub struct TaskDispatcher {
    hub: Arc<Hub>,
    send_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(hub: Arc<Hub>, send_timeout: Duration) -> Self {
        Self { hub, send_timeout }
    }

    /// Push a task to the agent registered under `session_id` and tell the
    /// admins about it. Returns the generated task id.
    pub async fn enqueue_task(
        &self,
        session_id: &str,
        task_type: &str,
        payload: Document,
    ) -> Result<TaskId, DispatchError> {
        if session_id.is_empty() || task_type.is_empty() {
            return Err(DispatchError::Validation);
        }

        let agent = self
            .hub
            .lookup_agent(session_id)
            .await
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.to_string()))?;

        let task_id = new_task_id();
        let envelope = TaskEnvelope {
            id: task_id.clone(),
            task: TaskSpec {
                task_type: task_type.to_string(),
                payload,
            },
        };
        let frame = serde_json::to_string(&envelope)
            .map_err(|e| DispatchError::Delivery(format!("encode task: {}", e)))?;

        match tokio::time::timeout(self.send_timeout, agent.conn.send(Outbound::Text(frame))).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(session_id, task_id = %task_id, "Task delivery failed: {}", e);
                return Err(DispatchError::Delivery(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(session_id, task_id = %task_id, "Task delivery timed out");
                return Err(DispatchError::Delivery(format!(
                    "agent did not accept task within {:?}",
                    self.send_timeout
                )));
            }
        }

        tracing::info!(session_id, task_id = %task_id, task_type, "Task enqueued");

        self.hub
            .broadcast(&Notification::TaskEnqueued {
                session_id: session_id.to_string(),
                task_id: task_id.clone(),
                task_type: task_type.to_string(),
                ts: now_millis(),
            })
            .await;

        Ok(task_id)
    }
}
