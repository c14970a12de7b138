//! Agent read loop: announce the session, relay every JSON object the agent
//! sends to the admins, announce the departure.

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};

use crate::hub::{ConnectionHandle, Hub};
use crate::protocol::{enrich_agent_frame, Notification};
use crate::types::*;

pub async fn run<S>(
    hub: &Hub,
    session_id: SessionId,
    app_id: AppId,
    conn: ConnectionHandle,
    mut frames: S,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let conn_id = conn.id();
    if hub
        .register_agent(session_id.clone(), app_id.clone(), conn)
        .await
        .is_some()
    {
        tracing::info!(session_id = %session_id, "agent replaced an existing connection");
    }
    tracing::info!(
        session_id = %session_id,
        app_id = %app_id,
        "agent connected (total {})",
        hub.agent_count().await
    );

    hub.broadcast(&Notification::SessionJoin {
        session_id: session_id.clone(),
        app_id: app_id.clone(),
        ts: now_millis(),
    })
    .await;

    while let Some(frame) = frames.next().await {
        let raw: &[u8] = match &frame {
            Ok(Message::Text(text)) => text.as_str().as_bytes(),
            Ok(Message::Binary(data)) => &data[..],
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(session_id = %session_id, "agent read error: {}", e);
                break;
            }
        };

        match enrich_agent_frame(raw, &session_id, &app_id) {
            Some(doc) => {
                let delivered = hub.broadcast(&doc).await;
                tracing::debug!(session_id = %session_id, delivered, "Relayed agent frame");
            }
            None => tracing::debug!(
                session_id = %session_id,
                "Dropped agent frame that is not a JSON object"
            ),
        }
    }

    if hub.unregister_agent(&session_id, conn_id).await {
        tracing::info!(session_id = %session_id, "agent disconnected");
        hub.broadcast(&Notification::SessionLeave {
            session_id: session_id.clone(),
            ts: now_millis(),
        })
        .await;
    } else {
        // The session now belongs to a newer connection and is still live
        tracing::info!(session_id = %session_id, "replaced agent connection closed");
    }
}
