//! Admin dashboards only listen. Their read loop exists to notice the
//! disconnect and take the dashboard out of the broadcast set.

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};

use crate::hub::{ConnectionHandle, Hub};

pub async fn run<S>(hub: &Hub, conn: ConnectionHandle, mut frames: S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let id = conn.id();
    let total = hub.register_admin(conn).await;
    tracing::info!(admin = %id, "admin connected ({} total)", total);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(admin = %id, "admin read error: {}", e);
                break;
            }
        }
    }

    let total = hub.unregister_admin(id).await;
    tracing::info!(admin = %id, "admin disconnected ({} total)", total);
}
