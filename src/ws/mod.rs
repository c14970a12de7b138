pub mod admin;
pub mod agent;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt, Sink};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::hub::{ConnectionHandle, Outbound, OUTBOUND_BUFFER};
use crate::protocol::ErrorFrame;
use crate::state::AppState;
use crate::types::{generated_session_id, Role};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub role: Option<String>,
    pub session: Option<String>,
    #[serde(rename = "appId")]
    pub app_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!(
        "WebSocket connection request: role={:?}, session={:?}, appId={:?}",
        params.role,
        params.session,
        params.app_id
    );

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let Some(role) = Role::parse(params.role.as_deref()) else {
        reject_unknown_role(socket).await;
        return;
    };

    let (sender, receiver) = socket.split();
    let (conn, outbound) = ConnectionHandle::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_outbound(sender, outbound));

    match role {
        Role::Admin => admin::run(&state.hub, conn, receiver).await,
        Role::Agent => {
            let session_id = params
                .session
                .filter(|s| !s.is_empty())
                .unwrap_or_else(generated_session_id);
            let app_id = params.app_id.unwrap_or_default();
            agent::run(&state.hub, session_id, app_id, conn, receiver).await
        }
    }

    writer.abort();
    tracing::info!("WebSocket connection closed for role: {:?}", role);
}

/// Send the error frame and close. The connection is never registered.
async fn reject_unknown_role(mut socket: WebSocket) {
    tracing::warn!("Rejecting WebSocket with unknown role");
    if let Ok(json) = serde_json::to_string(&ErrorFrame::unknown_role()) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Drain a connection's outbound buffer into its socket.
///
/// Ends when the socket rejects a write or once every handle to the buffer
/// is gone.
pub async fn write_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let msg = match frame {
            Outbound::Text(text) => Message::Text(text.into()),
        };
        if sink.send(msg).await.is_err() {
            tracing::debug!("WebSocket write failed, stopping writer");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_stops_when_socket_rejects_writes() {
        let (conn, outbound) = ConnectionHandle::channel(8);
        let (sink, written) = futures::channel::mpsc::unbounded::<Message>();
        drop(written);

        conn.try_send(Outbound::Text("lost".into())).unwrap();
        // Returns even though `conn` is still alive
        write_outbound(sink, outbound).await;
        assert!(conn.try_send(Outbound::Text("after".into())).is_err());
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let (conn, outbound) = ConnectionHandle::channel(8);
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();

        conn.try_send(Outbound::Text("only".into())).unwrap();
        drop(conn);

        write_outbound(sink, outbound).await;

        assert_eq!(written.next().await, Some(Message::Text("only".into())));
        assert_eq!(written.next().await, None);
    }
}
