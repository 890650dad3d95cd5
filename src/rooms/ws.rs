use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tower_sessions::Session;

use crate::{
    error::ChatError,
    hub::{Connection, Hub},
    identity::Identity,
    protocol::ClientEvent,
    session::CurrentIdentity,
};

/// Upgrades a signed-in session to the room event channel. Identity comes
/// from the session; frames can never change who the connection is. Signing
/// the session out ends the socket.
#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(hub): State<Hub>,
    CurrentIdentity(identity): CurrentIdentity,
    session: Session,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let scope = session.id().map(|id| id.to_string());
    ws.on_upgrade(move |socket| serve_connection(hub, identity, scope, socket))
}

async fn serve_connection(hub: Hub, identity: Identity, scope: Option<String>, socket: WebSocket) {
    let (conn, mut rx) = match scope {
        Some(scope) => hub.connect_in_scope(identity, scope).await,
        None => hub.connect(identity),
    };
    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "could not encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            _ = conn.signed_out() => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&conn, text.as_str()).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    conn.close().await;
    writer.abort();
}

async fn handle_frame(conn: &Connection, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            conn.reply_error(&ChatError::validation(format!("malformed frame: {err}")));
            return;
        }
    };

    if let Err(err) = conn.handle(event).await {
        tracing::debug!(connection = %conn.id(), code = err.code(), error = %err, "event refused");
        conn.reply_error(&err);
    }
}
