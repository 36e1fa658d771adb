//! WebSocket streaming endpoint: one binary pose frame per message.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tracing::{debug, info};

use crate::session::Session;

use super::AppState;

/// Close code sent when the requested session does not exist.
const CLOSE_UNKNOWN_SESSION: u16 = 4000;

pub async fn subscribe(
  ws: WebSocketUpgrade,
  Path(session_id): Path<String>,
  State(state): State<AppState>,
) -> impl IntoResponse {
  let session = state.registry.get(&session_id).await;
  ws.on_upgrade(move |socket| stream_frames(socket, session_id, session))
}

async fn stream_frames(mut socket: WebSocket, session_id: String, session: Option<Arc<Session>>) {
  let Some(session) = session else {
    debug!(event = "ws_unknown_session", session_id = %session_id);
    let _ = socket
      .send(Message::Close(Some(CloseFrame {
        code: CLOSE_UNKNOWN_SESSION,
        reason: "session does not exist".into(),
      })))
      .await;
    return;
  };

  let subscriber = match session.attach() {
    Ok(subscriber) => subscriber,
    Err(_) => {
      let _ = socket
        .send(Message::Close(Some(CloseFrame {
          code: CLOSE_UNKNOWN_SESSION,
          reason: "session is not streaming".into(),
        })))
        .await;
      return;
    }
  };
  info!(event = "ws_subscribed", session_id = %session_id, subscriber = subscriber.id);

  let id = subscriber.id;
  let mut frames = subscriber.frames;
  loop {
    tokio::select! {
      frame = frames.recv() => match frame {
        Some(payload) => {
          if socket.send(Message::Binary(payload.to_vec())).await.is_err() {
            break;
          }
        }
        // Session stopped; say goodbye.
        None => {
          let _ = socket.send(Message::Close(None)).await;
          break;
        }
      },
      incoming = socket.recv() => match incoming {
        // Client messages are keep-alives only; drain and ignore.
        Some(Ok(_)) => {}
        Some(Err(_)) | None => break,
      },
    }
  }

  session.detach(id);
  info!(event = "ws_unsubscribed", session_id = %session_id, subscriber = id);
}
