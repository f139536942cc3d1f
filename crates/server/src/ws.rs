use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use runtime::{RunEvent, RunRequest};
use shared::protocol::ClientMessage;
use tracing::{info, warn};

use crate::{session::Session, AppState};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (session, mut events) = Session::start(&state.ctx, state.script.clone());
    info!(session_id = %session.id, "client connected");

    let (mut sender, mut receiver) = socket.split();

    let status = match serde_json::to_string(&session.status_message()) {
        Ok(text) => text,
        Err(error) => {
            warn!(session_id = %session.id, %error, "failed to encode session status");
            session.close(&state.ctx).await;
            return;
        }
    };
    if sender.send(Message::Text(status)).await.is_err() {
        session.close(&state.ctx).await;
        return;
    }

    // First render happens before any interaction arrives.
    if let Err(error) = session.controller.request_rerun(RunRequest::default()) {
        warn!(session_id = %session.id, %error, "initial run rejected");
    }

    let mut flush_interval = tokio::time::interval(Duration::from_millis(
        state.ctx.settings.flush_interval_ms.max(1),
    ));

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &session, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(session_id = %session.id, %error, "websocket receive failed");
                    break;
                }
            },
            _ = flush_interval.tick() => {
                if flush_to_client(&state, &session, &mut sender).await.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(RunEvent::RunFinished { run_count, .. }) => {
                    if flush_to_client(&state, &session, &mut sender).await.is_err() {
                        break;
                    }
                    state
                        .ctx
                        .message_cache
                        .remove_expired_entries(session.id, run_count);
                }
                Some(RunEvent::RunStarted { .. }) => {}
                None => break,
            },
        }
    }

    session.close(&state.ctx).await;
    info!(session_id = %session.id, "client disconnected");
}

fn handle_frame(state: &AppState, session: &Session, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => session.handle_client_message(&state.ctx, message),
        Err(error) => {
            // Malformed frames are dropped, never fatal to the session.
            warn!(session_id = %session.id, %error, "ignoring malformed client frame");
        }
    }
}

async fn flush_to_client(
    state: &AppState,
    session: &Session,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    for message in session.flush_outgoing(&state.ctx) {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(error) => {
                warn!(session_id = %session.id, %error, "failed to encode outgoing message");
                continue;
            }
        };
        sender.send(Message::Text(text)).await?;
    }
    Ok(())
}
