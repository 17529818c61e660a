//! Websocket terminal multiplexing: one connection per client, any number
//! of terminals per connection.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use vm_terminal::{event_channel, ClientFrame, EventSender, TerminalEvent};

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/{client_id}", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    info!("Terminal client {} connected", client_id);
    let (mut sender, mut receiver) = socket.split();
    let (events, mut event_rx) = event_channel();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    handle_text(&recv_state, &recv_client, text.as_str(), &events).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let closed = state.terminals.disconnect_client(&client_id).await;
    info!(
        "Terminal client {} disconnected, {} terminal(s) closed",
        client_id, closed
    );
}

async fn handle_text(state: &AppState, client_id: &str, text: &str, events: &EventSender) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => handle_frame(state, client_id, frame, events).await,
        Err(e) => {
            debug!("Unreadable frame from {}: {}", client_id, e);
            report(events, None, format!("invalid message: {}", e)).await;
        }
    }
}

/// Act on one client frame. Failures are reported to the client as
/// `ssh_error` events.
pub async fn handle_frame(
    state: &AppState,
    client_id: &str,
    frame: ClientFrame,
    events: &EventSender,
) {
    match frame {
        ClientFrame::Connect { vm_id, username } => {
            if let Err(e) = state
                .terminals
                .connect(client_id, &vm_id, &username, events.clone())
                .await
            {
                warn!("Terminal to VM {} for {} failed: {}", vm_id, client_id, e);
                report(events, None, e.to_string()).await;
            }
        }
        ClientFrame::Input { terminal_id, input } => {
            if !owns(state, client_id, &terminal_id).await {
                let error = format!("Terminal not found: {}", terminal_id);
                report(events, Some(terminal_id), error).await;
                return;
            }
            if let Err(e) = state.terminals.write(&terminal_id, input.as_bytes()).await {
                report(events, Some(terminal_id), e.to_string()).await;
            }
        }
        ClientFrame::Disconnect { terminal_id } => {
            if !owns(state, client_id, &terminal_id).await {
                let error = format!("Terminal not found: {}", terminal_id);
                report(events, Some(terminal_id), error).await;
                return;
            }
            if let Err(e) = state.terminals.disconnect(&terminal_id).await {
                report(events, Some(terminal_id), e.to_string()).await;
            }
        }
    }
}

async fn report(events: &EventSender, terminal_id: Option<String>, error: String) {
    let _ = events.send(TerminalEvent::Error { terminal_id, error }).await;
}

async fn owns(state: &AppState, client_id: &str, terminal_id: &str) -> bool {
    state
        .terminals
        .get(terminal_id)
        .await
        .is_ok_and(|info| info.client_id == client_id)
}
