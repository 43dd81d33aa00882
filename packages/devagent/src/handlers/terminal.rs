//! Interactive terminal bridge: WebSocket <-> pseudo-terminal running an
//! attach into a multiplexer session.
//!
//! Binary frames are raw bytes in both directions. Text frames from the
//! client are control messages; the only one is
//! `{"type":"resize","cols":N,"rows":N}`. Anything else is dropped, never
//! typed into the session.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use pty_bridge::{PtyActor, PtyConfig};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::runtime::Container;

use super::extract::ValidPath;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// Parse a text frame. `None` means drop it.
pub fn parse_control(text: &str) -> Option<ControlMessage> {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Resize { cols, rows }) if cols > 0 && rows > 0 => {
            Some(ControlMessage::Resize { cols, rows })
        }
        _ => None,
    }
}

/// Validation runs as plain HTTP first so a missing container or session
/// is an ordinary 404/400, not a failed upgrade.
pub async fn terminal_handler(
    State(state): State<AppState>,
    ValidPath((id, name)): ValidPath<(String, String)>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let container = match state.fleet.session(&id, &name).await {
        Ok((container, _)) => container,
        Err(e) => return e.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    ws.on_upgrade(move |socket| bridge(socket, state, container, name))
}

async fn bridge(socket: WebSocket, state: AppState, container: Container, session: String) {
    let (command, args) = state
        .fleet
        .multiplexer()
        .attach_command(&container, &session);
    let config = PtyConfig {
        command,
        args,
        env: vec![("TERM".into(), "xterm-256color".into())],
        ..Default::default()
    };
    let (pty, mut output) = match PtyActor::spawn(config) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Failed to spawn terminal for {}/{}: {}", container.name, session, e);
            state.metrics.pty_error();
            return;
        }
    };
    state.metrics.bridge_opened();
    info!(container = %container.name, session = %session, "terminal bridge opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let metrics = state.metrics.clone();
    let output_task = async move {
        while let Some(chunk) = output.recv().await {
            metrics.bridge_bytes(chunk.len());
            if ws_sender.send(Message::Binary(chunk.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    };

    let input_pty = pty.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if let Err(e) = input_pty.write(&data).await {
                        error!("Failed to write to PTY: {}", e);
                        break;
                    }
                }
                Ok(Message::Text(text)) => match parse_control(text.as_str()) {
                    Some(ControlMessage::Resize { cols, rows }) => {
                        if let Err(e) = input_pty.resize(rows, cols).await {
                            warn!("Failed to resize PTY: {}", e);
                        }
                    }
                    None => debug!("Dropping unrecognized control frame"),
                },
                Ok(Message::Close(_)) => {
                    debug!("Client closed terminal");
                    break;
                }
                Err(e) => {
                    debug!("WebSocket error from client: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = output_task => debug!("Terminal output ended"),
        _ = input_task => debug!("Terminal input ended"),
    }

    // closing the pty fd does not end the attached process
    if let Err(e) = pty.kill().await {
        warn!("Failed to kill terminal process: {}", e);
    }
    state.metrics.bridge_closed();
    info!(container = %container.name, session = %session, "terminal bridge closed");
}
