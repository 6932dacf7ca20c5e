//! Manages the WebSocket connection lifecycle for one call.

use super::{connection::Session, registry::ConnectionRegistry, turn::TurnController};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_BUFFER: usize = 256;

/// Axum handler for both the health check and the WebSocket upgrade.
///
/// A plain GET (no upgrade headers) gets `200 OK` and never touches session
/// state.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => {
            let call_label = call_label_from_path(uri.path());
            ws.on_upgrade(move |socket| handle_socket(socket, state, call_label))
        }
        Err(_) => (StatusCode::OK, "OK").into_response(),
    }
}

/// The last non-empty path segment, or `"-"` for the root.
fn call_label_from_path(path: &str) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("-")
        .to_string()
}

/// Runs one connection from upgrade to teardown.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, call_label: String) {
    let (socket_tx, socket_rx) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = Arc::new(Session::new(call_label, tx));

    let span = info_span!("ws_session", session_id = %session.id, call = %session.call_label);
    async move {
        info!(open_sessions = state.registry.len() + 1, "WebSocket connection opened.");
        let writer = tokio::spawn(write_loop(session.clone(), socket_tx, rx).in_current_span());

        let mut controller = TurnController::new(
            session.clone(),
            state.llm_client.clone(),
            state.prompts.clone(),
            state.turn_settings.clone(),
        );
        if open_and_register(&controller, &state.registry, &session).await {
            read_loop(&session, &mut controller, socket_rx).await;
        } else {
            warn!("Failed to send config frame.");
        }

        session.close();
        controller.shutdown();
        state.registry.remove(&session.id);
        if let Err(e) = writer.await {
            warn!(error = %e, "Writer task ended abnormally.");
        }
        info!(open_sessions = state.registry.len(), "WebSocket connection closed.");
    }
    .instrument(span)
    .await
}

/// Queues the config frame, then registers the session. Heartbeat probes
/// only reach registered sessions, so none can precede the config frame.
async fn open_and_register(
    controller: &TurnController,
    registry: &ConnectionRegistry,
    session: &Arc<Session>,
) -> bool {
    if !controller.open().await {
        return false;
    }
    registry.insert(session.clone());
    true
}

/// Feeds inbound frames to the controller until the peer leaves or the
/// session is closed from elsewhere (eviction).
async fn read_loop(
    session: &Session,
    controller: &mut TurnController,
    mut socket_rx: SplitStream<WebSocket>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = session.closed() => {
                debug!("Session closed; leaving read loop.");
                return;
            }
            frame = socket_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => controller.handle_text(text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => controller.handle_binary(&bytes).await,
            // Axum answers transport pings itself; both directions count as liveness.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => session.mark_alive(),
            Some(Ok(Message::Close(reason))) => {
                debug!(?reason, "Peer sent close frame.");
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket receive error.");
                return;
            }
            None => {
                debug!("Peer disconnected.");
                return;
            }
        }
    }
}

/// Owns the socket sink. Drains queued frames until the session closes, then
/// sends a close frame.
async fn write_loop(
    session: Arc<Session>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    loop {
        tokio::select! {
            biased;
            () = session.closed() => break,
            next = rx.recv() => match next {
                Some(frame) => {
                    if let Err(e) = socket_tx.send(frame).await {
                        debug!(error = %e, "Socket write failed; closing session.");
                        session.close();
                        return;
                    }
                }
                None => break,
            },
        }
    }
    let _ = socket_tx.send(Message::Close(None)).await;
    let _ = socket_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{liveness::LivenessSupervisor, turn::TurnSettings};
    use serenity_core::{
        chunker::ChunkerConfig, llm_client::ScriptedLLMClient, prompt::PromptComposer,
    };
    use std::time::Duration;

    fn controller_for(session: &Arc<Session>) -> TurnController {
        TurnController::new(
            session.clone(),
            Arc::new(ScriptedLLMClient::echo()),
            Arc::new(PromptComposer::new("Serenity")),
            TurnSettings {
                chunker: ChunkerConfig::default(),
                greeting_enabled: true,
            },
        )
    }

    #[tokio::test]
    async fn config_frame_precedes_first_heartbeat_probe() {
        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor = LivenessSupervisor::new(registry.clone(), Duration::from_secs(10), 2);
        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(Session::new("call_1", tx));
        let controller = controller_for(&session);

        // A sweep before registration cannot reach the session.
        assert_eq!(supervisor.sweep().probed, 0);
        assert!(open_and_register(&controller, &registry, &session).await);
        assert_eq!(registry.len(), 1);
        assert_eq!(supervisor.sweep().probed, 1);

        match rx.recv().await.unwrap() {
            Message::Text(text) => assert!(text.as_str().contains("\"response_type\":\"config\"")),
            other => panic!("expected config frame first, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Message::Ping(_)));
    }

    #[tokio::test]
    async fn failed_open_leaves_session_unregistered() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let session = Arc::new(Session::new("call_1", tx));
        session.close();
        let controller = controller_for(&session);

        assert!(!open_and_register(&controller, &registry, &session).await);
        assert!(registry.is_empty());
    }

    #[test]
    fn call_label_is_last_segment() {
        assert_eq!(call_label_from_path("/llm-websocket/call_123"), "call_123");
        assert_eq!(call_label_from_path("/llm-websocket/call_123/"), "call_123");
        assert_eq!(call_label_from_path("/"), "-");
    }
}
