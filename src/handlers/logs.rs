use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tracing::{debug, warn};

use crate::middleware::Caller;
use crate::state::AppState;
use crate::tracker::LogTracker;

/// GET /logs - log stream websocket
///
/// Text frames sent by the client are published to every listener; lines
/// published by anyone are forwarded to the client until either side
/// closes or the server shuts down.
pub async fn websocket(
    State(state): State<AppState>,
    caller: Caller,
    ws: WebSocketUpgrade,
) -> Response {
    let tracker = state.tracker.clone();
    let user = caller.token.user_name().to_string();
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, tracker, user).await;
    })
}

async fn handle_socket(mut socket: WebSocket, tracker: LogTracker, user: String) {
    let Some(mut listener) = tracker.add() else {
        debug!("log tracker closed, refusing listener for {}", user);
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    debug!("log listener {} opened by {}", listener.id, user);

    loop {
        tokio::select! {
            line = listener.rx.recv() => match line {
                Some(line) => {
                    if socket.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    for line in text.lines().filter(|l| !l.is_empty()) {
                        tracker.publish(line);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("log websocket for {} failed: {}", user, e);
                    break;
                }
            },
        }
    }
    tracker.remove(listener.id);
}
