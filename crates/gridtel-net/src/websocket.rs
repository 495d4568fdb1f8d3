//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Live reading feed over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use gridtel_core::SubscriberRegistry;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::rest::RouterState;

pub(crate) async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RouterState>>,
) -> axum::response::Response {
    let registry = state.context.coordinator.registry().clone();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| client_loop(socket, registry, shutdown))
}

/// Forward every broadcast reading to the socket until either side goes away.
/// Inbound frames only keep the connection alive.
async fn client_loop(
    mut socket: WebSocket,
    registry: SubscriberRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscription = registry.register();
    let subscriber = subscription.id();
    info!(subscriber, active = registry.len(), "websocket client connected");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else {
                    debug!(subscriber, "subscriber removed by registry");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(inbound)) = inbound else {
                    break;
                };
                match inbound {
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Text(_) | Message::Binary(_) | Message::Pong(_) => {}
                }
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    drop(subscription);
    info!(subscriber, active = registry.len(), "websocket client disconnected");
}
