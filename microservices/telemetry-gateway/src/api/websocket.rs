//! WebSocket handler for live telemetry
//!
//! Each socket is one hub connection. A writer task drains the hub's push
//! channel and the reader's replies into the sink; the reader handles
//! subscribe/unsubscribe/ping. Whichever side ends first tears the socket down,
//! and the hub registration is always removed when the handler returns.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meterline_core::{ConnectionId, DeviceId, TimestampMs};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::hub::{BroadcastHub, EventReceiver, SubscriptionHandle};
use crate::query::LatestTelemetry;

const REPLY_BUFFER: usize = 32;

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Removes the hub registration however the socket ends
struct DisconnectGuard {
    hub: Arc<BroadcastHub>,
    connection_id: ConnectionId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let removed = self.hub.on_disconnect(&self.connection_id);
        info!(connection_id = %self.connection_id, subscriptions = removed, "WebSocket disconnected");
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::generate();

    let events = match state.hub.connect(connection_id.clone()) {
        Ok(events) => events,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Rejecting WebSocket connection");
            let _ = send_json(&mut socket, &ServerMessage::Error { message: e.to_string() }).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let _guard = DisconnectGuard {
        hub: Arc::clone(&state.hub),
        connection_id: connection_id.clone(),
    };
    info!(connection_id = %connection_id, "WebSocket connected");

    let (sink, mut stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER);
    let mut writer = tokio::spawn(write_loop(sink, events, reply_rx));

    let _ = reply_tx
        .send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
        })
        .await;

    let mut subscriptions: HashMap<DeviceId, SubscriptionHandle> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_text(&state, &connection_id, &mut subscriptions, text.as_str());
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    writer.abort();
}

/// Forward replies and hub pushes to the client until either source closes
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: EventReceiver,
    mut replies: mpsc::Receiver<ServerMessage>,
) {
    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => ServerMessage::Telemetry {
                    device_id: event.device_id.clone(),
                    timestamp: event.timestamp,
                    values: event.values.clone(),
                },
                // Hub dropped this connection or is shutting down
                None => break,
            },
        };

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode WebSocket message");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

fn handle_client_text(
    state: &AppState,
    connection_id: &ConnectionId,
    subscriptions: &mut HashMap<DeviceId, SubscriptionHandle>,
    text: &str,
) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            }
        }
    };

    match message {
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::Subscribe(target) => {
            let Some(device_id) = target.device_id() else {
                return missing_device_id();
            };
            if let Err(e) = state.query.get_device(&device_id) {
                return ServerMessage::Error { message: e.to_string() };
            }

            match state.hub.subscribe(connection_id, &device_id) {
                Ok(handle) => {
                    subscriptions.insert(device_id.clone(), handle);
                    info!(connection_id = %connection_id, device_id = %device_id, "Client subscribed");
                    ServerMessage::Subscribed {
                        latest: state.query.get_latest(&device_id).ok(),
                        device_id,
                    }
                }
                Err(e) => ServerMessage::Error { message: e.to_string() },
            }
        }
        ClientMessage::Unsubscribe(target) => {
            let Some(device_id) = target.device_id() else {
                return missing_device_id();
            };
            if let Some(handle) = subscriptions.remove(&device_id) {
                state.hub.unsubscribe(&handle);
                info!(connection_id = %connection_id, device_id = %device_id, "Client unsubscribed");
            }
            ServerMessage::Unsubscribed { device_id }
        }
    }
}

fn missing_device_id() -> ServerMessage {
    ServerMessage::Error {
        message: "deviceId is required".to_string(),
    }
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(_) => Ok(()),
    }
}

/// Server-to-client WebSocket messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    Subscribed {
        device_id: DeviceId,
        latest: Option<LatestTelemetry>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { device_id: DeviceId },
    #[serde(rename_all = "camelCase")]
    Telemetry {
        device_id: DeviceId,
        timestamp: TimestampMs,
        values: BTreeMap<String, f64>,
    },
    Pong,
    Error { message: String },
}

/// Client-to-server WebSocket messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(DeviceTarget),
    Unsubscribe(DeviceTarget),
    Ping,
}

/// Device selector; accepts `{deviceId}` or `{payload: {deviceId}}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTarget {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    payload: Option<TargetPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetPayload {
    #[serde(default)]
    device_id: Option<String>,
}

impl DeviceTarget {
    fn device_id(self) -> Option<DeviceId> {
        self.device_id
            .or_else(|| self.payload.and_then(|p| p.device_id))
            .filter(|id| !id.is_empty())
            .map(DeviceId::new)
    }
}
