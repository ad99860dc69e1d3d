//! # WebSocket Module
//!
//! This module provides the notification channel of the operator.
//!
//! ## Features
//!
//! - Operator events pushed to every client (countdown, deals, quorum)
//! - Deposit submission with a synchronous result
//! - Fillable deposit and config queries
//! - Ping/pong keepalive
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/:clientId
//!              ↓
//! 2. Server sends threshold_update and quorum_update
//!              ↓
//! 3. Operator events are pushed as they occur:
//!    - block_update
//!    - pub_key_update
//!    - deal_created_update / deal_executed_update
//!    - quorum_update / quorum_not_reached_update
//!              ↓
//! 4. Client actions are answered on the same connection
//! ```
//!
//! ## Message Format
//!
//! All messages, both directions, are JSON:
//!
//! ```json
//! {
//!     "action": "quorum_update",
//!     "payload": { "quorum": 3 }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{FillableQuery, SubmitDepositRequest};
use crate::services::events::actions;
use crate::services::{OperatorCoordinator, OperatorEvent};
use crate::AppState;

/// WebSocket message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage<T> {
    /// Action name (see [`actions`]).
    pub action: String,

    /// Action data.
    pub payload: T,
}

impl<T: Serialize> WsMessage<T> {
    /// Create a new WebSocket message.
    pub fn new(action: &str, payload: T) -> Self {
        Self {
            action: action.to_string(),
            payload,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&OperatorEvent> for WsMessage<serde_json::Value> {
    fn from(event: &OperatorEvent) -> Self {
        WsMessage::new(event.action(), event.payload())
    }
}

/// A client's inbound message before its payload is interpreted.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(default)]
    payload: serde_json::Value,
}

struct Connection {
    id: Uuid,
    tx: broadcast::Sender<String>,
}

/// WebSocket connection registry.
///
/// Tracks active WebSocket sessions per client id and broadcasts
/// operator events to all of them.
#[derive(Clone)]
pub struct WsRegistry {
    /// Map of client id -> connections.
    /// A client can have multiple connections (multiple tabs/devices).
    sessions: Arc<Mutex<HashMap<String, Vec<Connection>>>>,
}

impl WsRegistry {
    /// Create a new WebSocket registry.
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new WebSocket connection for a client.
    /// Returns the connection id and a receiver for its messages.
    pub async fn register(&self, client: &str) -> (Uuid, broadcast::Receiver<String>) {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(100);
        let id = Uuid::new_v4();

        let connections = sessions.entry(client.to_string()).or_default();
        connections.push(Connection { id, tx });

        info!(
            "Registered WebSocket {} for client: {} (client connections: {})",
            id,
            client,
            connections.len()
        );
        (id, rx)
    }

    /// Unregister one connection of a client.
    pub async fn unregister(&self, client: &str, id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if let Some(connections) = sessions.get_mut(client) {
            connections.retain(|c| c.id != id && c.tx.receiver_count() > 0);

            if connections.is_empty() {
                sessions.remove(client);
                info!("Unregistered all WebSocket connections for client: {}", client);
            } else {
                info!(
                    "Unregistered WebSocket {} for client: {} (remaining: {})",
                    id,
                    client,
                    connections.len()
                );
            }
        }
    }

    /// Broadcast a message to all connected clients. Returns the number
    /// of connections reached.
    pub async fn broadcast<T: Serialize>(&self, message: &WsMessage<T>) -> Result<usize, String> {
        let json = message
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let sessions = self.sessions.lock().await;
        let total_sent = sessions
            .values()
            .flatten()
            .filter(|c| c.tx.send(json.clone()).is_ok())
            .count();

        debug!("Broadcasted {} to {} connections", message.action, total_sent);
        Ok(total_sent)
    }

    /// Get the number of active connections for a client.
    pub async fn connection_count(&self, client: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(client).map(|v| v.len()).unwrap_or(0)
    }

    /// Get total number of active connections across all clients.
    pub async fn total_connections(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|v| v.len()).sum()
    }
}

impl Default for WsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward operator events to every connected client until the event
/// stream closes.
pub async fn forward_events(mut events: broadcast::Receiver<OperatorEvent>, registry: WsRegistry) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = registry.broadcast(&WsMessage::from(&event)).await {
                    error!("Failed to broadcast {}: {}", event.action(), e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event forwarder lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("Event forwarder stopped");
}

/// Messages sent to a client right after it connects.
pub async fn greeting(coordinator: &OperatorCoordinator) -> Vec<WsMessage<serde_json::Value>> {
    let mut messages = vec![WsMessage::new(
        actions::THRESHOLD_UPDATE,
        json!({ "threshold": coordinator.get_threshold() }),
    )];
    match coordinator.get_quorum(0).await {
        Ok(quorum) => messages.push(WsMessage::new(actions::QUORUM_UPDATE, json!({ "quorum": quorum }))),
        Err(e) => warn!("Quorum unavailable for greeting: {}", e),
    }
    messages
}

fn error_message(message: impl std::fmt::Display) -> WsMessage<serde_json::Value> {
    WsMessage::new(actions::ERROR, json!({ "message": message.to_string() }))
}

/// Answer one client message.
pub async fn handle_client_message(coordinator: &OperatorCoordinator, text: &str) -> WsMessage<serde_json::Value> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return error_message(format!("Invalid message: {}", e)),
    };

    match message.action.as_str() {
        actions::PING => WsMessage::new(actions::PONG, json!({})),

        actions::FETCH_CONFIG => match coordinator.fetch_config().await {
            Ok(config) => WsMessage::new(actions::FETCH_CONFIG_SUCCESS, json!({ "config": config })),
            Err(e) => error_message(e),
        },

        actions::FETCH_FILLABLE_DEPOSITS => {
            let query: FillableQuery = if message.payload.is_null() {
                FillableQuery::default()
            } else {
                match serde_json::from_value(message.payload) {
                    Ok(query) => query,
                    Err(e) => return error_message(format!("Invalid payload: {}", e)),
                }
            };
            match coordinator.fetch_fillable_deposits(query.minimum_amount).await {
                Ok(deposits) => WsMessage::new(
                    actions::FETCH_FILLABLE_SUCCESS,
                    json!({ "deposits": deposits, "minimumAmount": query.minimum_amount.to_string() }),
                ),
                Err(e) => error_message(e),
            }
        }

        actions::SUBMIT_DEPOSIT_METADATA => {
            let result = match serde_json::from_value::<SubmitDepositRequest>(message.payload) {
                Ok(request) => coordinator
                    .submit_deposit_metadata(request.into())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("Invalid payload: {}", e)),
            };
            let payload = match result {
                Ok(_) => json!({ "success": true }),
                Err(err) => {
                    info!("Deposit submission rejected: {}", err);
                    json!({ "success": false, "err": err })
                }
            };
            WsMessage::new(actions::SUBMIT_DEPOSIT_METADATA_RESULT, payload)
        }

        other => error_message(format!("Unknown action: {}", other)),
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{client_id}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// Handles the initial WebSocket handshake and then manages
/// the bidirectional communication.
///
/// ## Endpoint
///
/// `GET /ws/:clientId`
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/' + clientId);
///
/// ws.onmessage = (event) => {
///     const message = JSON.parse(event.data);
///     console.log('Action:', message.action, message.payload);
/// };
///
/// ws.send(JSON.stringify({ action: 'fetch_config', payload: {} }));
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let client = path.into_inner();
    info!("WebSocket connection request for client: {}", client);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let coordinator = state.coordinator.clone();
    let (connection_id, mut rx) = registry.register(&client).await;

    actix_rt::spawn(async move {
        for message in greeting(&coordinator).await {
            if let Ok(json) = message.to_json() {
                if let Err(e) = session.text(json).await {
                    error!("Failed to send greeting to {}: {}", client, e);
                }
            }
        }

        // Forward broadcasts to this session
        let mut session_clone = session.clone();
        let client_for_task = client.clone();
        let registry_for_cleanup = registry.clone();
        actix_rt::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let Err(e) = session_clone.text(msg).await {
                    debug!(
                        "WebSocket session closed for {}: {}. Stopping message forwarding.",
                        client_for_task, e
                    );
                    registry_for_cleanup.unregister(&client_for_task, connection_id).await;
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Pong(_) => {}
                Message::Text(text) => {
                    debug!("Received text from {}: {}", client, text);
                    let reply = handle_client_message(&coordinator, &text).await;
                    if let Ok(json) = reply.to_json() {
                        if session.text(json).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", client);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", client, reason);
                    break;
                }
                _ => {}
            }
        }

        registry.unregister(&client, connection_id).await;
        info!("WebSocket disconnected for client: {}", client);
    });

    Ok(response)
}
