//! `GET /api/v1/ws/events` (§6): the WebSocket event fan-out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use foreman_bus::SystemEvent;
use foreman_types::EntityId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::ApiState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Query params accepted on the initial upgrade, e.g.
/// `?event_types=A,B&entity_types=t&entity_ids=x,y`.
#[derive(Debug, Deserialize, Default)]
pub struct WsQuery {
    event_types: Option<String>,
    entity_types: Option<String>,
    entity_ids: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct Filters {
    event_types: Option<HashSet<String>>,
    entity_types: Option<HashSet<String>>,
    entity_ids: Option<HashSet<EntityId>>,
}

impl Filters {
    fn from_query(query: &WsQuery) -> Self {
        Self {
            event_types: query.event_types.as_deref().map(split_set),
            entity_types: query.entity_types.as_deref().map(split_set),
            entity_ids: query.entity_ids.as_deref().map(|s| {
                s.split(',')
                    .filter_map(|v| v.trim().parse::<uuid::Uuid>().ok())
                    .map(EntityId::from)
                    .collect()
            }),
        }
    }

    fn matches(&self, event: &SystemEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type.wire_tag()) {
                return false;
            }
        }
        if let Some(types) = &self.entity_types {
            if !types.contains(&event.entity_type) {
                return false;
            }
        }
        if let Some(ids) = &self.entity_ids {
            if !ids.contains(&event.entity_id) {
                return false;
            }
        }
        true
    }
}

fn split_set(s: &str) -> HashSet<String> {
    s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        event_types: Option<String>,
        entity_types: Option<String>,
        entity_ids: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct SubscribedAck<'a> {
    status: &'static str,
    filters: SubscribedFilters<'a>,
}

#[derive(Debug, Serialize)]
struct SubscribedFilters<'a> {
    event_types: &'a Option<HashSet<String>>,
    entity_types: &'a Option<HashSet<String>>,
    entity_ids: &'a Option<HashSet<EntityId>>,
}

/// `GET /api/v1/ws/events`.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let filters = Filters::from_query(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, filters))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>, mut filters: Filters) {
    let mut events = state.bus.subscribe();
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { break };
                if !filters.matches(&event) {
                    continue;
                }
                let payload = serde_json::json!({
                    "event_type": event.event_type.wire_tag(),
                    "entity_type": event.entity_type,
                    "entity_id": event.entity_id,
                    "payload": event.payload,
                });
                if socket.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            _ = ping_ticker.tick() => {
                if socket.send(Message::Text(serde_json::json!({"type": "ping"}).to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { event_types, entity_types, entity_ids }) => {
                                filters = Filters::from_query(&WsQuery { event_types, entity_types, entity_ids });
                                let ack = SubscribedAck {
                                    status: "subscribed",
                                    filters: SubscribedFilters {
                                        event_types: &filters.event_types,
                                        entity_types: &filters.entity_types,
                                        entity_ids: &filters.entity_ids,
                                    },
                                };
                                let body = serde_json::to_string(&ack).unwrap_or_default();
                                if socket.send(Message::Text(body)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                let err = serde_json::json!({"error": "Invalid JSON message"}).to_string();
                                if socket.send(Message::Text(err)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("websocket client disconnected");
}
