//! WebSocket stream of mint and purchase progress events
//!
//! Provides `/api/progress/ws`. Clients subscribe with their user id and
//! receive the `token-mint-*` and `token-purchase-*` events of their own jobs.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::models::job::{Job, JobState};
use crate::models::progress::UserEvent;
use crate::AppState;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client request (subscribe, unsubscribe, ping)
#[derive(Debug, Clone, Deserialize)]
pub struct WsSubscribeRequest {
    pub action: String,
    /// Required for subscribe
    pub user_id: Option<String>,
}

/// Message to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "subscribed")]
    Subscribed { user_id: String },
    /// Jobs of this user that have not finished yet
    #[serde(rename = "initial")]
    Initial { jobs: Vec<Job> },
    #[serde(rename = "progress")]
    Progress { event: String, payload: serde_json::Value },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong,
}

impl From<UserEvent> for WsMessage {
    fn from(event: UserEvent) -> Self {
        WsMessage::Progress {
            event: event.event,
            payload: event.payload,
        }
    }
}

fn encode(msg: &WsMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!(error = %e, "Failed to encode WebSocket message");
            None
        }
    }
}

/// GET /api/progress/ws
///
/// Client sends:
/// ```json
/// { "action": "subscribe", "user_id": "user-42" }
/// ```
///
/// Server streams:
/// ```json
/// { "type": "progress", "event": "token-purchase-progress", "payload": { "progress": 30, ... } }
/// ```
pub async fn progress_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    info!("New progress WebSocket connection");

    let user_id = match wait_for_subscription(&mut receiver).await {
        Ok(user_id) => user_id,
        Err(e) => {
            if let Some(msg) = encode(&WsMessage::Error {
                message: e.to_string(),
            }) {
                let _ = sender.send(msg).await;
            }
            return;
        }
    };

    info!(user_id = %user_id, "Progress subscription");

    // Subscribe before sending the initial state so no event is lost in between
    let mut broadcast_rx = state.broadcaster.subscribe();

    if let Some(msg) = encode(&WsMessage::Subscribed {
        user_id: user_id.clone(),
    }) {
        let _ = sender.send(msg).await;
    }

    let jobs = pending_jobs(&state, &user_id).await;
    if let Some(msg) = encode(&WsMessage::Initial { jobs }) {
        let _ = sender.send(msg).await;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            result = broadcast_rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.user_id != user_id {
                            continue;
                        }
                        let Some(msg) = encode(&WsMessage::from(event)) else {
                            continue;
                        };
                        if let Err(e) = sender.send(msg).await {
                            debug!("WebSocket send error: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user_id = %user_id, "Missed {} progress events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Progress channel closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = sender.send(Message::Ping(axum::body::Bytes::new())).await {
                    debug!("Heartbeat failed: {}", e);
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(req) = serde_json::from_str::<WsSubscribeRequest>(&text) {
                            match req.action.as_str() {
                                "ping" => {
                                    if let Some(msg) = encode(&WsMessage::Pong) {
                                        let _ = sender.send(msg).await;
                                    }
                                }
                                "unsubscribe" => {
                                    info!(user_id = %user_id, "Client unsubscribed");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(user_id = %user_id, "Progress WebSocket connection closed");
}

async fn pending_jobs(state: &AppState, user_id: &str) -> Vec<Job> {
    let mut jobs = Vec::new();
    for job_state in [JobState::Active, JobState::Waiting, JobState::Delayed] {
        match state.jobs.list_by_state(None, job_state).await {
            Ok(found) => jobs.extend(
                found
                    .into_iter()
                    .filter(|job| job.payload.owner_user_id() == Some(user_id)),
            ),
            Err(e) => warn!(error = %e, "Failed to list pending jobs"),
        }
    }
    jobs
}

async fn wait_for_subscription(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let timeout = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let req: WsSubscribeRequest = serde_json::from_str(&text)?;

                    if req.action != "subscribe" {
                        return Err("First message must be subscribe action".into());
                    }

                    let user_id = req
                        .user_id
                        .map(|id| id.trim().to_string())
                        .filter(|id| !id.is_empty())
                        .ok_or("user_id is required for subscription")?;

                    return Ok(user_id);
                }
                Ok(Message::Close(_)) => {
                    return Err("Connection closed before subscription".into());
                }
                Err(e) => {
                    return Err(format!("WebSocket error: {}", e).into());
                }
                _ => continue,
            }
        }
        Err("Connection ended before subscription".into())
    });

    timeout.await.map_err(|_| "Subscription timeout")?
}
