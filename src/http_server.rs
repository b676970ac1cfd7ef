//! HTTP server implementation using Axum.

use crate::bridge;
use crate::connections::Outbound;
use crate::error::PersistenceError;
use crate::persistence::Identity;
use crate::protocol::{ClientEvent, ExpirySetting};
use crate::room::{AccessLevel, Room, RoomConfig, DEFAULT_LANGUAGE, DEFAULT_ROOM_NAME};
use crate::session::{self, Client};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Length of generated room ids.
pub const ROOM_ID_LEN: usize = 6;
const ROOM_ID_ATTEMPTS: usize = 8;

#[derive(Deserialize)]
struct WsParams {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    access_level: Option<AccessLevel>,
    #[serde(default)]
    is_private: Option<bool>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    expiry: Option<ExpirySetting>,
}

#[derive(Serialize)]
struct CreateRoomResponse {
    id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/rooms", post(create_room))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the configured port, with the flush loop alongside.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    bridge::spawn_flush_loop(state.clone());
    info!("Starting HTTP server on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

fn new_room_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    raw[..ROOM_ID_LEN].to_ascii_uppercase()
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, (StatusCode, String)> {
    let token = session_token(&headers)
        .ok_or((StatusCode::UNAUTHORIZED, "missing session token".to_string()))?;
    let owner = state
        .identity
        .resolve(token)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?
        .ok_or((StatusCode::UNAUTHORIZED, "unknown session token".to_string()))?;

    let config = RoomConfig {
        name: req
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROOM_NAME.to_string()),
        language: req
            .language
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        access_level: req.access_level.unwrap_or_default(),
        is_private: req.is_private.unwrap_or(false),
        password: req.password.filter(|p| !p.is_empty()),
        expires_at: req.expiry.and_then(|e| e.resolve(Utc::now())),
    };

    for _ in 0..ROOM_ID_ATTEMPTS {
        let id = new_room_id();
        let record = Room::with_config(&id, Some(owner.id.clone()), config.clone()).to_record();
        match state.repository.create_room(record).await {
            Ok(()) => {
                if let Err(e) = state.rooms.create(&id, &owner.id, config).await {
                    // Someone joined the id before it was stored; they see the
                    // stored record after the room is next hydrated.
                    warn!(room = %id, error = %e, "room already live in memory");
                }
                return Ok(Json(CreateRoomResponse { id }));
            }
            Err(PersistenceError::Conflict(_)) => continue,
            Err(e) => return Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
        }
    }
    Err((
        StatusCode::SERVICE_UNAVAILABLE,
        "could not allocate a room id".to_string(),
    ))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let identity = match params.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => match state.identity.resolve(token).await {
            Ok(found) => {
                if found.is_none() {
                    debug!("unknown session token, connecting anonymously");
                }
                found
            }
            Err(e) => {
                warn!(error = %e, "identity lookup failed, connecting anonymously");
                None
            }
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<Identity>) {
    let (conn, mut outbound) = state.connections.register();
    let mut client = Client::new(conn, identity);
    info!(conn = %conn, identity = client.identity_id().unwrap_or("-"), "socket connected");

    let (mut sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => session::handle_event(&state, &mut client, event).await,
                    Err(e) => debug!(conn = %conn, error = %e, "ignoring malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn, error = %e, "socket read failed");
                    break;
                }
            },
            // The server closed the connection (kick, replacement, destroy).
            _ = &mut writer => break,
        }
    }

    session::disconnect(&state, &mut client).await;
    writer.abort();
    info!(conn = %conn, "socket disconnected");
}
