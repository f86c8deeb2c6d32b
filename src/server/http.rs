//! HTTP and websocket surface of [`SessionServer`]

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{SessionManager, SessionServer};
use crate::error::{ServerError, SessionError};
use crate::event::{Event, EventKind};
use crate::session::LoadMode;
use crate::state::{SaveMeta, SessionMeta, SessionSnapshot};

pub const SAVES_PATH: &str = "/api/saves";
pub const SAVE_PATH: &str = "/api/saves/:id";
pub const SAVE_EVENTS_PATH: &str = "/api/saves/:id/events";
pub const SAVE_LOAD_PATH: &str = "/api/saves/:id/load";
pub const STATES_PATH: &str = "/api/states";
pub const STATE_PATH: &str = "/api/states/:id";
pub const WS_PATH: &str = "/api/ws/:id";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    UpgradeRequired(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::UpgradeRequired(_) => StatusCode::UPGRADE_REQUIRED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (code, body).into_response()
    }
}

impl From<ServerError> for ApiError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::SaveNotFound(_) => ApiError::NotFound("save not found".into()),
            ServerError::SessionNotFound(_) => ApiError::NotFound(
                "session is not initialized - load from archive or create new first".into(),
            ),
            ServerError::NoFactory => ApiError::NotImplemented(e.to_string()),
            ServerError::Session(SessionError::MissingRoot(_)) => ApiError::BadRequest(e.to_string()),
            ServerError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                ApiError::NotFound("save not found".into())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Every route, bound to `server`
pub fn router(server: Arc<SessionServer>) -> Router {
    Router::new()
        .route(SAVES_PATH, get(list_saves))
        .route(SAVE_PATH, get(get_save_state).delete(delete_save))
        .route(SAVE_EVENTS_PATH, get(get_save_events))
        .route(SAVE_LOAD_PATH, axum::routing::post(load_save))
        .route(STATES_PATH, get(list_states).post(create_state))
        .route(STATE_PATH, get(get_state))
        .route(WS_PATH, get(ws_session))
        .with_state(server)
}

async fn list_saves(State(server): State<Arc<SessionServer>>) -> Json<Vec<SaveMeta>> {
    Json(server.list_saves())
}

async fn get_save_state(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(server.get_save_state(&id).await?))
}

async fn get_save_events(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    Ok(Json(server.get_save_events(&id).await?))
}

async fn delete_save(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
) -> Result<Json<SaveMeta>, ApiError> {
    Ok(Json(server.delete_save(&id).await?))
}

#[derive(Debug, Deserialize)]
struct LoadParams {
    mode: LoadMode,
}

async fn load_save(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
    Json(params): Json<LoadParams>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(server.load_state(&id, params.mode).await?))
}

async fn list_states(State(server): State<Arc<SessionServer>>) -> Json<Vec<SessionMeta>> {
    Json(server.list_states().await)
}

#[derive(Debug, Default, Deserialize)]
struct CreateParams {
    #[serde(default)]
    start_content: Option<String>,
}

async fn create_state(
    State(server): State<Arc<SessionServer>>,
    params: Option<Json<CreateParams>>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    Ok(Json(server.create_state(params.start_content).await?))
}

async fn get_state(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(server.get_state(&id).await?))
}

async fn ws_session(
    State(server): State<Arc<SessionServer>>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    // refuse before upgrading so the client gets a status code
    server.manager(&id)?;
    let ws = ws.ok_or_else(|| ApiError::UpgradeRequired("expected a websocket upgrade".into()))?;
    Ok(ws.on_upgrade(move |socket| handle_socket(server, id, socket)))
}

async fn handle_socket(server: Arc<SessionServer>, id: String, socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (manager, viewer) = match server.connect(&id, tx.clone()) {
        Ok(connected) => connected,
        Err(e) => {
            warn!(session_id = %id, error = %e, "Session closed before the socket opened");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        if let Some(reply) = handle_frame(&manager, &text) {
            let _ = tx.send(reply);
        }
    }

    manager.disconnect(viewer);
    drop(tx);
    writer.abort();
}

/// Deliver one inbound frame to the chat loop; a frame that cannot be used
/// yields the `Error` record to send back
fn handle_frame(manager: &SessionManager, text: &str) -> Option<String> {
    debug!(session_id = %manager.id(), data = %text, "Inbound frame");
    let msg = match parse_inbound(text) {
        Ok(content) => {
            if manager.send(content) {
                return None;
            }
            "session is closing".to_string()
        }
        Err(msg) => msg,
    };
    match serde_json::to_string(&Event::error(msg)) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(session_id = %manager.id(), error = %e, "Could not encode error frame");
            None
        }
    }
}

/// The content of an inbound `send_message` frame
fn parse_inbound(text: &str) -> Result<String, String> {
    let event: Event = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            #[derive(Deserialize)]
            struct Bare {
                #[serde(rename = "type")]
                kind: String,
                content: String,
            }
            // viewers may omit the timestamp
            let bare: Bare = serde_json::from_str(text).map_err(|e| e.to_string())?;
            if bare.kind != "send_message" {
                return Err(format!("unsupported message type: {}", bare.kind));
            }
            return Ok(bare.content);
        }
    };
    match event.kind {
        EventKind::SendMessage { content } => Ok(content),
        other => Err(format!(
            "unsupported message type: {}",
            Event::new(other).event_type()
        )),
    }
}
