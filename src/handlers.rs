// handlers.rs

use crate::{
    commands,
    devices::{DeviceSnapshot, Light},
    error::AppError,
    effects::{PlayOptions, RunningEffect, library},
    models::{AppState, ClientRequest, ErrorRate, StartEffectRequest, StartEffectResponse, WsMessage},
    utils,
};
use axum::{
    Json,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn handle_client_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("Client connection attempt");
    ws.on_upgrade(|socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    let (tx, rx) = broadcast::channel(100);
    state.clients.insert(client_id, tx.clone());
    info!(%client_id, "Client connected");

    let mut send_task = tokio::spawn(async move {
        let mut rx = rx;
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%client_id, skipped, "Client lagging, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                let Ok(text) = msg.to_text() else { continue };
                if text.is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<ClientRequest>(text) {
                    Ok(ClientRequest::Command {
                        device_id,
                        name,
                        payload,
                    }) => match commands::dispatch(Arc::clone(&state), &device_id, &name, &payload).await {
                        Ok(()) => WsMessage::Accepted { device_id, name },
                        Err(e) => WsMessage::Error {
                            message: e.to_string(),
                            code: e.status_code().as_u16(),
                        },
                    },
                    Err(e) => {
                        error!("Invalid message format: {}", e);
                        WsMessage::Error {
                            message: e.to_string(),
                            code: StatusCode::BAD_REQUEST.as_u16(),
                        }
                    }
                };
                let _ = tx.send(reply);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    utils::cleanup_client_connection(client_id, &state).await;
}

#[utoipa::path(
    get,
    path = "/api/devices",
    responses((status = 200, description = "Every discovered light", body = [DeviceSnapshot]))
)]
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceSnapshot>> {
    Json(state.manager.devices().iter().map(|light| light.snapshot()).collect())
}

#[utoipa::path(
    get,
    path = "/api/devices/{id}",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Current state of the light", body = DeviceSnapshot),
        (status = 404, description = "Unknown device")
    )
)]
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceSnapshot>, AppError> {
    let light = state.manager.device(&id).ok_or(AppError::DeviceNotFound)?;
    Ok(Json(light.snapshot()))
}

#[utoipa::path(
    post,
    path = "/api/devices/{id}/commands/{name}",
    params(
        ("id" = String, Path, description = "Device id"),
        ("name" = String, Path, description = "Command name, e.g. set_color")
    ),
    responses(
        (status = 202, description = "Command accepted"),
        (status = 400, description = "Invalid payload or unsupported command"),
        (status = 404, description = "Unknown device"),
        (status = 409, description = "Device is not ready")
    )
)]
pub async fn run_command(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(payload): Json<serde_json::Value>,
) -> Result<StatusCode, AppError> {
    commands::dispatch(Arc::clone(&state), &id, &name, &payload).await?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    get,
    path = "/api/diagnostics/errors",
    responses((status = 200, description = "Failures per operation over the last minute", body = [ErrorRate]))
)]
pub async fn error_rates(State(state): State<Arc<AppState>>) -> Json<Vec<ErrorRate>> {
    Json(
        state
            .manager
            .error_rates()
            .into_iter()
            .map(|(op, count)| ErrorRate {
                op: op.as_str().to_string(),
                last_minute: count,
            })
            .collect(),
    )
}

#[utoipa::path(
    get,
    path = "/api/effects",
    responses((status = 200, description = "Effects currently playing", body = [RunningEffect]))
)]
pub async fn list_effects(State(state): State<Arc<AppState>>) -> Json<Vec<RunningEffect>> {
    Json(state.effects.list())
}

#[utoipa::path(
    post,
    path = "/api/effects",
    request_body = StartEffectRequest,
    responses(
        (status = 201, description = "Effect started", body = StartEffectResponse),
        (status = 400, description = "Invalid effect"),
        (status = 404, description = "Unknown device")
    )
)]
pub async fn start_effect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartEffectRequest>,
) -> Result<(StatusCode, Json<StartEffectResponse>), AppError> {
    let definition = match (request.definition, request.file) {
        (Some(definition), _) => definition,
        (None, Some(file)) => library::load(library::effect_path(&state.effects_dir, &file)?)?,
        (None, None) => return Err(AppError::Validation("either definition or file is required".to_string())),
    };
    let zones = request
        .zones
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|id| state.manager.device(id).ok_or(AppError::DeviceNotFound))
                .collect::<Result<Vec<Arc<Light>>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let options = PlayOptions {
        looped: request.looped,
        restore_on_end: request.restore,
    };
    let id = state.effects.start(definition, zones, options)?;
    Ok((StatusCode::CREATED, Json(StartEffectResponse { id })))
}

#[utoipa::path(
    delete,
    path = "/api/effects/{id}",
    params(("id" = Uuid, Path, description = "Effect run id")),
    responses(
        (status = 202, description = "Stop requested"),
        (status = 404, description = "No such run")
    )
)]
pub async fn stop_effect(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    state.effects.stop(id)?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    get,
    path = "/api/effects/library",
    responses((status = 200, description = "Installed effect files", body = [String]))
)]
pub async fn effect_library(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(library::installed_effects(&state.effects_dir)?))
}
