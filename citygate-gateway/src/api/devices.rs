use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use citygate_core::DeviceId;

use super::AppState;
use super::error::ApiError;
use super::models::{CommandRequest, CommandResponse, DeviceResponse, ListResponse};

pub async fn list_devices(State(state): State<AppState>) -> Json<ListResponse<DeviceResponse>> {
    let mut items: Vec<DeviceResponse> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(DeviceResponse::from)
        .collect();
    items.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ListResponse {
        total: items.len(),
        items,
    })
}

pub async fn get_device(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DeviceResponse>, ApiError> {
    state
        .registry
        .get(&DeviceId::from(id.as_str()))
        .await
        .map(|record| Json(record.into()))
        .ok_or_else(|| ApiError::NotFound(format!("device {id} not found")))
}

pub async fn send_command(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Result<Response, ApiError> {
    let device_id = DeviceId::from(id);
    if state.registry.get(&device_id).await.is_none() {
        return Err(ApiError::NotFound(format!("device {device_id} not found")));
    }

    let outcome = state
        .router
        .route(&device_id, &request.command_type, &request.command_value)
        .await;

    if !outcome.is_success() {
        return Err(ApiError::BadGateway(outcome.message));
    }

    Ok((StatusCode::OK, Json(CommandResponse::from(outcome))).into_response())
}
