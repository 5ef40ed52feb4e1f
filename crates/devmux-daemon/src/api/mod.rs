//! Saved-device REST API.
//!
//! - `GET /api/devices`: saved devices
//! - `POST /api/devices`: save one device without connecting
//! - `PUT /api/devices`: replace the saved list
//! - `DELETE /api/devices/{id}`: forget a device and stop tracking it
//! - `POST /api/quick-connect`: connect through the registry, then save

pub mod store;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use devmux_types::{QuickConnectRequest, QuickConnectResponse, SavedDevice};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{RegistryError, StoreError};
use crate::server::AppState;

pub use store::DeviceStore;

const INVALID_REQUEST: &str = "Invalid request: name, host, and port are required";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/devices",
            get(list_devices).post(save_device).put(replace_devices),
        )
        .route("/devices/{id}", delete(delete_device))
        .route("/quick-connect", post(quick_connect))
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    let body = QuickConnectResponse {
        success: false,
        error: Some(error.into()),
        ..QuickConnectResponse::default()
    };
    (status, Json(body)).into_response()
}

fn success() -> Response {
    Json(QuickConnectResponse {
        success: true,
        ..QuickConnectResponse::default()
    })
    .into_response()
}

fn store_failure(e: &StoreError) -> Response {
    warn!("Device store error: {}", e);
    failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Decode and validate a `{name, host, port}` body.
fn parse_request(body: Value) -> Option<QuickConnectRequest> {
    let request: QuickConnectRequest = serde_json::from_value(body).ok()?;
    let valid = !request.name.trim().is_empty() && !request.host.trim().is_empty() && request.port != 0;
    valid.then_some(request)
}

async fn list_devices(State(state): State<AppState>) -> Response {
    match state.store.list().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => {
            warn!("Failed to read saved devices: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::<SavedDevice>::new())).into_response()
        }
    }
}

async fn save_device(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(request) = parse_request(body) else {
        return failure(StatusCode::BAD_REQUEST, INVALID_REQUEST);
    };

    match state
        .store
        .upsert(&request.name, &request.host, request.port, false)
        .await
    {
        Ok(saved) => Json(saved).into_response(),
        Err(e) => store_failure(&e),
    }
}

async fn replace_devices(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Ok(devices) = serde_json::from_value::<Vec<SavedDevice>>(body) else {
        return failure(StatusCode::BAD_REQUEST, "Invalid devices data");
    };

    match state.store.replace(devices).await {
        Ok(()) => success(),
        Err(e) => store_failure(&e),
    }
}

async fn delete_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let saved = match state.store.remove(&id).await {
        Ok(saved) => saved,
        Err(StoreError::NotFound(_)) => {
            return failure(StatusCode::NOT_FOUND, "Device not found");
        }
        Err(e) => return store_failure(&e),
    };
    info!("Forgot saved device {} ({}:{})", saved.name, saved.host, saved.port);

    let udid = format!("{}:{}", saved.host, saved.port);
    match state.registry.remove_device(&udid).await {
        Ok(()) | Err(RegistryError::DeviceNotFound(_)) => {}
        Err(e) => warn!("Failed to remove {} from registry: {}", udid, e),
    }
    success()
}

async fn quick_connect(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(request) = parse_request(body) else {
        return failure(StatusCode::BAD_REQUEST, INVALID_REQUEST);
    };
    info!(
        "Quick connect {} ({}:{})",
        request.name, request.host, request.port
    );

    let udid = match state.registry.add_device(&request.host, request.port).await {
        Ok(udid) => udid,
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let device_id = match state
        .store
        .upsert(&request.name, &request.host, request.port, true)
        .await
    {
        Ok(saved) => Some(saved.id),
        Err(e) => {
            warn!("Connected {} but failed to save it: {}", udid, e);
            None
        }
    };

    Json(QuickConnectResponse {
        success: true,
        device_id,
        udid: Some(udid),
        error: None,
    })
    .into_response()
}
