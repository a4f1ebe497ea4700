//! REST facade over the registry and the command router.

pub mod devices;
pub mod error;
pub mod models;

use axum::{
    Router,
    routing::{get, post},
};

use crate::registry::DeviceRegistry;
use crate::router::CommandRouter;

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub router: CommandRouter,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/devices", get(devices::list_devices))
        .route("/api/devices/{id}", get(devices::get_device))
        .route("/api/devices/{id}/commands", post(devices::send_command))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
