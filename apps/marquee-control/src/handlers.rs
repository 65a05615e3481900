//! Read-only catalog endpoints consumed by the terminals' pull path, plus
//! router assembly shared by `main` and the integration tests.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use marquee_proto::{Display, Screen, ScreenState};

use crate::broadcast::Broadcaster;
use crate::store::StateStore;
use crate::ws::push_channel_handler;

pub type SharedStore = Arc<dyn StateStore>;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub broadcaster: Arc<Broadcaster>,
}

pub fn app_router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/displays", get(list_displays))
        .route("/api/displays/:id/screens", get(list_screens))
        .route("/api/states", get(list_states))
        .route("/ws/state", get(push_channel_handler))
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn list_displays(
    State(app): State<AppState>,
) -> Result<Json<Vec<Display>>, StatusCode> {
    app.store.list_displays().await.map(Json).map_err(|err| {
        error!(error = %err, "display listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn list_screens(
    State(app): State<AppState>,
    Path(display_id): Path<String>,
) -> Result<Json<Vec<Screen>>, StatusCode> {
    app.store
        .list_screens(&display_id)
        .await
        .map(Json)
        .map_err(|err| {
            error!(error = %err, display = %display_id, "screen listing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn list_states(
    State(app): State<AppState>,
) -> Result<Json<Vec<ScreenState>>, StatusCode> {
    app.store.list_states().await.map(Json).map_err(|err| {
        error!(error = %err, "state listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
