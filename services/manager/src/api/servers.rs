//! Notifications from server processes.

use areaplane_events::{topics, DomainEvent, EventEnvelope};
use areaplane_id::ServerId;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::warn;

use super::error::ApiError;
use crate::allocation::ServerStarted;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/servers/{server_id}/started", post(server_started))
}

/// `POST /v1/servers/{server_id}/started`
///
/// Marks the server active and answers with the resulting `server.updated`
/// envelope, which is also published. A repeated notification that changes
/// nothing answers `204 No Content` and publishes nothing.
async fn server_started(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<ServerStarted>,
) -> Result<Response, ApiError> {
    let server_id = ServerId::parse(&server_id)
        .map_err(|e| ApiError::bad_request("invalid_server_id", e.to_string()))?;

    let Some(event) = state.allocator().handle_server_started(server_id, body).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let envelope: EventEnvelope<DomainEvent> = EventEnvelope::wrap(event, state.instance_name(), None);

    if let Err(e) = state.publisher().publish(topics::EVENTS, &envelope).await {
        warn!(server_id = %server_id, error = %e, "Failed to publish event");
    }

    Ok(Json(envelope).into_response())
}
