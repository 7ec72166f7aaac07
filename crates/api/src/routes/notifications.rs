//! Single-notification routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};

use notice_common::error::AppError;
use notice_common::types::{DbId, NewNotification, Notification};
use notice_engine::lifecycle::Transition;
use notice_engine::service::Created;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(create_notification))
        .route("/api/notifications/{id}", delete(destroy_notification))
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/notifications/{id}/unread", post(mark_unread))
}

/// POST /api/notifications: create a notification and hand it to delivery.
async fn create_notification(
    State(state): State<AppState>,
    Json(new): Json<NewNotification>,
) -> Result<(StatusCode, Json<Created>), AppError> {
    let created = state.service.create(new).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE /api/notifications/{id}
async fn destroy_notification(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> Result<Json<Notification>, AppError> {
    let notification = state.service.destroy(id).await?;
    Ok(Json(notification))
}

/// POST /api/notifications/{id}/read: no-op when already read.
async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> Result<Json<Transition>, AppError> {
    Ok(Json(state.service.mark_read(id).await?))
}

/// POST /api/notifications/{id}/unread
async fn mark_unread(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> Result<Json<Transition>, AppError> {
    Ok(Json(state.service.mark_unread(id).await?))
}
