//! Per-receiver listing and counter routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use notice_common::error::AppError;
use notice_common::types::{DbId, EntityRef, Notification};
use notice_engine::service::UnreadCount;
use notice_engine::store::ListQuery;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/receivers/{kind}/{id}/notifications",
            get(list_notifications),
        )
        .route("/api/receivers/{kind}/{id}/unread_count", get(unread_count))
        .route("/api/receivers/{kind}/{id}/read_all", post(read_all))
}

/// GET /api/receivers/{kind}/{id}/notifications?status=&code=&sort=&limit=&offset=
async fn list_notifications(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, DbId)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let receiver = EntityRef::new(kind, id);
    Ok(Json(state.service.list(&receiver, &query).await?))
}

/// GET /api/receivers/{kind}/{id}/unread_count
async fn unread_count(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, DbId)>,
) -> Result<Json<UnreadCount>, AppError> {
    let receiver = EntityRef::new(kind, id);
    Ok(Json(state.service.unread_count(&receiver).await?))
}

/// POST /api/receivers/{kind}/{id}/read_all
async fn read_all(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, DbId)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let receiver = EntityRef::new(kind, id);
    let updated = state.service.mark_all_read(&receiver).await?;
    Ok(Json(json!({ "updated": updated })))
}
