//! Tag-broadcast announcement routes.

use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;

use notice_common::error::AppError;
use notice_common::types::DbId;
use notice_engine::fanout::FanoutReport;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/annunciations/{id}/publish", post(publish))
        .route("/api/annunciations/{id}", delete(retract))
}

#[derive(Debug, Deserialize)]
pub struct PublishParams {
    #[serde(default = "default_receiver_type")]
    pub receiver_type: String,
    pub user_tag_ids: Vec<DbId>,
}

fn default_receiver_type() -> String {
    "User".to_string()
}

/// POST /api/annunciations/{id}/publish: fan an announcement out to tagged users.
async fn publish(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(params): Json<PublishParams>,
) -> Result<Json<FanoutReport>, AppError> {
    let report = state
        .service
        .publish_annunciation(id, &params.receiver_type, &params.user_tag_ids)
        .await?;
    Ok(Json(report))
}

/// DELETE /api/annunciations/{id}: retract the broadcast and its counters.
async fn retract(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> Result<Json<FanoutReport>, AppError> {
    Ok(Json(state.service.retract_annunciation(id).await?))
}
