pub mod annunciations;
pub mod health;
pub mod notifications;
pub mod receivers;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
        .merge(receivers::router())
        .merge(annunciations::router())
        .with_state(state)
}
