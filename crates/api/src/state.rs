//! Shared application state for the Axum API server.

use notice_common::config::AppConfig;
use notice_engine::NotificationService;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub service: NotificationService,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(service: NotificationService, config: AppConfig) -> Self {
        Self { service, config }
    }
}
