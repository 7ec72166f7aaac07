//! HTTP surface over the notification service.
//!
//! Endpoints:
//! - `POST   /api/notifications` create and dispatch a notification
//! - `DELETE /api/notifications/{id}`
//! - `POST   /api/notifications/{id}/read` and `/unread`
//! - `GET    /api/receivers/{kind}/{id}/notifications`
//! - `GET    /api/receivers/{kind}/{id}/unread_count`
//! - `POST   /api/receivers/{kind}/{id}/read_all`
//! - `POST   /api/annunciations/{id}/publish`
//! - `DELETE /api/annunciations/{id}`

pub mod routes;
pub mod state;
