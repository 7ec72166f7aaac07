//! Durable store seams for notifications, settings and tag memberships.
//!
//! [`postgres::PgStore`] is the production implementation;
//! [`memory::MemoryStore`] backs unit tests and local experiments.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use notice_common::error::AppError;
use notice_common::types::{
    Annunciate, DbId, EntityRef, NewNotification, Notification, NotificationSetting, ReadFilter,
    SortOrder, UserTagged,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Largest page a listing query may request.
pub const MAX_PAGE_SIZE: i64 = 200;

/// Direction of a fan-out counter adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDelta {
    Increment,
    Decrement,
}

/// Filters for listing a receiver's notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: ReadFilter,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: ReadFilter::All,
            code: None,
            sort: SortOrder::default(),
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl ListQuery {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if self.offset < 0 {
            return Err(AppError::Validation("offset must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Persistence of notification rows and their state fields.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError>;

    async fn find(&self, id: DbId) -> Result<Option<Notification>, AppError>;

    /// Delete a row, returning it as it was at deletion time.
    async fn delete(&self, id: DbId) -> Result<Option<Notification>, AppError>;

    /// Set `read_at` only if the row is unread. Returns whether it changed.
    async fn mark_read(&self, id: DbId, at: DateTime<Utc>) -> Result<bool, AppError>;

    /// Clear `read_at` only if the row is read. Returns whether it changed.
    async fn mark_unread(&self, id: DbId) -> Result<bool, AppError>;

    /// Mark every unread row of a receiver read. Returns the code of each
    /// changed row.
    async fn mark_all_read(
        &self,
        receiver: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError>;

    async fn mark_sent(&self, id: DbId, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Ground-truth unread count, optionally restricted to one category.
    async fn count_unread(&self, receiver: &EntityRef, code: Option<&str>)
    -> Result<i64, AppError>;

    async fn list(
        &self,
        receiver: &EntityRef,
        query: &ListQuery,
    ) -> Result<Vec<Notification>, AppError>;

    /// Every receiver that owns at least one notification.
    async fn receivers(&self) -> Result<Vec<EntityRef>, AppError>;
}

/// Notification-setting rows.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Category-specific row if present, otherwise the `"default"` row.
    async fn find_setting(
        &self,
        receiver: &EntityRef,
        code: &str,
    ) -> Result<Option<NotificationSetting>, AppError>;
}

/// Annunciate rows and tag memberships.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn annunciates(&self, annunciation_id: DbId) -> Result<Vec<Annunciate>, AppError>;

    /// Membership rows of the given tags.
    async fn tag_members(&self, user_tag_ids: &[DbId]) -> Result<Vec<UserTagged>, AppError>;

    /// Open a transaction for one publish or retract.
    async fn begin_fanout(&self) -> Result<Box<dyn FanoutTx>, AppError>;
}

/// Writes of one publish or retract.
///
/// Nothing is visible to other callers until [`commit`](FanoutTx::commit);
/// dropping the transaction uncommitted discards every write.
#[async_trait]
pub trait FanoutTx: Send {
    async fn insert_annunciates(
        &mut self,
        annunciation_id: DbId,
        receiver_type: &str,
        user_tag_ids: &[DbId],
    ) -> Result<Vec<Annunciate>, AppError>;

    async fn delete_annunciates(&mut self, annunciation_id: DbId) -> Result<u64, AppError>;

    /// Adjust `bucket` on the default-scope setting row of every member of
    /// `user_tag_id` with `receiver_type`, skipping `excluded` users.
    ///
    /// Increments create the row and bucket when absent; decrements floor at
    /// zero. Returns the number of rows adjusted.
    async fn adjust_tag_counter(
        &mut self,
        user_tag_id: DbId,
        receiver_type: &str,
        excluded: &HashSet<DbId>,
        bucket: &str,
        delta: CounterDelta,
    ) -> Result<u64, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}
