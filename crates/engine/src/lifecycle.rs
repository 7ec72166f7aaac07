//! Notification read-state machine and its counter side effects.
//!
//! Transitions go through a single conditional update in the store, so the
//! precondition check and the state write cannot be split by a concurrent
//! caller. Only the caller whose update changed a row touches the counters.
//!
//! Counter failures never fail a transition: the row change stands and the
//! next recount repairs the cached value.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use notice_common::error::AppError;
use notice_common::types::{DbId, EntityRef, Notification};

use crate::counter::{CounterKey, CounterStore};
use crate::store::{CounterDelta, NotificationStore};

/// Result of a read-state transition.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub notification: Notification,
    /// False when the precondition did not hold and nothing changed.
    pub applied: bool,
}

/// Unread totals after a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recount {
    pub total: i64,
    pub bucket: Option<i64>,
}

#[derive(Clone)]
pub struct NotificationLifecycle {
    store: Arc<dyn NotificationStore>,
    counters: Arc<dyn CounterStore>,
}

impl NotificationLifecycle {
    pub fn new(store: Arc<dyn NotificationStore>, counters: Arc<dyn CounterStore>) -> Self {
        Self { store, counters }
    }

    /// Put a freshly created row into the unread state.
    ///
    /// Rows are inserted unread, so this is normally a no-op; it only bumps
    /// the counters when it actually clears a `read_at`.
    pub async fn ensure_unread(&self, notification: &mut Notification) -> Result<(), AppError> {
        if notification.is_unread() {
            return Ok(());
        }
        if self.store.mark_unread(notification.id).await? {
            notification.read_at = None;
            self.adjust(&notification.receiver(), &notification.code, CounterDelta::Increment)
                .await;
        }
        Ok(())
    }

    /// Recount the receiver's unread rows and overwrite the cached total, and
    /// the `code` bucket when given.
    pub async fn reconcile(
        &self,
        receiver: &EntityRef,
        code: Option<&str>,
    ) -> Result<Recount, AppError> {
        let total = self.store.count_unread(receiver, None).await?;
        self.counters
            .overwrite(&CounterKey::total(receiver), total)
            .await?;

        let bucket = match code {
            Some(code) => {
                let count = self.store.count_unread(receiver, Some(code)).await?;
                self.counters
                    .overwrite(&CounterKey::bucket(receiver, code), count)
                    .await?;
                Some(count)
            }
            None => None,
        };

        Ok(Recount { total, bucket })
    }

    /// [`Self::reconcile`], logging instead of failing when the counter store
    /// is unavailable.
    pub async fn reconcile_tolerant(&self, receiver: &EntityRef, code: Option<&str>) {
        if let Err(e) = self.reconcile(receiver, code).await {
            tracing::warn!(
                receiver = %receiver,
                error = %e,
                "Unread counter reconciliation failed"
            );
        }
    }

    pub async fn mark_read(&self, id: DbId, at: DateTime<Utc>) -> Result<Transition, AppError> {
        let mut notification = self.find(id).await?;
        let applied = self.store.mark_read(id, at).await?;

        if applied {
            notification.read_at = Some(at);
            self.adjust(&notification.receiver(), &notification.code, CounterDelta::Decrement)
                .await;
            tracing::info!(notification_id = id, "Notification marked read");
        } else {
            tracing::debug!(notification_id = id, "Notification already read");
        }

        Ok(Transition {
            notification,
            applied,
        })
    }

    pub async fn mark_unread(&self, id: DbId) -> Result<Transition, AppError> {
        let mut notification = self.find(id).await?;
        let applied = self.store.mark_unread(id).await?;

        if applied {
            notification.read_at = None;
            self.adjust(&notification.receiver(), &notification.code, CounterDelta::Increment)
                .await;
            tracing::info!(notification_id = id, "Notification marked unread");
        } else {
            tracing::debug!(notification_id = id, "Notification already unread");
        }

        Ok(Transition {
            notification,
            applied,
        })
    }

    /// Delete a row. An unread row decrements the counters before the
    /// receiver is reconciled.
    pub async fn destroy(&self, id: DbId) -> Result<Notification, AppError> {
        let notification = self
            .store
            .delete(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        let receiver = notification.receiver();
        if notification.is_unread() {
            self.adjust(&receiver, &notification.code, CounterDelta::Decrement)
                .await;
        }
        self.reconcile_tolerant(&receiver, Some(&notification.code))
            .await;

        tracing::info!(
            notification_id = id,
            receiver = %receiver,
            was_unread = notification.is_unread(),
            "Notification destroyed"
        );
        Ok(notification)
    }

    /// Mark every unread row of `receiver` read. Returns the number changed.
    pub async fn mark_all_read(
        &self,
        receiver: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let codes = self.store.mark_all_read(receiver, at).await?;
        let changed = codes.len() as u64;

        let distinct: BTreeSet<String> = codes.into_iter().collect();
        self.reconcile_tolerant(receiver, None).await;
        for code in &distinct {
            if let Err(e) = self.reconcile_bucket(receiver, code).await {
                tracing::warn!(receiver = %receiver, code = %code, error = %e, "Bucket reconciliation failed");
            }
        }

        tracing::info!(receiver = %receiver, changed, "Marked all notifications read");
        Ok(changed)
    }

    async fn reconcile_bucket(&self, receiver: &EntityRef, code: &str) -> Result<(), AppError> {
        let count = self.store.count_unread(receiver, Some(code)).await?;
        self.counters
            .overwrite(&CounterKey::bucket(receiver, code), count)
            .await
    }

    async fn find(&self, id: DbId) -> Result<Notification, AppError> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    /// Move the total and the category bucket of `receiver` by one.
    async fn adjust(&self, receiver: &EntityRef, code: &str, delta: CounterDelta) {
        for key in [CounterKey::total(receiver), CounterKey::bucket(receiver, code)] {
            let result = match delta {
                CounterDelta::Increment => self.counters.increment(&key).await,
                CounterDelta::Decrement => self.counters.decrement(&key).await,
            };
            if let Err(e) = result {
                tracing::warn!(key = %key, error = %e, "Unread counter update failed");
            }
        }
    }
}
