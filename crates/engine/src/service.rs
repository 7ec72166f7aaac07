//! Notification service.
//!
//! Entry point for everything that creates, transitions or destroys
//! notifications. Each operation runs its steps explicitly and in a fixed
//! order; nothing is attached as an implicit hook.
//!
//! Creation pipeline:
//! 1. Persist the row.
//! 2. Ensure it is unread and reconcile the receiver's counters by recount.
//! 3. Enqueue the delivery job (immediate or deferred to `sending_at`).
//! 4. Hand the email to the mailer if the receiver accepts email.
//!
//! The socket broadcast runs later, from the delivery job ([`NotificationService::deliver`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use notice_common::error::AppError;
use notice_common::types::{DbId, EntityRef, NewNotification, Notification, SocketPayload};

use crate::counter::{CounterKey, CounterStore};
use crate::dispatcher::{DeliveryChannels, DeliveryDispatcher, DispatchReport};
use crate::fanout::{AnnunciationFanout, FanoutReport};
use crate::lifecycle::{NotificationLifecycle, Recount, Transition};
use crate::registry::{NotifyRegistry, ReceiverRegistry};
use crate::settings::SettingsResolver;
use crate::store::{ListQuery, NotificationStore, SettingsStore, TagStore};

/// A created notification and what was dispatched for it.
#[derive(Debug, Clone, Serialize)]
pub struct Created {
    pub notification: Notification,
    pub dispatch: DispatchReport,
}

/// Where an unread count was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountSource {
    Cache,
    Recount,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreadCount {
    pub receiver: EntityRef,
    pub count: i64,
    pub source: CountSource,
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    counters: Arc<dyn CounterStore>,
    lifecycle: NotificationLifecycle,
    dispatcher: DeliveryDispatcher,
    fanout: Arc<AnnunciationFanout>,
}

impl NotificationService {
    /// Build the service over one backing store that provides every seam.
    pub fn new<S>(
        store: Arc<S>,
        counters: Arc<dyn CounterStore>,
        channels: DeliveryChannels,
        default_send_email: bool,
    ) -> Self
    where
        S: NotificationStore + SettingsStore + TagStore + 'static,
    {
        let notifications: Arc<dyn NotificationStore> = store.clone();
        let settings: Arc<dyn SettingsStore> = store.clone();
        let tags: Arc<dyn TagStore> = store;

        Self {
            lifecycle: NotificationLifecycle::new(notifications.clone(), counters.clone()),
            dispatcher: DeliveryDispatcher::new(
                notifications.clone(),
                counters.clone(),
                SettingsResolver::new(settings),
                channels,
                default_send_email,
            ),
            fanout: Arc::new(AnnunciationFanout::new(tags)),
            store: notifications,
            counters,
        }
    }

    pub fn with_receivers(mut self, receivers: Arc<ReceiverRegistry>) -> Self {
        self.dispatcher = self.dispatcher.with_receivers(receivers);
        self
    }

    pub fn with_overrides(mut self, overrides: Arc<NotifyRegistry>) -> Self {
        self.dispatcher = self.dispatcher.with_overrides(overrides);
        self
    }

    pub fn lifecycle(&self) -> &NotificationLifecycle {
        &self.lifecycle
    }

    pub async fn create(&self, new: NewNotification) -> Result<Created, AppError> {
        validate(&new)?;

        let mut notification = self.store.insert(&new).await?;
        let receiver = notification.receiver();

        self.lifecycle.ensure_unread(&mut notification).await?;
        self.lifecycle
            .reconcile_tolerant(&receiver, Some(&notification.code))
            .await;

        let dispatch = self.dispatcher.dispatch(&notification, Utc::now()).await;

        tracing::info!(
            notification_id = notification.id,
            receiver = %receiver,
            code = %notification.code,
            deferred = dispatch.fire_at.is_some(),
            "Notification created"
        );

        Ok(Created {
            notification,
            dispatch,
        })
    }

    pub async fn destroy(&self, id: DbId) -> Result<Notification, AppError> {
        self.lifecycle.destroy(id).await
    }

    pub async fn mark_read(&self, id: DbId) -> Result<Transition, AppError> {
        self.lifecycle.mark_read(id, Utc::now()).await
    }

    pub async fn mark_unread(&self, id: DbId) -> Result<Transition, AppError> {
        self.lifecycle.mark_unread(id).await
    }

    pub async fn mark_all_read(&self, receiver: &EntityRef) -> Result<u64, AppError> {
        self.lifecycle.mark_all_read(receiver, Utc::now()).await
    }

    pub async fn list(
        &self,
        receiver: &EntityRef,
        query: &ListQuery,
    ) -> Result<Vec<Notification>, AppError> {
        query.validate()?;
        self.store.list(receiver, query).await
    }

    /// Cached total, or a recount when the counter store is unavailable.
    pub async fn unread_count(&self, receiver: &EntityRef) -> Result<UnreadCount, AppError> {
        let (count, source) = match self.counters.read(&CounterKey::total(receiver)).await {
            Ok(count) => (count, CountSource::Cache),
            Err(e) => {
                tracing::warn!(receiver = %receiver, error = %e, "Counter read failed, recounting");
                (
                    self.store.count_unread(receiver, None).await?,
                    CountSource::Recount,
                )
            }
        };
        Ok(UnreadCount {
            receiver: receiver.clone(),
            count,
            source,
        })
    }

    pub async fn reconcile(&self, receiver: &EntityRef) -> Result<Recount, AppError> {
        self.lifecycle.reconcile(receiver, None).await
    }

    /// Run a fired delivery job: broadcast the notification to its receiver.
    ///
    /// A row destroyed before its job fired is skipped.
    pub async fn deliver(
        &self,
        notification_id: DbId,
        now: DateTime<Utc>,
    ) -> Result<Option<SocketPayload>, AppError> {
        let Some(notification) = self.store.find(notification_id).await? else {
            tracing::debug!(notification_id, "Notification gone before delivery");
            return Ok(None);
        };
        self.dispatcher.send_to_socket(&notification, now).await
    }

    pub async fn publish_annunciation(
        &self,
        annunciation_id: DbId,
        receiver_type: &str,
        user_tag_ids: &[DbId],
    ) -> Result<FanoutReport, AppError> {
        if receiver_type.trim().is_empty() {
            return Err(AppError::Validation("receiver_type is required".to_string()));
        }
        self.fanout
            .publish(annunciation_id, receiver_type, user_tag_ids)
            .await
    }

    pub async fn retract_annunciation(&self, annunciation_id: DbId) -> Result<FanoutReport, AppError> {
        self.fanout.retract(annunciation_id).await
    }
}

fn validate(new: &NewNotification) -> Result<(), AppError> {
    if new.receiver.kind.trim().is_empty() {
        return Err(AppError::Validation("receiver.kind is required".to_string()));
    }
    if let Some(sender) = &new.sender
        && sender.kind.trim().is_empty()
    {
        return Err(AppError::Validation("sender.kind must not be empty".to_string()));
    }
    if let Some(email) = new.cc_emails.iter().find(|e| !e.contains('@')) {
        return Err(AppError::Validation(format!("Invalid cc email '{}'", email)));
    }
    Ok(())
}
