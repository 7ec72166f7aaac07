//! Delivery dispatcher.
//!
//! Decides which channels fire for a persisted notification and hands them
//! to the transports:
//! 1. A delivery job, immediate or deferred to `sending_at`. The job performs
//!    the socket broadcast at fire time.
//! 2. An email, when the receiver's settings allow it, routed through a
//!    per-notifiable-type override or the generic notifier.
//! 3. The socket broadcast itself, skipped when the receiver cannot be
//!    resolved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use notice_common::error::AppError;
use notice_common::types::{EffectiveSettings, Notification, SocketPayload};

use crate::counter::{CounterKey, CounterStore};
use crate::delivery::{
    DEFAULT_MAILER_METHOD, GENERIC_MAILER, JobQueue, MailRequest, Mailer, SocketBroadcaster,
};
use crate::registry::{NotifyRegistry, ReceiverRegistry};
use crate::settings::SettingsResolver;
use crate::store::NotificationStore;

/// Transports the dispatcher fires into.
#[derive(Clone)]
pub struct DeliveryChannels {
    pub queue: Arc<dyn JobQueue>,
    pub mailer: Arc<dyn Mailer>,
    pub broadcaster: Arc<dyn SocketBroadcaster>,
}

/// What the creation pipeline handed off for one notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub job_enqueued: bool,
    /// Deferred fire time shared by the job and the email, if any.
    pub fire_at: Option<DateTime<Utc>>,
    pub email_sent: bool,
}

#[derive(Clone)]
pub struct DeliveryDispatcher {
    store: Arc<dyn NotificationStore>,
    counters: Arc<dyn CounterStore>,
    settings: SettingsResolver,
    channels: DeliveryChannels,
    receivers: Arc<ReceiverRegistry>,
    overrides: Arc<NotifyRegistry>,
    default_send_email: bool,
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        counters: Arc<dyn CounterStore>,
        settings: SettingsResolver,
        channels: DeliveryChannels,
        default_send_email: bool,
    ) -> Self {
        Self {
            store,
            counters,
            settings,
            channels,
            receivers: Arc::new(ReceiverRegistry::new()),
            overrides: Arc::new(NotifyRegistry::new()),
            default_send_email,
        }
    }

    pub fn with_receivers(mut self, receivers: Arc<ReceiverRegistry>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn with_overrides(mut self, overrides: Arc<NotifyRegistry>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Fire the job and email channels once for a freshly created row.
    ///
    /// A failing channel is logged and reported; it never fails creation.
    pub async fn dispatch(&self, notification: &Notification, now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport {
            fire_at: notification.deferred_until(now),
            ..DispatchReport::default()
        };

        match self.schedule(notification, now).await {
            Ok(_) => report.job_enqueued = true,
            Err(e) => tracing::error!(
                notification_id = notification.id,
                error = %e,
                "Failed to enqueue delivery job"
            ),
        }

        match self.send_email(notification, now).await {
            Ok(sent) => report.email_sent = sent.is_some(),
            Err(e) => tracing::error!(
                notification_id = notification.id,
                error = %e,
                "Failed to hand off notification email"
            ),
        }

        report
    }

    /// Enqueue the delivery job. Returns the deferred fire time, if any.
    pub async fn schedule(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let fire_at = notification.deferred_until(now);
        self.channels.queue.enqueue(notification.id, fire_at).await?;
        tracing::debug!(
            notification_id = notification.id,
            fire_at = ?fire_at,
            "Delivery job enqueued"
        );
        Ok(fire_at)
    }

    /// Explicit Accept or Decline wins; Unset falls back to the process
    /// default.
    pub fn email_enabled(&self, settings: &EffectiveSettings) -> bool {
        settings.accept_email.resolve(self.default_send_email)
    }

    /// Build the mail request for a notification, honoring any override
    /// registered for its notifiable type and code.
    pub fn mail_request(&self, notification: &Notification, now: DateTime<Utc>) -> MailRequest {
        let code = notification.code.clone();
        let fire_at = notification.deferred_until(now);
        let setting = self
            .overrides
            .get(notification.notifiable_type.as_deref(), &code);

        let mut cc_emails: Vec<String> = setting
            .map(|s| s.cc_emails.clone())
            .unwrap_or_default();
        cc_emails.extend(notification.cc_emails.iter().cloned());

        let custom = setting
            .and_then(|s| s.mailer.as_deref().map(|mailer| (mailer, s)))
            .filter(|(mailer, _)| *mailer != GENERIC_MAILER);

        match custom {
            Some((handler, s)) => MailRequest {
                notification_id: notification.id,
                handler: handler.to_string(),
                method: s
                    .mailer_method
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MAILER_METHOD.to_string()),
                record_id: notification.notifiable_id.unwrap_or(notification.id),
                code,
                fire_at,
                cc_emails,
            },
            // An override naming the generic notifier only contributes cc.
            None => MailRequest {
                notification_id: notification.id,
                handler: GENERIC_MAILER.to_string(),
                method: DEFAULT_MAILER_METHOD.to_string(),
                record_id: notification.id,
                code,
                fire_at,
                cc_emails,
            },
        }
    }

    /// Hand the email to the mailer if the receiver accepts email. Returns
    /// the request sent, or `None` when email is disabled.
    pub async fn send_email(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Option<MailRequest>, AppError> {
        let settings = self
            .settings
            .resolve(&notification.receiver(), &notification.code)
            .await?;
        if !self.email_enabled(&settings) {
            tracing::debug!(notification_id = notification.id, "Email disabled for receiver");
            return Ok(None);
        }

        let request = self.mail_request(notification, now);
        self.channels.mailer.send(request.clone()).await?;
        tracing::info!(
            notification_id = notification.id,
            handler = %request.handler,
            method = %request.method,
            fire_at = ?request.fire_at,
            "Notification email queued"
        );
        Ok(Some(request))
    }

    /// Broadcast to the receiver's live channel and stamp `sent_at`.
    ///
    /// Returns the payload published, or `None` when the receiver could not
    /// be resolved.
    pub async fn send_to_socket(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Option<SocketPayload>, AppError> {
        let receiver = notification.receiver();
        if self.receivers.resolve(&receiver).await?.is_none() {
            tracing::debug!(
                notification_id = notification.id,
                receiver = %receiver,
                "Receiver unresolved, skipping socket broadcast"
            );
            return Ok(None);
        }

        let count = match self.counters.read(&CounterKey::total(&receiver)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(receiver = %receiver, error = %e, "Counter read failed, recounting");
                self.store.count_unread(&receiver, None).await?
            }
        };
        let settings = self.settings.resolve(&receiver, &notification.code).await?;

        let payload = SocketPayload {
            id: notification.id,
            body: notification.body.clone().unwrap_or_default(),
            count,
            link: notification.link.clone().unwrap_or_default(),
            showtime: settings.showtime,
        };
        let listeners = self
            .channels
            .broadcaster
            .publish(&receiver.channel(), &payload)
            .await?;
        self.store.mark_sent(notification.id, now).await?;

        tracing::info!(
            notification_id = notification.id,
            channel = %receiver.channel(),
            count,
            listeners,
            "Notification broadcast"
        );
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use crate::delivery::{MemoryBroadcaster, MemoryJobQueue, MemoryMailer};
    use crate::registry::{NotifySetting, StaticLookup};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use notice_common::types::{AcceptEmail, DEFAULT_CODE, EntityRef, NewNotification};

    struct Fixture {
        store: Arc<MemoryStore>,
        counters: Arc<MemoryCounterStore>,
        queue: Arc<MemoryJobQueue>,
        mailer: Arc<MemoryMailer>,
        broadcaster: Arc<MemoryBroadcaster>,
        dispatcher: DeliveryDispatcher,
    }

    fn fixture(default_send_email: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let mailer = Arc::new(MemoryMailer::default());
        let broadcaster = Arc::new(MemoryBroadcaster::default());
        let channels = DeliveryChannels {
            queue: queue.clone(),
            mailer: mailer.clone(),
            broadcaster: broadcaster.clone(),
        };
        let receivers = ReceiverRegistry::new().register(
            "User",
            Arc::new(StaticLookup::new("User").with(1, Some("ada@example.com"))),
        );
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            counters.clone(),
            SettingsResolver::new(store.clone()),
            channels,
            default_send_email,
        )
        .with_receivers(Arc::new(receivers));
        Fixture {
            store,
            counters,
            queue,
            mailer,
            broadcaster,
            dispatcher,
        }
    }

    fn settings(accept_email: AcceptEmail) -> EffectiveSettings {
        EffectiveSettings {
            accept_email,
            ..EffectiveSettings::default()
        }
    }

    #[test]
    fn test_email_enabled_truth_table() {
        let fx_off = fixture(false);
        let fx_on = fixture(true);

        assert!(fx_off.dispatcher.email_enabled(&settings(AcceptEmail::Accept)));
        assert!(!fx_on.dispatcher.email_enabled(&settings(AcceptEmail::Decline)));
        assert!(!fx_off.dispatcher.email_enabled(&settings(AcceptEmail::Unset)));
        assert!(fx_on.dispatcher.email_enabled(&settings(AcceptEmail::Unset)));
    }

    #[tokio::test]
    async fn test_deferred_delivery_waits_for_sending_at() {
        let fx = fixture(true);
        let now = Utc::now();
        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.sending_at = Some(now + Duration::hours(1));
        let notification = fx.store.insert(&new).await.unwrap();

        let report = fx.dispatcher.dispatch(&notification, now).await;
        assert!(report.job_enqueued);
        assert!(report.email_sent);
        assert_eq!(report.fire_at, new.sending_at);

        let just_before = now + Duration::minutes(59);
        assert!(fx.queue.jobs.take_due(just_before).await.is_empty());
        assert!(fx.mailer.outbox.take_due(just_before).await.is_empty());

        let at = now + Duration::hours(1);
        assert_eq!(fx.queue.jobs.take_due(at).await, vec![notification.id]);
        assert_eq!(fx.mailer.outbox.take_due(at).await.len(), 1);
    }

    #[tokio::test]
    async fn test_past_sending_at_fires_immediately() {
        let fx = fixture(false);
        let now = Utc::now();
        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.sending_at = Some(now - Duration::minutes(5));
        let notification = fx.store.insert(&new).await.unwrap();

        let fire_at = fx.dispatcher.schedule(&notification, now).await.unwrap();
        assert!(fire_at.is_none());
        assert_eq!(fx.queue.jobs.take_due(now).await, vec![notification.id]);
    }

    #[tokio::test]
    async fn test_declined_email_is_not_sent() {
        let fx = fixture(true);
        let receiver = EntityRef::new("User", 1);
        fx.store
            .put_setting(&receiver, DEFAULT_CODE, Some(false), None)
            .await;
        let notification = fx.store.insert(&NewNotification::to(receiver)).await.unwrap();

        let sent = fx.dispatcher.send_email(&notification, Utc::now()).await.unwrap();
        assert!(sent.is_none());
        assert!(fx.mailer.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_mail_request_uses_override() {
        let overrides = NotifyRegistry::new().register(
            "Order",
            "paid",
            NotifySetting {
                mailer: Some("order_mailer".to_string()),
                mailer_method: None,
                cc_emails: vec!["ops@example.com".to_string()],
            },
        );
        let fx = fixture(true);
        let dispatcher = fx.dispatcher.clone().with_overrides(Arc::new(overrides));

        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.notifiable = Some(EntityRef::new("Order", 77));
        new.code = Some("paid".to_string());
        new.cc_emails = vec!["buyer@example.com".to_string()];
        let notification = fx.store.insert(&new).await.unwrap();

        let request = dispatcher.mail_request(&notification, Utc::now());
        assert_eq!(request.handler, "order_mailer");
        assert_eq!(request.method, DEFAULT_MAILER_METHOD);
        assert_eq!(request.record_id, 77);
        assert_eq!(request.cc_emails, vec!["ops@example.com", "buyer@example.com"]);
    }

    #[tokio::test]
    async fn test_mail_request_falls_back_to_generic_notifier() {
        let fx = fixture(true);
        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.notifiable = Some(EntityRef::new("Order", 77));
        new.code = Some("shipped".to_string());
        let notification = fx.store.insert(&new).await.unwrap();

        let request = fx.dispatcher.mail_request(&notification, Utc::now());
        assert!(request.is_generic());
        assert_eq!(request.record_id, notification.id);
        assert_eq!(request.code, "shipped");
    }

    #[tokio::test]
    async fn test_override_naming_generic_notifier_addresses_notification() {
        let overrides = NotifyRegistry::new().register(
            "Order",
            "paid",
            NotifySetting {
                mailer: Some(GENERIC_MAILER.to_string()),
                mailer_method: Some("deliver_now".to_string()),
                cc_emails: vec!["ops@example.com".to_string()],
            },
        );
        let fx = fixture(true);
        let dispatcher = fx.dispatcher.clone().with_overrides(Arc::new(overrides));

        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.notifiable = Some(EntityRef::new("Order", 77));
        new.code = Some("paid".to_string());
        let notification = fx.store.insert(&new).await.unwrap();

        let request = dispatcher.mail_request(&notification, Utc::now());
        assert!(request.is_generic());
        assert_eq!(request.method, DEFAULT_MAILER_METHOD);
        assert_eq!(request.record_id, notification.id);
        assert_eq!(request.cc_emails, vec!["ops@example.com"]);
    }

    #[tokio::test]
    async fn test_socket_skips_unresolved_receiver() {
        let fx = fixture(false);
        let notification = fx
            .store
            .insert(&NewNotification::to(EntityRef::new("User", 404)))
            .await
            .unwrap();

        let payload = fx
            .dispatcher
            .send_to_socket(&notification, Utc::now())
            .await
            .unwrap();
        assert!(payload.is_none());
        assert!(fx.broadcaster.published().await.is_empty());
        let stored = fx.store.find(notification.id).await.unwrap().unwrap();
        assert!(stored.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_socket_payload_carries_live_count() {
        let fx = fixture(false);
        let receiver = EntityRef::new("User", 1);
        fx.store
            .put_setting(&receiver, DEFAULT_CODE, None, Some(true))
            .await;
        let mut new = NewNotification::to(receiver.clone());
        new.body = Some("Your order shipped".to_string());
        new.link = Some("/orders/77".to_string());
        let notification = fx.store.insert(&new).await.unwrap();
        fx.counters
            .overwrite(&CounterKey::total(&receiver), 3)
            .await
            .unwrap();

        let now = Utc::now();
        let payload = fx
            .dispatcher
            .send_to_socket(&notification, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.count, 3);
        assert_eq!(payload.showtime, Some(true));

        let published = fx.broadcaster.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "User:1");
        assert_eq!(published[0].1.body, "Your order shipped");

        let stored = fx.store.find(notification.id).await.unwrap().unwrap();
        assert_eq!(stored.sent_at, Some(now));
    }

    #[tokio::test]
    async fn test_socket_count_falls_back_to_recount() {
        let fx = fixture(false);
        let receiver = EntityRef::new("User", 1);
        let notification = fx
            .store
            .insert(&NewNotification::to(receiver))
            .await
            .unwrap();
        fx.counters.set_unavailable(true);

        let payload = fx
            .dispatcher
            .send_to_socket(&notification, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.count, 1);
    }
}
