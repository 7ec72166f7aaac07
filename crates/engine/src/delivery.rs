//! Delivery transport seams used by the dispatcher.
//!
//! The engine decides *what* fires and *when*; the transports in
//! `notice-notifier` decide how. In-process implementations live here so
//! dispatcher behaviour can be observed without Redis or SMTP.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use notice_common::error::AppError;
use notice_common::types::{DbId, SocketPayload};

/// Handler name of the generic notifier mailer.
pub const GENERIC_MAILER: &str = "notifier";

/// Entry point used when an override names a mailer but no method.
pub const DEFAULT_MAILER_METHOD: &str = "notify";

/// One email to be delivered by a mail handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRequest {
    pub notification_id: DbId,
    pub handler: String,
    pub method: String,
    /// The notifiable id for custom handlers, the notification id for the
    /// generic notifier.
    pub record_id: DbId,
    pub code: String,
    /// Deliver no earlier than this instant.
    pub fire_at: Option<DateTime<Utc>>,
    pub cc_emails: Vec<String>,
}

impl MailRequest {
    pub fn is_generic(&self) -> bool {
        self.handler == GENERIC_MAILER
    }

    /// The same email addressed to the generic notifier by notification id.
    pub fn to_generic(&self) -> MailRequest {
        MailRequest {
            handler: GENERIC_MAILER.to_string(),
            method: DEFAULT_MAILER_METHOD.to_string(),
            record_id: self.notification_id,
            ..self.clone()
        }
    }
}

/// Asynchronous delivery job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue delivery of `notification_id`, deferred to `fire_at` if given.
    async fn enqueue(
        &self,
        notification_id: DbId,
        fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
}

/// Mail transport entry point.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, request: MailRequest) -> Result<(), AppError>;
}

/// Live socket broadcast.
#[async_trait]
pub trait SocketBroadcaster: Send + Sync {
    /// Publish `payload` on `channel`. Returns the number of live listeners
    /// that received it.
    async fn publish(&self, channel: &str, payload: &SocketPayload) -> Result<usize, AppError>;
}

/// Items held until their fire time.
pub struct DelayQueue<T> {
    items: Mutex<Vec<(Option<DateTime<Utc>>, T)>>,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone + Send> DelayQueue<T> {
    pub async fn push(&self, item: T, fire_at: Option<DateTime<Utc>>) {
        self.items.lock().await.push((fire_at, item));
    }

    /// Remove and return every item due at `now`, in enqueue order.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<T> {
        let mut items = self.items.lock().await;
        let (due, pending): (Vec<_>, Vec<_>) = items
            .drain(..)
            .partition(|(fire_at, _)| fire_at.is_none_or(|at| at <= now));
        *items = pending;
        due.into_iter().map(|(_, item)| item).collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-process [`JobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    pub jobs: DelayQueue<DbId>,
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        notification_id: DbId,
        fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.jobs.push(notification_id, fire_at).await;
        Ok(())
    }
}

/// In-process [`Mailer`].
#[derive(Default)]
pub struct MemoryMailer {
    pub outbox: DelayQueue<MailRequest>,
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, request: MailRequest) -> Result<(), AppError> {
        let fire_at = request.fire_at;
        self.outbox.push(request, fire_at).await;
        Ok(())
    }
}

/// In-process [`SocketBroadcaster`] that records every publish.
#[derive(Default)]
pub struct MemoryBroadcaster {
    published: Mutex<Vec<(String, SocketPayload)>>,
}

impl MemoryBroadcaster {
    pub async fn published(&self) -> Vec<(String, SocketPayload)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl SocketBroadcaster for MemoryBroadcaster {
    async fn publish(&self, channel: &str, payload: &SocketPayload) -> Result<usize, AppError> {
        self.published
            .lock()
            .await
            .push((channel.to_string(), payload.clone()));
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_delay_queue_holds_future_items() {
        let queue = DelayQueue::default();
        let now = Utc::now();
        queue.push(1, None).await;
        queue.push(2, Some(now + Duration::hours(1))).await;
        queue.push(3, Some(now - Duration::seconds(1))).await;

        assert_eq!(queue.take_due(now).await, vec![1, 3]);
        assert_eq!(queue.len().await, 1);
        assert!(queue.take_due(now + Duration::minutes(59)).await.is_empty());
        assert_eq!(queue.take_due(now + Duration::hours(1)).await, vec![2]);
        assert!(queue.is_empty().await);
    }
}
