//! Queue workers.
//!
//! [`JobWorker`] fires due delivery jobs (the socket broadcast step) and
//! [`MailWorker`] renders and sends due emails. Both poll on a fixed interval,
//! claim at most one batch per tick, and stop when their cancellation token
//! fires. Transient failures are re-queued after [`RETRY_DELAY_SECS`];
//! anything else is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use notice_common::error::AppError;
use notice_engine::NotificationService;
use notice_engine::delivery::{JobQueue, MailRequest, Mailer};

use crate::mail::{MailHandlerRegistry, MailTransport};
use crate::queue::{DueJobs, DueMail};

/// Delay before a transiently failed job or email is retried.
pub const RETRY_DELAY_SECS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

/// Counts from one worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
}

fn retry_at(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::seconds(RETRY_DELAY_SECS)
}

pub struct JobWorker<Q> {
    queue: Arc<Q>,
    service: NotificationService,
    options: WorkerOptions,
}

impl<Q> JobWorker<Q>
where
    Q: DueJobs + JobQueue + 'static,
{
    pub fn new(queue: Arc<Q>, service: NotificationService, options: WorkerOptions) -> Self {
        Self {
            queue,
            service,
            options,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        let ids = self.queue.claim_due(now, self.options.batch_size).await?;
        let mut summary = TickSummary {
            claimed: ids.len(),
            ..TickSummary::default()
        };

        for id in ids {
            match self.service.deliver(id, now).await {
                Ok(Some(_)) => summary.delivered += 1,
                Ok(None) => summary.skipped += 1,
                Err(e) if e.is_transient() => {
                    tracing::warn!(notification_id = id, error = %e, "Delivery failed, retrying");
                    self.queue.enqueue(id, Some(retry_at(now))).await?;
                    summary.retried += 1;
                }
                Err(e) => {
                    tracing::error!(notification_id = id, error = %e, "Delivery failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_loop("Job worker", self.options, cancel, |now| self.tick(now)).await;
    }
}

pub struct MailWorker<Q> {
    queue: Arc<Q>,
    handlers: MailHandlerRegistry,
    transport: Arc<dyn MailTransport>,
    options: WorkerOptions,
}

impl<Q> MailWorker<Q>
where
    Q: DueMail + Mailer + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        handlers: MailHandlerRegistry,
        transport: Arc<dyn MailTransport>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            handlers,
            transport,
            options,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        let requests = self.queue.claim_due(now, self.options.batch_size).await?;
        let mut summary = TickSummary {
            claimed: requests.len(),
            ..TickSummary::default()
        };

        for request in requests {
            let notification_id = request.notification_id;
            let mail = match self.handlers.render(&request).await {
                Ok(Some(mail)) => mail,
                Ok(None) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(notification_id, error = %e, "Mail render failed, retrying");
                    self.requeue(request, now).await?;
                    summary.retried += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        notification_id,
                        handler = %request.handler,
                        error = %e,
                        "Mail render failed"
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            match self.transport.deliver(&mail).await {
                Ok(()) => summary.delivered += 1,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(notification_id, error = %e, "Mail send failed, retrying");
                    self.requeue(request, now).await?;
                    summary.retried += 1;
                }
                Err(e) => {
                    tracing::error!(notification_id, error = %e, "Mail send failed permanently");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn requeue(&self, mut request: MailRequest, now: DateTime<Utc>) -> Result<(), AppError> {
        request.fire_at = Some(retry_at(now));
        self.queue.send(request).await
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_loop("Mail worker", self.options, cancel, |now| self.tick(now)).await;
    }
}

/// Poll `tick` until `cancel` fires.
async fn run_loop<'a, F, Fut>(name: &str, options: WorkerOptions, cancel: CancellationToken, tick: F)
where
    F: Fn(DateTime<Utc>) -> Fut + 'a,
    Fut: std::future::Future<Output = Result<TickSummary, AppError>> + 'a,
{
    tracing::info!(
        worker = name,
        poll_interval_ms = options.poll_interval.as_millis() as u64,
        batch_size = options.batch_size,
        "Worker started"
    );

    let mut interval = tokio::time::interval(options.poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(worker = name, "Worker stopping");
                break;
            }
            _ = interval.tick() => {
                match tick(Utc::now()).await {
                    Ok(summary) if summary.claimed > 0 => tracing::debug!(
                        worker = name,
                        claimed = summary.claimed,
                        delivered = summary.delivered,
                        skipped = summary.skipped,
                        retried = summary.retried,
                        failed = summary.failed,
                        "Worker tick"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(worker = name, error = %e, "Worker tick failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{MailError, MailHandler, OutgoingMail, standard_handlers};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use notice_common::types::{EntityRef, NewNotification};
    use notice_engine::counter::MemoryCounterStore;
    use notice_engine::delivery::{MemoryBroadcaster, MemoryJobQueue, MemoryMailer};
    use notice_engine::dispatcher::DeliveryChannels;
    use notice_engine::registry::{NotifyRegistry, NotifySetting, ReceiverRegistry, StaticLookup};
    use notice_engine::store::MemoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
            self.sent.lock().await.push(mail.clone());
            Ok(())
        }
    }

    /// Handler whose backing store is down.
    struct UnavailableHandler;

    #[async_trait]
    impl MailHandler for UnavailableHandler {
        async fn render(&self, _request: &MailRequest) -> Result<Option<OutgoingMail>, AppError> {
            Err(AppError::Queue("store unavailable".to_string()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryJobQueue>,
        mailer: Arc<MemoryMailer>,
        broadcaster: Arc<MemoryBroadcaster>,
        receivers: Arc<ReceiverRegistry>,
        service: NotificationService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let mailer = Arc::new(MemoryMailer::default());
        let broadcaster = Arc::new(MemoryBroadcaster::default());
        let receivers = Arc::new(ReceiverRegistry::new().register(
            "User",
            Arc::new(
                StaticLookup::new("User")
                    .with(1, Some("ada@example.com"))
                    .with(2, Some("bob@example.com")),
            ),
        ));
        let service = NotificationService::new(
            store.clone(),
            Arc::new(MemoryCounterStore::new()),
            DeliveryChannels {
                queue: queue.clone(),
                mailer: mailer.clone(),
                broadcaster: broadcaster.clone(),
            },
            true,
        )
        .with_receivers(receivers.clone());
        Fixture {
            store,
            queue,
            mailer,
            broadcaster,
            receivers,
            service,
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
        }
    }

    fn mail_worker(fx: &Fixture, transport: Arc<RecordingTransport>) -> MailWorker<MemoryMailer> {
        let handlers = standard_handlers(fx.store.clone(), fx.receivers.clone());
        MailWorker::new(fx.mailer.clone(), handlers, transport, options())
    }

    #[tokio::test]
    async fn test_job_worker_broadcasts_due_jobs() {
        let fx = fixture();
        fx.service
            .create(NewNotification::to(EntityRef::new("User", 1)))
            .await
            .unwrap();

        let worker = JobWorker::new(fx.queue.clone(), fx.service.clone(), options());
        let summary = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(fx.broadcaster.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_job_worker_holds_deferred_jobs() {
        let fx = fixture();
        let now = Utc::now();
        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.sending_at = Some(now + ChronoDuration::hours(1));
        fx.service.create(new).await.unwrap();

        let worker = JobWorker::new(fx.queue.clone(), fx.service.clone(), options());
        assert_eq!(worker.tick(now).await.unwrap().claimed, 0);
        assert!(fx.broadcaster.published().await.is_empty());

        let summary = worker.tick(now + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(summary.delivered, 1);
    }

    #[tokio::test]
    async fn test_job_worker_skips_unresolved_receivers() {
        let fx = fixture();
        fx.service
            .create(NewNotification::to(EntityRef::new("Group", 9)))
            .await
            .unwrap();

        let worker = JobWorker::new(fx.queue.clone(), fx.service.clone(), options());
        let summary = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(fx.broadcaster.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_mail_worker_sends_rendered_email() {
        let fx = fixture();
        let mut new = NewNotification::to(EntityRef::new("User", 1));
        new.title = Some("Welcome".to_string());
        fx.service.create(new).await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let worker = mail_worker(&fx, transport.clone());
        let summary = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(summary.delivered, 1);

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject, "Welcome");
    }

    #[tokio::test]
    async fn test_mail_worker_requeues_transient_failures() {
        let fx = fixture();
        fx.service
            .create(NewNotification::to(EntityRef::new("User", 1)))
            .await
            .unwrap();

        let handlers = MailHandlerRegistry::new().register(
            notice_engine::delivery::GENERIC_MAILER,
            Arc::new(UnavailableHandler),
        );
        let worker = MailWorker::new(
            fx.mailer.clone(),
            handlers,
            Arc::new(RecordingTransport::default()),
            options(),
        );
        let now = Utc::now();
        let summary = worker.tick(now).await.unwrap();
        assert_eq!(summary.retried, 1);

        assert!(fx.mailer.outbox.take_due(now).await.is_empty());
        let retry = fx
            .mailer
            .outbox
            .take_due(now + ChronoDuration::seconds(RETRY_DELAY_SECS))
            .await;
        assert_eq!(retry.len(), 1);
    }

    /// Creates an email for User:2, then an "Order paid" email for User:1
    /// whose notifiable id equals the first notification's id.
    async fn overridden_order_mail(fx: &Fixture, mailer: &str) -> Vec<OutgoingMail> {
        let overrides = NotifyRegistry::new().register(
            "Order",
            "paid",
            NotifySetting {
                mailer: Some(mailer.to_string()),
                mailer_method: None,
                cc_emails: vec!["ops@example.com".to_string()],
            },
        );
        let service = fx.service.clone().with_overrides(Arc::new(overrides));

        let mut other = NewNotification::to(EntityRef::new("User", 2));
        other.title = Some("Weekly digest".to_string());
        let other = service.create(other).await.unwrap().notification;

        let mut paid = NewNotification::to(EntityRef::new("User", 1));
        paid.notifiable = Some(EntityRef::new("Order", other.id));
        paid.code = Some("paid".to_string());
        paid.title = Some("Order paid".to_string());
        let created = service.create(paid).await.unwrap();
        assert!(created.dispatch.email_sent);

        let transport = Arc::new(RecordingTransport::default());
        let summary = mail_worker(fx, transport.clone())
            .tick(Utc::now())
            .await
            .unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 0);

        transport.sent.lock().await.clone()
    }

    #[tokio::test]
    async fn test_unregistered_override_mailer_uses_generic_notifier() {
        let fx = fixture();
        let sent = overridden_order_mail(&fx, "order_mailer").await;

        let paid = sent.iter().find(|m| m.subject == "Order paid").unwrap();
        assert_eq!(paid.to, "ada@example.com");
        assert_eq!(paid.cc, vec!["ops@example.com"]);
        let digest = sent.iter().find(|m| m.subject == "Weekly digest").unwrap();
        assert_eq!(digest.to, "bob@example.com");
    }

    #[tokio::test]
    async fn test_override_naming_generic_notifier_keeps_receiver() {
        let fx = fixture();
        let sent = overridden_order_mail(&fx, notice_engine::delivery::GENERIC_MAILER).await;

        let to_ada: Vec<_> = sent.iter().filter(|m| m.to == "ada@example.com").collect();
        assert_eq!(to_ada.len(), 1);
        assert_eq!(to_ada[0].subject, "Order paid");
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let fx = fixture();
        let worker = JobWorker::new(fx.queue.clone(), fx.service.clone(), options());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
