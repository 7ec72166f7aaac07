//! Built-in mail handlers.

use std::sync::Arc;

use async_trait::async_trait;

use notice_common::error::AppError;
use notice_engine::delivery::{DEFAULT_MAILER_METHOD, GENERIC_MAILER, MailRequest};
use notice_engine::registry::ReceiverRegistry;
use notice_engine::store::NotificationStore;

use super::{MailHandler, MailHandlerRegistry, OutgoingMail};

/// Subject used when a notification carries no title.
const FALLBACK_SUBJECT: &str = "You have a new notification";

/// Handlers the worker serves: the generic notifier, which also takes every
/// request whose named handler is not registered.
pub fn standard_handlers(
    store: Arc<dyn NotificationStore>,
    receivers: Arc<ReceiverRegistry>,
) -> MailHandlerRegistry {
    MailHandlerRegistry::new().register(
        GENERIC_MAILER,
        Arc::new(GenericNotifierMail::new(store, receivers)),
    )
}

/// The generic notifier: emails a notification's own title, body and link
/// to its receiver. Always addressed by the request's notification id.
pub struct GenericNotifierMail {
    store: Arc<dyn NotificationStore>,
    receivers: Arc<ReceiverRegistry>,
}

impl GenericNotifierMail {
    pub fn new(store: Arc<dyn NotificationStore>, receivers: Arc<ReceiverRegistry>) -> Self {
        Self { store, receivers }
    }
}

#[async_trait]
impl MailHandler for GenericNotifierMail {
    async fn render(&self, request: &MailRequest) -> Result<Option<OutgoingMail>, AppError> {
        if request.method != DEFAULT_MAILER_METHOD {
            return Err(AppError::Validation(format!(
                "Generic notifier has no entry point '{}'",
                request.method
            )));
        }

        let Some(notification) = self.store.find(request.notification_id).await? else {
            tracing::debug!(
                notification_id = request.notification_id,
                "Notification gone before email"
            );
            return Ok(None);
        };

        let receiver = notification.receiver();
        let Some(to) = self
            .receivers
            .resolve(&receiver)
            .await?
            .and_then(|recipient| recipient.email)
        else {
            tracing::debug!(receiver = %receiver, "Receiver has no email address");
            return Ok(None);
        };

        let mut body = notification.body.clone().unwrap_or_default();
        if let Some(link) = notification.link.as_deref().filter(|l| !l.is_empty()) {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(link);
        }

        Ok(Some(OutgoingMail {
            to,
            cc: request.cc_emails.clone(),
            subject: notification
                .title
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| FALLBACK_SUBJECT.to_string()),
            body,
        }))
    }
}
