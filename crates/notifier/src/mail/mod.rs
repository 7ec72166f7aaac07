//! Outgoing email.
//!
//! A queued [`MailRequest`] names a handler and an entry point on it. The
//! [`MailHandlerRegistry`] routes the request to that handler, which renders
//! an [`OutgoingMail`]; a [`MailTransport`] then delivers it. A request naming
//! a handler that is not registered goes to the generic notifier instead.

pub mod handlers;
pub mod smtp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use notice_common::error::AppError;
use notice_engine::delivery::{GENERIC_MAILER, MailRequest};

pub use handlers::{GenericNotifierMail, standard_handlers};
pub use smtp::{LogMailTransport, SmtpMailTransport};

/// Error type for email delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),
}

impl MailError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MailError::Transport(e) => !e.is_permanent(),
            MailError::Address(_) | MailError::Build(_) => false,
        }
    }
}

impl From<MailError> for AppError {
    fn from(e: MailError) -> Self {
        AppError::Mail(e.to_string())
    }
}

/// A rendered plain-text email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Renders the email for one handler name.
#[async_trait]
pub trait MailHandler: Send + Sync {
    /// `None` when there is nobody to send to.
    async fn render(&self, request: &MailRequest) -> Result<Option<OutgoingMail>, AppError>;
}

/// Mail handlers keyed by the name used in [`MailRequest::handler`].
#[derive(Default, Clone)]
pub struct MailHandlerRegistry {
    handlers: HashMap<String, Arc<dyn MailHandler>>,
}

impl MailHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn MailHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub async fn render(&self, request: &MailRequest) -> Result<Option<OutgoingMail>, AppError> {
        if let Some(handler) = self.handlers.get(&request.handler) {
            return handler.render(request).await;
        }

        let generic = self.handlers.get(GENERIC_MAILER).ok_or_else(|| {
            AppError::Config(format!("No mail handler registered for '{}'", request.handler))
        })?;
        tracing::warn!(
            notification_id = request.notification_id,
            handler = %request.handler,
            "Mail handler not registered, using generic notifier"
        );
        generic.render(&request.to_generic()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handler: &str) -> MailRequest {
        MailRequest {
            notification_id: 1,
            handler: handler.to_string(),
            method: "notify".to_string(),
            record_id: 1,
            code: "default".to_string(),
            fire_at: None,
            cc_emails: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_handler_is_config_error() {
        let registry = MailHandlerRegistry::new();
        let result = registry.render(&request("order_mailer")).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    struct Named(&'static str);

    #[async_trait]
    impl MailHandler for Named {
        async fn render(&self, request: &MailRequest) -> Result<Option<OutgoingMail>, AppError> {
            Ok(Some(OutgoingMail {
                to: format!("{}@example.com", request.record_id),
                cc: Vec::new(),
                subject: self.0.to_string(),
                body: request.method.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_unregistered_handler_falls_back_to_generic() {
        let registry = MailHandlerRegistry::new()
            .register(GENERIC_MAILER, Arc::new(Named("generic")))
            .register("invoice_mailer", Arc::new(Named("invoice")));

        let mut order = request("order_mailer");
        order.notification_id = 5;
        order.record_id = 77;
        order.method = "paid".to_string();
        let mail = registry.render(&order).await.unwrap().unwrap();
        assert_eq!(mail.subject, "generic");
        assert_eq!(mail.to, "5@example.com");
        assert_eq!(mail.body, "notify");

        let mail = registry.render(&request("invoice_mailer")).await.unwrap().unwrap();
        assert_eq!(mail.subject, "invoice");
    }

    #[test]
    fn test_build_errors_are_not_retryable() {
        assert!(!MailError::Build("missing body".to_string()).is_retryable());
        let addr_err: Result<lettre::Address, _> = "not-an-email".parse();
        assert!(!MailError::Address(addr_err.unwrap_err()).is_retryable());
    }
}
