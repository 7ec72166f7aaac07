//! Email delivery via SMTP.
//!
//! [`SmtpMailTransport`] wraps the `lettre` async SMTP transport. When no
//! SMTP host is configured the worker falls back to [`LogMailTransport`],
//! which only logs what would have been sent.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use notice_common::config::SmtpConfig;

use super::{MailError, MailTransport, OutgoingMail};

pub struct SmtpMailTransport {
    from_address: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port);

        if let (Some(user), Some(pass)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            from_address: config.from_address.clone(),
            transport: builder.build(),
        })
    }
}

/// Assemble the MIME message for `mail`.
fn build_message(from_address: &str, mail: &OutgoingMail) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(from_address.parse()?)
        .to(mail.to.parse()?)
        .subject(mail.subject.clone());
    for cc in &mail.cc {
        builder = builder.cc(cc.parse()?);
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|e| MailError::Build(e.to_string()))
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = build_message(&self.from_address, mail)?;
        self.transport.send(message).await?;

        tracing::info!(to = %mail.to, cc = mail.cc.len(), "Notification email sent");
        Ok(())
    }
}

/// Logs instead of sending.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        tracing::info!(
            to = %mail.to,
            subject = %mail.subject,
            "SMTP not configured, email not sent"
        );
        Ok(())
    }
}
