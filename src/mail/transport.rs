use std::ffi::OsString;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};

use super::{DeliveryError, Notification, Transport};

/// SMTP submission settings, resolved from config and environment.
#[derive(Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// The two ways mail leaves this process.
pub enum MailTransport {
    /// Pipe each message into a local sendmail-compatible command.
    Sendmail {
        transport: AsyncSendmailTransport<Tokio1Executor>,
        from: Option<Mailbox>,
    },
    /// Submit over SMTP with STARTTLS and credentials.
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: Option<Mailbox>,
    },
}

impl MailTransport {
    /// Sendmail transport running `command`. Without `from`, each message is
    /// sent from its own recipient.
    pub fn sendmail(command: impl Into<OsString>, from: Option<&str>) -> Result<Self, DeliveryError> {
        Ok(MailTransport::Sendmail {
            transport: AsyncSendmailTransport::<Tokio1Executor>::new_with_command(command),
            from: from.map(parse_mailbox).transpose()?,
        })
    }

    pub fn smtp(settings: &SmtpSettings, from: Option<&str>) -> Result<Self, DeliveryError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.expose_secret().to_owned(),
            ))
            .build();

        Ok(MailTransport::Smtp {
            transport,
            from: from.map(parse_mailbox).transpose()?,
        })
    }

    fn from(&self) -> Option<&Mailbox> {
        match self {
            MailTransport::Sendmail { from, .. } | MailTransport::Smtp { from, .. } => from.as_ref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            MailTransport::Sendmail { .. } => "sendmail",
            MailTransport::Smtp { .. } => "smtp",
        }
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|source| DeliveryError::Address {
            address: address.to_owned(),
            source,
        })
}

#[async_trait]
impl Transport for MailTransport {
    async fn deliver(
        &self,
        recipients: &[String],
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        if recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }

        for recipient in recipients {
            let to = parse_mailbox(recipient)?;
            let from = self.from().unwrap_or(&to);
            let envelope = Envelope::new(Some(from.email.clone()), vec![to.email.clone()])?;
            let raw = notification.render(&from.to_string(), &to.to_string());

            match self {
                MailTransport::Sendmail { transport, .. } => {
                    transport.send_raw(&envelope, raw.as_bytes()).await?;
                }
                MailTransport::Smtp { transport, .. } => {
                    transport.send_raw(&envelope, raw.as_bytes()).await?;
                }
            }

            tracing::debug!(
                transport = self.kind(),
                to = %recipient,
                link = %notification.item.link,
                "Delivered item"
            );
        }

        Ok(())
    }
}
