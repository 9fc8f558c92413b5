//! Delivering new items as email.
//!
//! The processor only knows the [`Transport`] trait: give it recipients and a
//! [`Notification`], get back success or a [`DeliveryError`]. The concrete
//! [`MailTransport`] (sendmail pipe or SMTP) is chosen once at startup.

pub mod message;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::feed::NormalizedItem;

pub use message::{
    render_subject, text_body, MessageTemplate, TemplateError, DEFAULT_SUBJECT, DEFAULT_TEMPLATE,
    TEMPLATE_FILE,
};
pub use transport::{MailTransport, SmtpSettings};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("No recipients configured, pass at least one address")]
    NoRecipients,

    #[error("Invalid email address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("Failed to build envelope: {0}")]
    Envelope(#[from] lettre::error::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("sendmail delivery failed: {0}")]
    Sendmail(#[from] lettre::transport::sendmail::Error),

    #[error("Failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid template {path}: {source}")]
    TemplateSyntax {
        path: PathBuf,
        #[source]
        source: TemplateError,
    },
}

/// The feed an item came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedContext {
    pub url: String,
    pub title: String,
    pub link: Option<String>,
}

/// Everything needed to render and send one item.
#[derive(Debug, Clone)]
pub struct Notification {
    pub feed: FeedContext,
    pub item: NormalizedItem,
    pub subject: String,
    pub text: String,
    /// Sanitised HTML body.
    pub html: String,
    pub template: Arc<MessageTemplate>,
}

impl Notification {
    /// The raw message for one recipient.
    pub fn render(&self, from: &str, to: &str) -> String {
        self.template.render(self, from, to)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `notification` to every recipient. A failure for any recipient
    /// fails the whole call.
    async fn deliver(
        &self,
        recipients: &[String],
        notification: &Notification,
    ) -> Result<(), DeliveryError>;
}
