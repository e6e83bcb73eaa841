//! Mail delivery.
//!
//! Rendered envelopes from every destination funnel into one transport
//! queue whose processor hands each batch to a `MailTransport`.

mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use lettre::Message;
use lettre::message::{Mailbox, MultiPart};
use tracing::{debug, info, warn};

use super::queue::{BatchItem, BatchProcessor};
use crate::Result;

pub use smtp::SmtpTransport;

/// A fully rendered mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub plain: String,
    pub html: String,
}

impl BatchItem for Envelope {}

impl Envelope {
    /// Build a `multipart/alternative` message with a plain and an HTML part.
    ///
    /// Header encoding, transfer encoding and line length limits are left to
    /// lettre, which picks 7bit, quoted-printable or base64 per part.
    pub fn to_message(&self) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.parse::<Mailbox>()?)
            .subject(single_line(&self.subject))
            .date_now();
        for to in &self.to {
            builder = builder.to(to.parse::<Mailbox>()?);
        }

        Ok(builder.multipart(MultiPart::alternative_plain_html(
            self.plain.clone(),
            self.html.clone(),
        ))?)
    }
}

fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Delivers a batch of envelopes in one session. No retries.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_all(&self, envelopes: &[Envelope]) -> Result<()>;
}

/// Processor of the transport queue.
pub struct TransportSink {
    transport: Arc<dyn MailTransport>,
    nosend: bool,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn MailTransport>, nosend: bool) -> Self {
        Self { transport, nosend }
    }
}

#[async_trait]
impl BatchProcessor<Envelope> for TransportSink {
    async fn process(&self, batch: Vec<Envelope>, overflowed: bool) -> Result<()> {
        if overflowed {
            warn!("Transport queue overflowed, some mails were dropped");
        }

        if self.nosend {
            for envelope in &batch {
                info!(
                    to = %envelope.to.join(", "),
                    "Not sending mail: {}", envelope.subject
                );
                debug!("Plain body:\n{}", envelope.plain);
                debug!("HTML body:\n{}", envelope.html);
            }
            return Ok(());
        }

        info!("Sending {} mails", batch.len());
        self.transport.send_all(&batch).await
    }
}
