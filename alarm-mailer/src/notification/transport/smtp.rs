//! SMTP delivery through lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, info, warn};

use super::{Envelope, MailTransport};
use crate::config::MailConfig;
use crate::{Error, Result};

/// Sends envelopes over plain SMTP, one connection per envelope.
pub struct SmtpTransport {
    server: String,
    port: u16,
    timeout: Duration,
    helo_name: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(server: impl Into<String>, port: u16, timeout: Duration) -> Self {
        let server = server.into();
        let helo_name = "localhost".to_string();
        let mailer = build_mailer(&server, port, timeout, &helo_name);
        Self {
            server,
            port,
            timeout,
            helo_name,
            mailer,
        }
    }

    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(config.server.clone(), config.port, config.timeout)
    }

    /// Name announced in `EHLO`/`HELO`.
    pub fn with_helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = name.into();
        self.mailer = build_mailer(&self.server, self.port, self.timeout, &self.helo_name);
        self
    }
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("helo_name", &self.helo_name)
            .finish()
    }
}

fn build_mailer(
    server: &str,
    port: u16,
    timeout: Duration,
    helo_name: &str,
) -> AsyncSmtpTransport<Tokio1Executor> {
    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server)
        .port(port)
        .timeout(Some(timeout))
        .hello_name(ClientId::Domain(helo_name.to_string()))
        .build()
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send_all(&self, envelopes: &[Envelope]) -> Result<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        debug!("Delivering {} mails via {}:{}", envelopes.len(), self.server, self.port);
        let mut failures = Vec::new();
        let mut last_error = None;
        for envelope in envelopes {
            let sent = match envelope.to_message() {
                Ok(message) => self.mailer.send(message).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            match sent {
                Ok(response) => info!(
                    "Sent '{}' to {} recipients: {}",
                    envelope.subject,
                    envelope.to.len(),
                    response.code()
                ),
                Err(e) => {
                    warn!("Failed to send '{}': {}", envelope.subject, e);
                    failures.push(envelope.subject.clone());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) if envelopes.len() == 1 => Err(e),
            Some(_) => Err(Error::transport(format!(
                "{} of {} mails not delivered: {}",
                failures.len(),
                envelopes.len(),
                failures.join("; ")
            ))),
        }
    }
}
