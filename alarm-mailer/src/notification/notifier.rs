//! Per-destination batch processor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::events::AlarmEvent;
use super::queue::{BatchProcessor, BatchQueue};
use super::render::{RenderContext, Renderer};
use super::transport::Envelope;
use crate::config::DestinationConfig;
use crate::Result;

/// Turns a flushed batch of events into one mail on the transport queue.
pub struct DestinationNotifier {
    destination: Arc<DestinationConfig>,
    renderer: Arc<dyn Renderer>,
    transport: Arc<BatchQueue<Envelope>>,
}

impl DestinationNotifier {
    pub fn new(
        destination: Arc<DestinationConfig>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<BatchQueue<Envelope>>,
    ) -> Self {
        Self {
            destination,
            renderer,
            transport,
        }
    }

    /// Render a batch into an envelope.
    pub fn compose(&self, events: &[AlarmEvent]) -> Result<Envelope> {
        let dest = &self.destination;
        let ctx = RenderContext::new(events, dest);
        Ok(Envelope {
            from: dest.from.clone(),
            to: dest.to.clone(),
            subject: dest.subject_for(events.len()),
            plain: self.renderer.render(&dest.plain, &ctx)?,
            html: self.renderer.render(&dest.html, &ctx)?,
        })
    }
}

#[async_trait]
impl BatchProcessor<AlarmEvent> for DestinationNotifier {
    async fn process(&self, batch: Vec<AlarmEvent>, overflowed: bool) -> Result<()> {
        if overflowed {
            warn!(
                destination = %self.destination.name,
                "Event queue overflowed, some events were dropped"
            );
        }

        let envelope = self.compose(&batch)?;
        debug!(
            destination = %self.destination.name,
            "Queueing mail with {} events", batch.len()
        );

        let subject = envelope.subject.clone();
        if !self.transport.add(envelope) {
            error!(
                destination = %self.destination.name,
                "Transport queue full, dropping mail '{}' to {}",
                subject,
                self.destination.to.join(", ")
            );
        }
        Ok(())
    }
}
