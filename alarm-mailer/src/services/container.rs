//! Service container for the mailer pipeline.
//!
//! `AlarmMailer` owns every running part: one watcher per source, one
//! batching queue per destination and the shared transport queue. It starts
//! them from a validated configuration and stops them in dependency order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DestinationConfig};
use crate::monitor::{SourceClassifier, SourceMonitor, SourceWatcher};
use crate::notification::{
    AlarmEvent, BatchQueue, DestinationNotifier, Envelope, FanoutRouter, MailTransport, Renderer,
    TransportSink,
};
use crate::Result;

/// Queue name of the shared transport queue.
pub const TRANSPORT_QUEUE: &str = "transport";

/// A destination and its event queue.
pub struct Destination {
    pub config: Arc<DestinationConfig>,
    pub queue: Arc<BatchQueue<AlarmEvent>>,
}

/// The running mailer.
pub struct AlarmMailer {
    config: Arc<AppConfig>,
    monitor: Arc<dyn SourceMonitor>,
    router: Arc<FanoutRouter>,
    watchers: Vec<SourceWatcher>,
    destinations: Vec<Destination>,
    transport_queue: Arc<BatchQueue<Envelope>>,
    cancellation_token: CancellationToken,
}

impl AlarmMailer {
    /// Start the pipeline. Must be called within a tokio runtime.
    ///
    /// Destinations with `send_initial` get a startup notice queued right away.
    pub fn start(
        config: AppConfig,
        monitor: Arc<dyn SourceMonitor>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self> {
        info!(
            "Starting alarm mailer: {} sources in {} groups, {} destinations",
            config.source_count(),
            config.groups.len(),
            config.destinations.len()
        );
        let config = Arc::new(config);
        let cancellation_token = CancellationToken::new();

        let transport_queue = Arc::new(BatchQueue::spawn(
            TRANSPORT_QUEUE,
            config.mail.queue.clone(),
            Arc::new(TransportSink::new(transport, config.mail.nosend)),
        ));

        let mut destinations = Vec::with_capacity(config.destinations.len());
        for dest in &config.destinations {
            let notifier = DestinationNotifier::new(
                Arc::clone(dest),
                Arc::clone(&renderer),
                Arc::clone(&transport_queue),
            );
            let queue = Arc::new(BatchQueue::spawn(
                dest.name.clone(),
                dest.queue.clone(),
                Arc::new(notifier),
            ));
            if dest.send_initial && !queue.add(AlarmEvent::startup_notice()) {
                warn!(destination = %dest.name, "Could not queue startup notice");
            }
            debug!(destination = %dest.name, groups = ?dest.groups, "destination started");
            destinations.push(Destination {
                config: Arc::clone(dest),
                queue,
            });
        }

        let router = Arc::new(FanoutRouter::new(
            destinations
                .iter()
                .map(|d| (Arc::clone(&d.queue), d.config.groups.as_slice())),
        ));

        let watchers =
            match spawn_watchers(&config, monitor.as_ref(), &router, &cancellation_token) {
                Ok(watchers) => watchers,
                Err(e) => {
                    cancellation_token.cancel();
                    for dest in &destinations {
                        dest.queue.abort();
                    }
                    transport_queue.abort();
                    return Err(e);
                }
            };

        info!("Alarm mailer started");
        Ok(Self {
            config,
            monitor,
            router,
            watchers,
            destinations,
            transport_queue,
            cancellation_token,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Event queue of the named destination.
    pub fn destination_queue(&self, name: &str) -> Option<&Arc<BatchQueue<AlarmEvent>>> {
        self.destinations
            .iter()
            .find(|d| d.config.name == name)
            .map(|d| &d.queue)
    }

    pub fn transport_queue(&self) -> &Arc<BatchQueue<Envelope>> {
        &self.transport_queue
    }

    /// Report every source that has not delivered an update yet as disconnected.
    ///
    /// Returns the number of sources reported.
    pub fn report_unconnected(&self) -> usize {
        let reported = self
            .watchers
            .iter()
            .filter(|w| w.report_if_unobserved(&self.router))
            .count();
        if reported > 0 {
            warn!("{} sources never connected", reported);
        }
        reported
    }

    /// Wait for the configured initial period, then report silent sources.
    pub async fn report_unconnected_after_initial_wait(&self) -> usize {
        tokio::select! {
            _ = tokio::time::sleep(self.config.main.initial_wait) => self.report_unconnected(),
            _ = self.cancellation_token.cancelled() => 0,
        }
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop the sources first, then flush the destinations into the
    /// transport queue, then flush the transport queue.
    pub async fn shutdown(&mut self) {
        info!("Shutting down alarm mailer");
        self.cancellation_token.cancel();

        for watcher in &mut self.watchers {
            watcher.stop(self.monitor.as_ref()).await;
        }
        self.watchers.clear();
        debug!("Source watchers stopped");

        for dest in &self.destinations {
            dest.queue.close().await;
        }
        debug!("Destination queues closed");

        self.transport_queue.close().await;
        info!("Alarm mailer stopped");
    }
}

/// One watcher per source of every group. A source listed in several groups
/// gets one watcher per group.
///
/// On failure the watchers started so far are unsubscribed and cancelled.
fn spawn_watchers(
    config: &AppConfig,
    monitor: &dyn SourceMonitor,
    router: &Arc<FanoutRouter>,
    cancellation_token: &CancellationToken,
) -> Result<Vec<SourceWatcher>> {
    let mut watchers: Vec<SourceWatcher> = Vec::with_capacity(config.source_count());
    for group in config.groups.values() {
        if router.subscriber_count(&group.name) == 0 {
            warn!(group = %group.name, "No destination subscribes to this group");
        }
        let meta = group.meta();
        for source in &group.sources {
            let classifier =
                SourceClassifier::new(source.clone(), Arc::clone(&meta), group.alarm_initial);
            match SourceWatcher::spawn(
                classifier,
                monitor,
                Arc::clone(router),
                cancellation_token.child_token(),
            ) {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => {
                    error!(group = %group.name, source = %source, "Cannot monitor source: {}", e);
                    for watcher in &watchers {
                        watcher.cancel(monitor);
                    }
                    return Err(e);
                }
            }
        }
    }
    Ok(watchers)
}
