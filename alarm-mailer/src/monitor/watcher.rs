//! Per-source watch tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classifier::SourceClassifier;
use super::feed::{SourceMonitor, SubscriptionId};
use super::update::RawUpdate;
use crate::notification::events::AlarmEvent;
use crate::notification::router::FanoutRouter;
use crate::Result;

/// Classifies the updates of one source and routes the resulting events.
///
/// Updates of a source are handled one at a time in arrival order.
pub struct SourceWatcher {
    source: String,
    subscription: SubscriptionId,
    classifier: Arc<Mutex<SourceClassifier>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SourceWatcher {
    /// Subscribe to the classifier's source and start its task.
    pub fn spawn(
        classifier: SourceClassifier,
        monitor: &dyn SourceMonitor,
        router: Arc<FanoutRouter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let source = classifier.name().to_string();
        let subscription = monitor.subscribe(&source)?;
        let classifier = Arc::new(Mutex::new(classifier));

        let handle = tokio::spawn(watch(
            Arc::clone(&classifier),
            subscription.updates,
            router,
            cancel.clone(),
        ));

        Ok(Self {
            source,
            subscription: subscription.id,
            classifier,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Report the source as disconnected if it never delivered an update.
    pub fn report_if_unobserved(&self, router: &FanoutRouter) -> bool {
        let classifier = self.classifier.lock();
        let Some(event) = classifier.report_if_unobserved() else {
            return false;
        };
        dispatch(router, classifier.group(), &event);
        true
    }

    /// Unsubscribe and signal the task to exit without waiting for it.
    pub fn cancel(&self, monitor: &dyn SourceMonitor) {
        monitor.unsubscribe(&self.source, self.subscription);
        self.cancel.cancel();
    }

    /// Unsubscribe and wait for the task to finish its current update.
    pub async fn stop(&mut self, monitor: &dyn SourceMonitor) {
        self.cancel(monitor);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(source = %self.source, "watcher task ended abnormally: {}", e);
            }
        }
    }
}

fn dispatch(router: &FanoutRouter, group: &str, event: &AlarmEvent) {
    if !router.route(group, event) {
        warn!("Lost {}", event);
    }
}

async fn watch(
    classifier: Arc<Mutex<SourceClassifier>>,
    mut updates: mpsc::UnboundedReceiver<RawUpdate>,
    router: Arc<FanoutRouter>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let mut state = classifier.lock();
        for event in state.observe(update) {
            dispatch(&router, state.group(), &event);
        }
    }
    debug!("source watcher exiting");
}
