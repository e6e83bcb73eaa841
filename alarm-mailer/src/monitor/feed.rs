//! Update sources.
//!
//! A `SourceMonitor` hands out one update stream per subscribed source.
//! `FeedMonitor` is an in-process hub that can be fed directly or from a
//! JSON-lines stream, one update object per line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::update::{RawUpdate, Severity};
use crate::Result;

/// Identifies one subscription to a source.
pub type SubscriptionId = u64;

/// An active subscription: its id and the stream of updates.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub updates: mpsc::UnboundedReceiver<RawUpdate>,
}

/// Subscription interface to the monitored system.
///
/// A source may be subscribed more than once; every subscription receives
/// every update of the source.
pub trait SourceMonitor: Send + Sync {
    /// Start receiving updates for `source`.
    fn subscribe(&self, source: &str) -> Result<Subscription>;

    /// End the subscription `id` of `source`. Its stream ends.
    fn unsubscribe(&self, source: &str, id: SubscriptionId);
}

/// In-process publish/subscribe hub keyed by source name.
#[derive(Default)]
pub struct FeedMonitor {
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<RawUpdate>)>>>,
    next_id: AtomicU64,
}

impl FeedMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions over all sources.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    /// Forward an update to every subscriber of its source. Returns whether
    /// anyone received it.
    pub fn publish(&self, update: RawUpdate) -> bool {
        let subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get(&update.source) else {
            trace!(source = %update.source, "update for unmonitored source ignored");
            return false;
        };

        let mut delivered = false;
        if let Some(((_, last), rest)) = senders.split_last() {
            for (_, tx) in rest {
                delivered |= tx.send(update.clone()).is_ok();
            }
            delivered |= last.send(update).is_ok();
        }
        delivered
    }

    /// Publish every update read from `reader` until end of input.
    ///
    /// Malformed lines are logged and skipped. Returns the number of updates read.
    pub async fn run_reader<R>(&self, reader: R) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut count = 0;
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(update) => {
                    count += 1;
                    self.publish(update);
                }
                Err(e) => warn!("Skipping malformed update on line {}: {}", line_no, e),
            }
        }

        debug!("Update feed ended after {} updates", count);
        Ok(count)
    }
}

impl SourceMonitor for FeedMonitor {
    fn subscribe(&self, source: &str) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(source.to_string())
            .or_default()
            .push((id, tx));
        Ok(Subscription { id, updates: rx })
    }

    fn unsubscribe(&self, source: &str, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(source) {
            senders.retain(|(sub, _)| *sub != id);
            if senders.is_empty() {
                subscribers.remove(source);
            }
        }
    }
}

/// Parse one feed line. Numeric values are accepted and kept in textual form.
///
/// A disconnect line without a severity gets the disconnected level.
pub fn parse_line(line: &str) -> Result<RawUpdate> {
    let mut value: Value = serde_json::from_str(line)?;
    if let Some(obj) = value.as_object_mut() {
        if obj.get("ok") == Some(&Value::Bool(false)) && !obj.contains_key("severity") {
            obj.insert(
                "severity".to_string(),
                Value::from(Severity::DISCONNECTED.0),
            );
        }
        if let Some(v) = obj.get_mut("value") {
            let text = match &*v {
                Value::String(_) => None,
                Value::Null => Some(String::new()),
                other => Some(other.to_string()),
            };
            if let Some(text) = text {
                *v = Value::String(text);
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let update = parse_line(
            r#"{"source": "VAC:1", "severity": 2, "value": 42.5, "units": "K", "update_count": 3}"#,
        )
        .unwrap();
        assert_eq!(update.source, "VAC:1");
        assert!(update.ok);
        assert_eq!(update.severity, Severity::MAJOR);
        assert_eq!(update.value, "42.5");
        assert_eq!(update.units.as_deref(), Some("K"));
        assert_eq!(update.update_count, 3);

        let update = parse_line(r#"{"source": "VAC:1", "ok": false}"#).unwrap();
        assert!(!update.ok);
        assert_eq!(update.severity, Severity::DISCONNECTED);
        assert_eq!(update.update_count, 1);

        let update = parse_line(r#"{"source": "VAC:1", "ok": false, "severity": 3}"#).unwrap();
        assert_eq!(update.severity, Severity::INVALID);

        assert!(parse_line(r#"{"severity": 1}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_only() {
        let monitor = FeedMonitor::new();
        let mut sub = monitor.subscribe("VAC:1").unwrap();

        assert!(monitor.publish(RawUpdate::connected("VAC:1", Severity::MINOR, "1")));
        assert!(!monitor.publish(RawUpdate::connected("VAC:2", Severity::MINOR, "1")));
        assert_eq!(sub.updates.recv().await.unwrap().severity, Severity::MINOR);

        monitor.unsubscribe("VAC:1", sub.id);
        assert!(sub.updates.recv().await.is_none());
        assert_eq!(monitor.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_source_reaches_every_subscription() {
        let monitor = FeedMonitor::new();
        let mut first = monitor.subscribe("VAC:1").unwrap();
        let mut second = monitor.subscribe("VAC:1").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(monitor.subscriber_count(), 2);

        assert!(monitor.publish(RawUpdate::connected("VAC:1", Severity::MAJOR, "5")));
        assert_eq!(first.updates.recv().await.unwrap().value, "5");
        assert_eq!(second.updates.recv().await.unwrap().value, "5");

        // Ending one subscription leaves the other intact.
        monitor.unsubscribe("VAC:1", first.id);
        assert!(first.updates.recv().await.is_none());
        assert!(monitor.publish(RawUpdate::connected("VAC:1", Severity::MINOR, "6")));
        assert_eq!(second.updates.recv().await.unwrap().value, "6");
        assert_eq!(monitor.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_run_reader_skips_bad_lines() {
        let monitor = FeedMonitor::new();
        let mut rx = monitor.subscribe("VAC:1").unwrap().updates;

        let input = concat!(
            "{\"source\": \"VAC:1\", \"severity\": 1, \"value\": \"a\"}\n",
            "garbage\n",
            "\n",
            "{\"source\": \"VAC:9\", \"severity\": 1}\n",
            "{\"source\": \"VAC:1\", \"ok\": false}\n",
        );
        let count = monitor.run_reader(input.as_bytes()).await.unwrap();
        assert_eq!(count, 3);

        assert_eq!(rx.recv().await.unwrap().value, "a");
        assert!(!rx.recv().await.unwrap().ok);
        assert!(rx.try_recv().is_err());
    }
}
