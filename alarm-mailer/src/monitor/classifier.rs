//! Per-source alarm state classification.
//!
//! Each source keeps exactly one previous update. A new update is compared
//! against it and yields at most one transition event, plus an `UpdatesLost`
//! notice when upstream folded several changes into one update.

use std::sync::Arc;

use tracing::trace;

use super::update::{RawUpdate, Severity};
use crate::notification::events::{AlarmEvent, AlarmReason, SourceEvent, SourceMeta};

/// Classify the transition from `previous` to `current`.
///
/// `alarm_initial` controls whether the very first update of a source may
/// produce an event.
pub fn classify(
    previous: Option<&RawUpdate>,
    current: &RawUpdate,
    alarm_initial: bool,
) -> Option<AlarmReason> {
    let Some(previous) = previous else {
        if !alarm_initial {
            return None;
        }
        if !current.ok {
            return Some(AlarmReason::Disconnected);
        }
        if current.severity.is_alarm() {
            return Some(AlarmReason::Raised);
        }
        return None;
    };

    if !current.ok {
        return previous.ok.then_some(AlarmReason::Disconnected);
    }

    let (prev, cur) = (previous.severity, current.severity);
    if prev.is_alarm() && !cur.is_alarm() {
        Some(AlarmReason::Cleared)
    } else if !prev.is_alarm() && cur.is_alarm() {
        Some(AlarmReason::Raised)
    } else if cur > prev {
        Some(AlarmReason::SeverityIncreased)
    } else if cur < prev {
        Some(AlarmReason::SeverityDecreased)
    } else {
        None
    }
}

/// Stateful classifier for one source.
#[derive(Debug)]
pub struct SourceClassifier {
    name: String,
    meta: Arc<SourceMeta>,
    alarm_initial: bool,
    previous: Option<RawUpdate>,
}

impl SourceClassifier {
    pub fn new(name: impl Into<String>, meta: Arc<SourceMeta>, alarm_initial: bool) -> Self {
        Self {
            name: name.into(),
            meta,
            alarm_initial,
            previous: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.meta.group
    }

    /// Whether any update has been seen yet.
    pub fn has_observed(&self) -> bool {
        self.previous.is_some()
    }

    pub fn previous(&self) -> Option<&RawUpdate> {
        self.previous.as_ref()
    }

    /// Feed one update and return the events it produced, in emission order.
    ///
    /// The cached previous update is replaced unconditionally. A disconnect is
    /// cached at the disconnected level whatever severity it carried.
    pub fn observe(&mut self, mut update: RawUpdate) -> Vec<AlarmEvent> {
        if !update.ok {
            update.severity = Severity::DISCONNECTED;
        }
        let mut events = Vec::with_capacity(2);

        if update.update_count != 1 {
            events.push(self.event(update.clone(), AlarmReason::UpdatesLost));
        }

        let reason = classify(self.previous.as_ref(), &update, self.alarm_initial);
        trace!(source = %self.name, ?reason, "classified update");

        if let Some(reason) = reason {
            events.push(self.event(update.clone(), reason));
        }

        self.previous = Some(update);
        events
    }

    /// Disconnected event for a source that never delivered an update.
    ///
    /// Returns `None` once anything has been observed.
    pub fn report_if_unobserved(&self) -> Option<AlarmEvent> {
        if self.has_observed() {
            return None;
        }
        Some(self.event(
            RawUpdate::placeholder(self.name.clone()),
            AlarmReason::Disconnected,
        ))
    }

    fn event(&self, update: RawUpdate, reason: AlarmReason) -> AlarmEvent {
        AlarmEvent::Source(SourceEvent::new(update, reason, Arc::clone(&self.meta)))
    }
}
