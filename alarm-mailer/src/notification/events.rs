//! Alarm events and the reasons that produce them.
//!
//! `AlarmReason` is both the classification outcome and the sort key used to
//! order a batch before rendering. Higher codes are more urgent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use super::queue::BatchItem;
use crate::monitor::{RawUpdate, Severity};

/// Why an event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmReason {
    Cleared = 0,
    Raised = 1,
    SeverityIncreased = 2,
    SeverityDecreased = 3,
    Disconnected = 4,
    QueueOverflow = 5,
    UpdatesLost = 6,
    StartupNotice = 7,
}

impl AlarmReason {
    /// Stable numeric code.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Human-readable message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Cleared => "Alarm cleared",
            Self::Raised => "Alarm",
            Self::SeverityIncreased => "Severity increased",
            Self::SeverityDecreased => "Severity decreased",
            Self::Disconnected => "Connection lost",
            Self::QueueOverflow => "Queue full",
            Self::UpdatesLost => "Lost Events",
            Self::StartupNotice => "Mailer starting",
        }
    }
}

impl std::fmt::Display for AlarmReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Static metadata shared by every source of one group.
#[derive(Debug, Clone, Default)]
pub struct SourceMeta {
    /// Group the source belongs to.
    pub group: String,
    /// Display description per source name.
    pub descriptions: HashMap<String, String>,
}

impl SourceMeta {
    pub fn description_for<'a>(&'a self, source: &'a str) -> &'a str {
        self.descriptions
            .get(source)
            .map(String::as_str)
            .unwrap_or(source)
    }
}

/// Event classified from a source update.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    update: RawUpdate,
    reason: AlarmReason,
    received_at: DateTime<Utc>,
    meta: Arc<SourceMeta>,
}

impl SourceEvent {
    pub fn new(update: RawUpdate, reason: AlarmReason, meta: Arc<SourceMeta>) -> Self {
        Self {
            update,
            reason,
            received_at: Utc::now(),
            meta,
        }
    }

    pub fn source(&self) -> &str {
        &self.update.source
    }

    pub fn update(&self) -> &RawUpdate {
        &self.update
    }

    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Severity as rendered. Disconnected sources always report the worst level.
    pub fn effective_severity(&self) -> Severity {
        if self.update.ok {
            self.update.severity
        } else {
            Severity::DISCONNECTED
        }
    }

    /// The source timestamp cannot be trusted once the connection is gone.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        if self.update.ok {
            self.update.timestamp
        } else {
            self.received_at
        }
    }
}

/// Synthetic notice produced by the mailer itself.
#[derive(Debug, Clone)]
pub struct InternalEvent {
    reason: AlarmReason,
    timestamp: DateTime<Utc>,
}

impl InternalEvent {
    pub fn new(reason: AlarmReason) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// One entry of a destination batch.
#[derive(Debug, Clone)]
pub enum AlarmEvent {
    Source(SourceEvent),
    Internal(InternalEvent),
}

/// Severity rank reported for internal notices, above every source level.
const INTERNAL_SEVERITY_RANK: u8 = 5;

impl AlarmEvent {
    pub fn internal(reason: AlarmReason) -> Self {
        Self::Internal(InternalEvent::new(reason))
    }

    pub fn startup_notice() -> Self {
        Self::internal(AlarmReason::StartupNotice)
    }

    pub fn reason(&self) -> AlarmReason {
        match self {
            Self::Source(e) => e.reason,
            Self::Internal(e) => e.reason,
        }
    }

    /// Source name, or the notice message for internal events.
    pub fn name(&self) -> &str {
        match self {
            Self::Source(e) => e.source(),
            Self::Internal(e) => e.reason.message(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Flattened, render-ready view of the event.
    pub fn view(&self) -> EventView {
        match self {
            Self::Source(e) => {
                let severity = e.effective_severity();
                EventView {
                    name: e.source().to_string(),
                    desc: e.meta().description_for(e.source()).to_string(),
                    value: if e.update.ok {
                        e.update.value.clone()
                    } else {
                        "N/A".to_string()
                    },
                    units: e.update.units.clone().unwrap_or_default(),
                    severity: severity.label().to_string(),
                    sevr: severity.0,
                    status: if e.update.ok { e.update.status } else { 0 },
                    reason: e.reason.message().to_string(),
                    reason_code: e.reason.code(),
                    time: format_local(e.effective_timestamp()),
                    rxtime: format_local(e.received_at),
                }
            }
            Self::Internal(e) => EventView {
                name: e.reason.message().to_string(),
                desc: e.reason.message().to_string(),
                value: String::new(),
                units: String::new(),
                severity: "Internal".to_string(),
                sevr: INTERNAL_SEVERITY_RANK,
                status: 0,
                reason: e.reason.message().to_string(),
                reason_code: e.reason.code(),
                time: format_local(e.timestamp),
                rxtime: format_local(e.timestamp),
            },
        }
    }
}

impl std::fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(e) => write!(
                f,
                "AlarmEvent('{}', {}, {}, {})",
                e.source(),
                e.update.value,
                e.effective_severity(),
                e.reason
            ),
            Self::Internal(e) => write!(f, "InternalEvent({})", e.reason),
        }
    }
}

impl BatchItem for AlarmEvent {
    fn overflow_marker() -> Option<Self> {
        Some(Self::internal(AlarmReason::QueueOverflow))
    }

    fn priority(&self) -> u8 {
        self.reason().code()
    }
}

/// Union of update and metadata fields exposed to templates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    pub name: String,
    pub desc: String,
    pub value: String,
    pub units: String,
    pub severity: String,
    pub sevr: u8,
    pub status: u16,
    pub reason: String,
    pub reason_code: u8,
    pub time: String,
    pub rxtime: String,
}

impl EventView {
    /// Look up a field by its template name.
    pub fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "name" => self.name.clone(),
            "desc" => self.desc.clone(),
            "value" => self.value.clone(),
            "units" => self.units.clone(),
            "severity" => self.severity.clone(),
            "sevr" => self.sevr.to_string(),
            "status" => self.status.to_string(),
            "reason" => self.reason.clone(),
            "reason_code" => self.reason_code.to_string(),
            "time" => self.time.clone(),
            "rxtime" => self.rxtime.clone(),
            _ => return None,
        };
        Some(value)
    }
}

fn format_local(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%a %b %e %H:%M:%S %Y").to_string()
}
