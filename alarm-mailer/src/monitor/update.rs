//! Raw status updates delivered by the monitoring side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alarm severity of a source. Ordered, `0` means no alarm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Severity(pub u8);

impl Severity {
    pub const NO_ALARM: Severity = Severity(0);
    pub const MINOR: Severity = Severity(1);
    pub const MAJOR: Severity = Severity(2);
    pub const INVALID: Severity = Severity(3);
    /// Worst level, forced onto events from disconnected sources.
    pub const DISCONNECTED: Severity = Severity(4);

    /// Whether this level represents an active alarm.
    pub fn is_alarm(&self) -> bool {
        self.0 != 0
    }

    /// Human-readable label used in rendered notifications.
    pub fn label(&self) -> &'static str {
        match self.0 {
            0 => "No Alarm",
            1 => "Minor",
            2 => "Major",
            3 => "Invalid",
            4 => "Disconn.",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn default_ok() -> bool {
    true
}

fn default_update_count() -> u32 {
    1
}

/// A status snapshot of one monitored source.
///
/// `update_count` is the number of upstream changes folded into this
/// snapshot; anything other than 1 means changes were coalesced or missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub source: String,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub status: u16,
    #[serde(default = "default_update_count")]
    pub update_count: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub units: Option<String>,
}

impl RawUpdate {
    /// A connected update with the given severity and value.
    pub fn connected(source: impl Into<String>, severity: Severity, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ok: true,
            severity,
            status: if severity.is_alarm() { 1 } else { 0 },
            update_count: 1,
            timestamp: Utc::now(),
            value: value.into(),
            units: None,
        }
    }

    /// A connection-lost notification.
    pub fn disconnected(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ok: false,
            severity: Severity::DISCONNECTED,
            status: 0,
            update_count: 1,
            timestamp: Utc::now(),
            value: String::new(),
            units: None,
        }
    }

    /// Stand-in for a source that never delivered anything.
    pub fn placeholder(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ok: false,
            severity: Severity::DISCONNECTED,
            status: 0,
            update_count: 1,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            value: "N/A".to_string(),
            units: None,
        }
    }

    pub fn with_update_count(mut self, count: u32) -> Self {
        self.update_count = count;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}
