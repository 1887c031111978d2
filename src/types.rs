//! Normalized telemetry model shared by every sensor family.
//!
//! Handlers turn raw notification payloads into [`Event`]s; the
//! [`crate::hub::EventHub`] hands every subscriber its own clone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Milliseconds since the Unix epoch for `at`.
///
/// Clocks set before 1970 collapse to `0` rather than failing.
pub fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Wall-clock "now" in epoch milliseconds.
pub fn now_millis() -> i64 {
    epoch_millis(SystemTime::now())
}

// ── Sensor ────────────────────────────────────────────────────────────────────

/// A physical BLE device, identified by its hardware address.
///
/// On Linux this is the MAC address (`AA:BB:CC:DD:EE:FF`); on platforms that
/// hide MAC addresses it is the platform peripheral identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Sensor {
    pub hw_address: String,
}

impl Sensor {
    pub fn new(hw_address: impl Into<String>) -> Self {
        Self {
            hw_address: hw_address.into(),
        }
    }
}

// ── FieldValue ────────────────────────────────────────────────────────────────

/// One decoded value inside a [`Metric`].
///
/// `Unset` means the field exists but no value was produced for it; it
/// serializes as `null`, the other variants as bare JSON values.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Unset,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, FieldValue::Unset)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

// ── Metric / Event ────────────────────────────────────────────────────────────

/// One decoded reading instant for one sensor family.
///
/// Field names are unique; inserting a name twice keeps the last value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    /// Sensor family name, e.g. `"polar-h7"` or `"eeg"`.
    pub name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Metric {
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Everything decoded from one notification (or one completed headset
/// reassembly window) of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub sensor: Sensor,
    pub metrics: Vec<Metric>,
}

impl Event {
    pub fn new(sensor: Sensor, metrics: Vec<Metric>) -> Self {
        Self { sensor, metrics }
    }

    /// Convenience for the common single-metric case.
    pub fn single(sensor: Sensor, metric: Metric) -> Self {
        Self {
            sensor,
            metrics: vec![metric],
        }
    }
}

/// Where a handler delivers decoded events. Usually [`crate::hub::EventHub::sink`].
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

// ── Headset reassembly ───────────────────────────────────────────────────────

/// One decoded single-channel EEG packet.
///
/// Transient: consumed by [`crate::eeg::EegAssembler`] as soon as it arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSamples {
    /// Big-endian 16-bit sequence index carried by the packet (wraps at 0xFFFF).
    pub sequence_index: u16,
    /// Voltage samples in µV, 12 per packet.
    pub values: Vec<f64>,
    /// When the notification was received.
    pub arrival: SystemTime,
}

/// A completed reassembly window: the latest packet of every channel that
/// arrived, plus the reconstructed sample clock.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiChannelSample {
    /// Keyed by logical channel index (0 = TP9 … 4 = right AUX).
    /// Channels that never arrived in this window are absent.
    pub channels: BTreeMap<usize, ChannelSamples>,
    /// One timestamp per sample in epoch milliseconds, strictly increasing,
    /// evenly spaced by `1000 / 256` ms.
    pub timestamps: Vec<f64>,
}
