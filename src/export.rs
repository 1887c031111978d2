//! Time-series JSON shaping for downstream ingestion.
//!
//! ```json
//! {"deviceId":"FXXX","timestamp":"2018-01-17T01:17:00Z","series":[{"Flow Rate ft3/s":1.01}]}
//! ```
//!
//! [`to_event_json`] writes the whole [`Event`] instead, every metric
//! included.
//!
//! Only the first metric of an event is exported to the time-series shape. Integer and float fields
//! become numbers, booleans map `true → 0` and `false → 1`, and string or
//! unset fields are left out.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::types::{Event, FieldValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesRecord {
    pub device_id: String,
    /// RFC 3339, UTC. `None` when the event carries no metric.
    pub timestamp: Option<String>,
    /// Zero or one sample map.
    pub series: Vec<BTreeMap<String, f64>>,
}

fn rfc3339(epoch_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn numeric(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Int(v) => Some(*v as f64),
        FieldValue::Float(v) => Some(*v),
        FieldValue::Bool(v) => Some(if *v { 0.0 } else { 1.0 }),
        FieldValue::Str(_) | FieldValue::Unset => None,
    }
}

pub fn to_time_series(event: &Event) -> TimeSeriesRecord {
    let mut record = TimeSeriesRecord {
        device_id: event.sensor.hw_address.clone(),
        timestamp: None,
        series: Vec::new(),
    };
    let Some(metric) = event.metrics.first() else {
        return record;
    };
    record.timestamp = rfc3339(metric.timestamp);
    let values: BTreeMap<String, f64> = metric
        .fields
        .iter()
        .filter_map(|(name, value)| Some((name.clone(), numeric(value)?)))
        .collect();
    if !values.is_empty() {
        record.series.push(values);
    }
    record
}

pub fn to_time_series_json(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(&to_time_series(event))
}

/// The event as decoded: `{"sensor":{"hw_address":…},"metrics":[…]}`.
pub fn to_event_json(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
