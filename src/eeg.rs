//! Multi-channel EEG reassembly and sample-clock reconstruction.
//!
//! The headset notifies each electrode on its own characteristic. Within one
//! 12-sample window the packets arrive in a fixed order and the AF7 packet
//! ([`EEG_BARRIER_HANDLE`]) always comes last, so its arrival closes the
//! window: everything buffered so far becomes one [`MultiChannelSample`].
//!
//! Packet arrival times jitter by tens of milliseconds, so sample timestamps
//! are not taken from the wall clock. Instead a running sample counter is
//! advanced by 12 per window and every sample `n` is stamped
//! `anchor + n × 1000 / 256` ms, where `anchor` is the wall-clock time the
//! assembler was created. Consecutive windows therefore line up exactly.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::protocol::{
    eeg_channel_for_handle, EEG_BARRIER_HANDLE, EEG_FIELD_NAMES, EEG_FREQUENCY, EEG_METRIC,
    EEG_SAMPLES_PER_READING,
};
use crate::types::{now_millis, ChannelSamples, Event, Metric, MultiChannelSample, Sensor};

/// Milliseconds between two consecutive EEG samples.
pub const SAMPLE_INTERVAL_MS: f64 = 1000.0 / EEG_FREQUENCY;

/// Per-connection reassembly state for the five EEG channels.
///
/// Not thread-safe on its own; the headset handler wraps it in a mutex.
#[derive(Debug)]
pub struct EegAssembler {
    anchor_ms: f64,
    sample_index: u64,
    last_barrier_index: Option<u16>,
    pending: BTreeMap<usize, ChannelSamples>,
    discontinuities: u64,
}

impl Default for EegAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl EegAssembler {
    /// Anchor the sample clock at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_anchor(now_millis() as f64)
    }

    /// Anchor the sample clock at `anchor_ms` (epoch milliseconds).
    pub fn with_anchor(anchor_ms: f64) -> Self {
        Self {
            anchor_ms,
            sample_index: 0,
            last_barrier_index: None,
            pending: BTreeMap::new(),
            discontinuities: 0,
        }
    }

    /// Number of windows whose barrier index did not follow the previous one.
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Samples stamped so far.
    pub fn samples_emitted(&self) -> u64 {
        self.sample_index
    }

    /// Buffer one decoded packet received on ATT `handle`.
    ///
    /// Returns a completed window when `handle` is the barrier channel.
    /// Channels that did not arrive since the previous window are simply
    /// absent from the result; a packet from an unknown handle is dropped.
    pub fn push(&mut self, handle: u16, samples: ChannelSamples) -> Option<MultiChannelSample> {
        let Some(channel) = eeg_channel_for_handle(handle) else {
            warn!("EEG packet on unknown handle {handle}, dropped");
            return None;
        };
        let index = samples.sequence_index;
        self.pending.insert(channel, samples);

        if handle != EEG_BARRIER_HANDLE {
            return None;
        }

        if let Some(last) = self.last_barrier_index {
            let expected = last.wrapping_add(1);
            if index != expected {
                self.discontinuities += 1;
                warn!("EEG discontinuity: got packet {index}, expected {expected}");
            }
        }
        self.last_barrier_index = Some(index);

        if self.pending.len() < EEG_FIELD_NAMES.len() {
            debug!(
                "EEG window {index} closing with {}/{} channels",
                self.pending.len(),
                EEG_FIELD_NAMES.len()
            );
        }

        let timestamps = self.next_window_timestamps();
        Some(MultiChannelSample {
            channels: std::mem::take(&mut self.pending),
            timestamps,
        })
    }

    fn next_window_timestamps(&mut self) -> Vec<f64> {
        let first = self.sample_index;
        self.sample_index += EEG_SAMPLES_PER_READING as u64;
        (first..self.sample_index)
            .map(|n| self.anchor_ms + n as f64 * SAMPLE_INTERVAL_MS)
            .collect()
    }
}

/// Turn one reassembly window into an Event with one Metric per time sample.
///
/// Each Metric carries one float field per channel present in the window,
/// named after the electrode (`tp9`, `af7`, `af8`, `tp10`, `right_aux`).
pub fn window_to_event(sensor: &Sensor, window: &MultiChannelSample) -> Event {
    let metrics = window
        .timestamps
        .iter()
        .enumerate()
        .map(|(i, &ts)| {
            let mut metric = Metric::new(EEG_METRIC, ts.round() as i64);
            for (&channel, samples) in &window.channels {
                let (Some(name), Some(&value)) = (EEG_FIELD_NAMES.get(channel), samples.values.get(i))
                else {
                    continue;
                };
                metric.insert(*name, value);
            }
            metric
        })
        .collect();
    Event::new(sensor.clone(), metrics)
}
