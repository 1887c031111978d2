//! Interaxon Muse (classic firmware) EEG headset.
//!
//! Five EEG characteristics are reassembled into 12-sample windows by
//! [`EegAssembler`]; each window becomes one Event of 12 `eeg` metrics.
//! The control channel's JSON status blobs and the IMU, telemetry and PPG
//! streams are only logged.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{require, subscribe_all, write_logged, Handler};
use crate::eeg::{window_to_event, EegAssembler};
use crate::error::Result;
use crate::lock;
use crate::parse::{unpack_eeg_channel, ControlAccumulator};
use crate::protocol::*;
use crate::transport::{find_service, BleDevice, GattService};
use crate::types::{Event, EventSink, Sensor};

pub const NAME: &str = "headset";

/// Streams that are subscribed but not decoded into Events.
const AUX_CHARACTERISTICS: [(Uuid, &str); 6] = [
    (TELEMETRY_CHARACTERISTIC, "telemetry"),
    (ACCELEROMETER_CHARACTERISTIC, "accelerometer"),
    (GYROSCOPE_CHARACTERISTIC, "gyroscope"),
    (PPG_CHARACTERISTICS[0], "ppg-ambient"),
    (PPG_CHARACTERISTICS[1], "ppg-infrared"),
    (PPG_CHARACTERISTICS[2], "ppg-red"),
];

/// Resume streaming, then ask for status and device info.
const STARTUP_COMMANDS: [&str; 3] = [CMD_RESUME, CMD_STATUS, CMD_DEVICE_INFO];

pub struct HeadsetHandler {
    sensor: Sensor,
    // Notifications from the five EEG characteristics may be delivered
    // concurrently by some transports.
    assembler: Mutex<EegAssembler>,
    control: Mutex<ControlAccumulator>,
}

impl HeadsetHandler {
    /// Anchors the EEG sample clock at construction time.
    pub fn new(sensor: Sensor) -> Self {
        Self::with_assembler(sensor, EegAssembler::new())
    }

    pub fn with_assembler(sensor: Sensor, assembler: EegAssembler) -> Self {
        Self {
            sensor,
            assembler: Mutex::new(assembler),
            control: Mutex::new(ControlAccumulator::new()),
        }
    }

    pub fn boxed(sensor: Sensor) -> Box<dyn Handler> {
        Box::new(Self::new(sensor))
    }

    pub fn probe(services: &[GattService]) -> bool {
        find_service(services, HEADSET_SERVICE).is_some()
    }

    /// Count of EEG windows whose index did not follow the previous one.
    pub fn discontinuities(&self) -> u64 {
        lock(&self.assembler).discontinuities()
    }

    /// Route one notification. Only a completed EEG window yields an Event.
    pub fn handle(&self, characteristic: Uuid, value: &[u8]) -> Option<Event> {
        if let Some(handle) = eeg_handle_for_characteristic(characteristic) {
            return self.handle_eeg(handle, value);
        }
        if characteristic == CONTROL_CHARACTERISTIC {
            self.handle_control(value);
            return None;
        }
        match AUX_CHARACTERISTICS.iter().find(|(u, _)| *u == characteristic) {
            Some((_, stream)) => debug!(
                "{}: {stream} {} bytes: {value:02x?}",
                self.sensor.hw_address,
                value.len()
            ),
            None => debug!("{}: unexpected notification from {characteristic}", self.sensor.hw_address),
        }
        None
    }

    fn handle_eeg(&self, handle: u16, value: &[u8]) -> Option<Event> {
        let samples = match unpack_eeg_channel(value, SystemTime::now()) {
            Ok(s) => s,
            Err(e) => {
                warn!("{}: EEG packet on handle {handle} skipped: {e}", self.sensor.hw_address);
                return None;
            }
        };
        let window = lock(&self.assembler).push(handle, samples)?;
        Some(window_to_event(&self.sensor, &window))
    }

    fn handle_control(&self, value: &[u8]) {
        let fragment = decode_response(value);
        debug!("{}: control fragment {fragment:?}", self.sensor.hw_address);
        let Some(message) = lock(&self.control).push(&fragment) else {
            return;
        };
        match serde_json::from_str::<serde_json::Value>(&message) {
            Ok(status) => info!("{}: control status {status}", self.sensor.hw_address),
            Err(e) => warn!("{}: control JSON parse error: {e} | raw: {message}", self.sensor.hw_address),
        }
    }
}

#[async_trait]
impl Handler for HeadsetHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn gather(&self, device: Arc<dyn BleDevice>, emit: EventSink) -> Result<()> {
        let services = device.services().await?;
        let eeg: Vec<Uuid> = EEG_CHARACTERISTICS.iter().map(|&(uuid, _)| uuid).collect();
        let mut required = vec![CONTROL_CHARACTERISTIC];
        required.extend_from_slice(&eeg);
        require(&services, HEADSET_SERVICE, &required)?;

        let mut notifications = device.notifications().await?;

        let mut streams = required;
        streams.extend(AUX_CHARACTERISTICS.iter().map(|&(uuid, _)| uuid));
        let subscribed = subscribe_all(&*device, &streams).await;
        info!(
            "{}: {subscribed}/{} headset streams subscribed",
            self.sensor.hw_address,
            streams.len()
        );

        for cmd in STARTUP_COMMANDS {
            write_logged(&*device, CONTROL_CHARACTERISTIC, &encode_command(cmd)).await;
        }

        while let Some(n) = notifications.next().await {
            if let Some(event) = self.handle(n.characteristic, &n.value) {
                emit(event);
            }
        }
        let discontinuities = self.discontinuities();
        if discontinuities > 0 {
            info!(
                "{}: EEG stream ended with {discontinuities} discontinuities",
                self.sensor.hw_address
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockDevice;
    use crate::types::FieldValue;

    const ADDR: &str = "00:55:DA:B5:35:5A";

    /// A valid EEG packet whose 12 samples are all `raw`.
    fn packet(index: u16, raw: u16) -> Vec<u8> {
        let mut p = index.to_be_bytes().to_vec();
        for _ in 0..6 {
            p.push((raw >> 4) as u8);
            p.push((((raw & 0xF) << 4) | (raw >> 8)) as u8);
            p.push(raw as u8);
        }
        p
    }

    fn uuid_for_handle(handle: u16) -> Uuid {
        eeg_characteristic_for_handle(handle).unwrap()
    }

    #[test]
    fn packet_helper_encodes_uniform_samples() {
        let samples = unpack_eeg_channel(&packet(9, 2048), SystemTime::now()).unwrap();
        assert_eq!(samples.sequence_index, 9);
        assert!(samples.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn full_window_becomes_twelve_metrics() {
        let h = HeadsetHandler::with_assembler(Sensor::new(ADDR), EegAssembler::with_anchor(0.0));
        let mut out = None;
        for handle in EEG_ARRIVAL_ORDER {
            assert!(out.is_none());
            out = h.handle(uuid_for_handle(handle), &packet(1, 2048 + 2));
        }
        let event = out.unwrap();
        assert_eq!(event.metrics.len(), EEG_SAMPLES_PER_READING);
        for m in &event.metrics {
            assert_eq!(m.name, "eeg");
            for name in EEG_FIELD_NAMES {
                assert_eq!(m.field(name), Some(&FieldValue::Float(0.9765625)));
            }
        }
    }

    #[test]
    fn channels_delivered_from_separate_threads() {
        const WINDOWS: u16 = 500;
        let h = HeadsetHandler::with_assembler(Sensor::new(ADDR), EegAssembler::with_anchor(0.0));
        let events = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for handle in EEG_ARRIVAL_ORDER {
                let (h, events) = (&h, &events);
                scope.spawn(move || {
                    for index in 0..WINDOWS {
                        if let Some(event) = h.handle(uuid_for_handle(handle), &packet(index, 2048)) {
                            events.lock().unwrap().push(event);
                        }
                    }
                });
            }
        });

        let events = events.into_inner().unwrap();
        assert_eq!(events.len(), WINDOWS as usize);
        assert!(events.iter().all(|e| e.metrics.len() == EEG_SAMPLES_PER_READING));
        let barrier_field = EEG_FIELD_NAMES[eeg_channel_for_handle(EEG_BARRIER_HANDLE).unwrap()];
        assert!(events
            .iter()
            .flat_map(|e| &e.metrics)
            .all(|m| m.field(barrier_field).is_some()));

        let mut starts: Vec<i64> = events.iter().map(|e| e.metrics[0].timestamp).collect();
        starts.sort_unstable();
        starts.dedup();
        assert_eq!(starts.len(), WINDOWS as usize);
        assert_eq!(h.discontinuities(), 0);
    }

    #[test]
    fn short_eeg_packet_is_skipped() {
        let h = HeadsetHandler::with_assembler(Sensor::new(ADDR), EegAssembler::with_anchor(0.0));
        assert!(h.handle(uuid_for_handle(EEG_BARRIER_HANDLE), &[0, 1, 2]).is_none());
    }

    #[test]
    fn control_and_aux_streams_emit_nothing() {
        let h = HeadsetHandler::new(Sensor::new(ADDR));
        let mut first = vec![10u8];
        first.extend_from_slice(b"{\"rc\":0,\"h");
        let mut second = vec![5u8];
        second.extend_from_slice(b"n\":1}");
        assert!(h.handle(CONTROL_CHARACTERISTIC, &first).is_none());
        assert!(!lock(&h.control).is_empty());
        assert!(h.handle(CONTROL_CHARACTERISTIC, &second).is_none());
        assert!(lock(&h.control).is_empty());

        assert!(h.handle(ACCELEROMETER_CHARACTERISTIC, &[0; 20]).is_none());
        assert!(h.handle(PPG_CHARACTERISTICS[1], &[0; 20]).is_none());
    }

    #[tokio::test]
    async fn gather_subscribes_and_sends_startup_commands() {
        let device = Arc::new(MockDevice::headset(ADDR));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |e: Event| {
            let _ = tx.send(e);
        });

        let dev: Arc<dyn BleDevice> = device.clone();
        let handler = HeadsetHandler::new(Sensor::new(ADDR));
        let task = tokio::spawn(async move { handler.gather(dev, sink).await });

        while device.writes().len() < STARTUP_COMMANDS.len() {
            tokio::task::yield_now().await;
        }
        let writes = device.writes();
        assert_eq!(writes[0], (CONTROL_CHARACTERISTIC, vec![0x02, 0x64, 0x0a]));
        assert_eq!(writes[1], (CONTROL_CHARACTERISTIC, vec![0x02, 0x73, 0x0a]));
        assert_eq!(writes[2], (CONTROL_CHARACTERISTIC, vec![0x03, 0x76, 0x31, 0x0a]));
        for &(uuid, _) in &EEG_CHARACTERISTICS {
            assert!(device.is_subscribed(uuid));
        }
        assert!(device.is_subscribed(GYROSCOPE_CHARACTERISTIC));

        for index in 0..2u16 {
            for handle in EEG_ARRIVAL_ORDER {
                device.notify(uuid_for_handle(handle), packet(index, 2048));
            }
        }
        device.close_notifications();
        assert!(task.await.unwrap().is_ok());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(first.metrics.len(), 12);
        assert!(second.metrics[0].timestamp >= first.metrics[11].timestamp);
    }
}
