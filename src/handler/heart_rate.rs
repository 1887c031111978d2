//! Chest straps implementing the standard Heart Rate profile (Polar H7).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use super::{require, subscribe_all, Handler};
use crate::error::Result;
use crate::parse::parse_heart_rate;
use crate::protocol::{HEART_RATE_MEASUREMENT_CHARACTERISTIC, HEART_RATE_METRIC, HEART_RATE_SERVICE};
use crate::transport::{find_service, BleDevice, GattService};
use crate::types::{now_millis, Event, EventSink, Metric, Sensor};

pub const NAME: &str = "heart-rate";

pub struct HeartRateHandler {
    sensor: Sensor,
}

impl HeartRateHandler {
    pub fn new(sensor: Sensor) -> Self {
        Self { sensor }
    }

    pub fn boxed(sensor: Sensor) -> Box<dyn Handler> {
        Box::new(Self::new(sensor))
    }

    pub fn probe(services: &[GattService]) -> bool {
        find_service(services, HEART_RATE_SERVICE)
            .is_some_and(|s| s.has_characteristic(HEART_RATE_MEASUREMENT_CHARACTERISTIC))
    }

    /// One Heart Rate Measurement frame → one Event with `beats_per_minute`,
    /// optional `energy_expended`, and `rr0`, `rr1`, … in milliseconds.
    pub fn decode(&self, characteristic: Uuid, value: &[u8]) -> Option<Event> {
        if characteristic != HEART_RATE_MEASUREMENT_CHARACTERISTIC {
            return None;
        }
        let hr = match parse_heart_rate(value) {
            Ok(hr) => hr,
            Err(e) => {
                warn!("{}: heart-rate frame skipped: {e}", self.sensor.hw_address);
                return None;
            }
        };
        if hr.truncated {
            warn!(
                "{}: truncated heart-rate frame ({} bytes), optional fields dropped",
                self.sensor.hw_address,
                value.len()
            );
        }

        let mut metric = Metric::new(HEART_RATE_METRIC, now_millis())
            .with_field("beats_per_minute", i64::from(hr.beats_per_minute));
        if let Some(energy) = hr.energy_expended {
            metric.insert("energy_expended", i64::from(energy));
        }
        for (i, rr) in hr.rr_intervals_ms.iter().enumerate() {
            metric.insert(format!("rr{i}"), *rr);
        }
        debug!("{}: {} bpm", self.sensor.hw_address, hr.beats_per_minute);
        Some(Event::single(self.sensor.clone(), metric))
    }
}

#[async_trait]
impl Handler for HeartRateHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn gather(&self, device: Arc<dyn BleDevice>, emit: EventSink) -> Result<()> {
        let services = device.services().await?;
        require(
            &services,
            HEART_RATE_SERVICE,
            &[HEART_RATE_MEASUREMENT_CHARACTERISTIC],
        )?;

        let mut notifications = device.notifications().await?;
        if subscribe_all(&*device, &[HEART_RATE_MEASUREMENT_CHARACTERISTIC]).await == 1 {
            info!("{}: heart-rate notifications enabled", self.sensor.hw_address);
        }

        while let Some(n) = notifications.next().await {
            if let Some(event) = self.decode(n.characteristic, &n.value) {
                emit(event);
            }
        }
        Ok(())
    }
}
