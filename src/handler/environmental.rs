//! TI CC2650 SensorTag: IR temperature and humidity.
//!
//! Both sensors are switched on by writing `0x01` to their configuration
//! characteristic. Values arrive by notification and are additionally polled
//! once per second, since the tag does not always push promptly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{require, subscribe_all, write_logged, Handler};
use crate::error::{Error, Result};
use crate::parse::{parse_humidity, parse_temperature};
use crate::protocol::*;
use crate::transport::{find_service, BleDevice, GattService};
use crate::types::{now_millis, Event, EventSink, Metric, Sensor};

pub const NAME: &str = "environmental";

const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Consecutive polls in which every read failed before the link is
/// declared lost.
const MAX_FAILED_POLLS: u32 = 5;

const VALUE_CHARACTERISTICS: [Uuid; 2] = [
    TEMPERATURE_VALUE_CHARACTERISTIC,
    HUMIDITY_VALUE_CHARACTERISTIC,
];

pub struct EnvironmentalHandler {
    sensor: Sensor,
}

impl EnvironmentalHandler {
    pub fn new(sensor: Sensor) -> Self {
        Self { sensor }
    }

    pub fn boxed(sensor: Sensor) -> Box<dyn Handler> {
        Box::new(Self::new(sensor))
    }

    /// The humidity service is unique to the CC2650.
    pub fn probe(services: &[GattService]) -> bool {
        find_service(services, HUMIDITY_SERVICE).is_some()
    }

    /// Decode one value-characteristic payload, whether pushed or polled.
    ///
    /// Returns `None` for other characteristics and for malformed frames.
    pub fn decode(&self, characteristic: Uuid, value: &[u8]) -> Option<Event> {
        let metric = Metric::new(ENVIRONMENTAL_METRIC, now_millis());
        let metric = if characteristic == TEMPERATURE_VALUE_CHARACTERISTIC {
            match parse_temperature(value) {
                Ok(t) => metric
                    .with_field("object_temperature", t.object_celsius)
                    .with_field("ambient_temperature", t.ambient_celsius),
                Err(e) => {
                    warn!("{}: temperature frame skipped: {e}", self.sensor.hw_address);
                    return None;
                }
            }
        } else if characteristic == HUMIDITY_VALUE_CHARACTERISTIC {
            match parse_humidity(value) {
                Ok(h) => metric
                    .with_field("temperature", h.temperature_celsius)
                    .with_field("humidity", h.humidity_percent),
                Err(e) => {
                    warn!("{}: humidity frame skipped: {e}", self.sensor.hw_address);
                    return None;
                }
            }
        } else {
            debug!("{}: ignoring {characteristic}", self.sensor.hw_address);
            return None;
        };
        Some(Event::single(self.sensor.clone(), metric))
    }
}

#[async_trait]
impl Handler for EnvironmentalHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn gather(&self, device: Arc<dyn BleDevice>, emit: EventSink) -> Result<()> {
        let services = device.services().await?;
        require(
            &services,
            HUMIDITY_SERVICE,
            &[HUMIDITY_VALUE_CHARACTERISTIC, HUMIDITY_CONFIG_CHARACTERISTIC],
        )?;
        require(
            &services,
            TEMPERATURE_SERVICE,
            &[TEMPERATURE_VALUE_CHARACTERISTIC, TEMPERATURE_CONFIG_CHARACTERISTIC],
        )?;

        let mut notifications = device.notifications().await?;

        write_logged(&*device, TEMPERATURE_CONFIG_CHARACTERISTIC, &SENSOR_ENABLE).await;
        write_logged(&*device, HUMIDITY_CONFIG_CHARACTERISTIC, &SENSOR_ENABLE).await;
        let subscribed = subscribe_all(&*device, &VALUE_CHARACTERISTICS).await;
        info!(
            "{}: temperature + humidity enabled ({subscribed}/2 notifying)",
            self.sensor.hw_address
        );

        let mut poll = tokio::time::interval(POLL_PERIOD);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failed_polls = 0;

        loop {
            tokio::select! {
                notification = notifications.next() => {
                    let Some(n) = notification else {
                        return Ok(());
                    };
                    if let Some(event) = self.decode(n.characteristic, &n.value) {
                        emit(event);
                    }
                }
                _ = poll.tick() => {
                    let mut answered = false;
                    for uuid in VALUE_CHARACTERISTICS {
                        match device.read(uuid).await {
                            Ok(value) => {
                                answered = true;
                                if let Some(event) = self.decode(uuid, &value) {
                                    emit(event);
                                }
                            }
                            Err(e) => warn!("{}: poll of {uuid} failed: {e}", self.sensor.hw_address),
                        }
                    }
                    if answered {
                        failed_polls = 0;
                        continue;
                    }
                    failed_polls += 1;
                    if failed_polls >= MAX_FAILED_POLLS {
                        warn!(
                            "{}: no reading answered in {failed_polls} polls, giving up",
                            self.sensor.hw_address
                        );
                        return Err(Error::Disconnected);
                    }
                }
            }
        }
    }
}
