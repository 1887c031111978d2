//! Per-family protocol handlers and the ordered registry that picks one for
//! a freshly connected device.
//!
//! A handler is built for one connection, configures the device, subscribes
//! to its streams and decodes every notification into [`Event`]s until the
//! link drops.
//!
//! [`Event`]: crate::types::Event

pub mod environmental;
pub mod headset;
pub mod heart_rate;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{find_service, BleDevice, GattService};
use crate::types::{EventSink, Sensor};

pub use environmental::EnvironmentalHandler;
pub use headset::HeadsetHandler;
pub use heart_rate::HeartRateHandler;

/// One sensor family's connection-lifetime job.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configure the device, subscribe, and decode until the notification
    /// stream ends. `Ok(())` means the stream ended; the tracker treats that
    /// as a disconnect.
    async fn gather(&self, device: Arc<dyn BleDevice>, emit: EventSink) -> Result<()>;
}

/// A `(probe, factory)` pair in the handler registry.
#[derive(Clone, Copy)]
pub struct HandlerEntry {
    pub name: &'static str,
    /// Does this family recognise the device's service set?
    pub probe: fn(&[GattService]) -> bool,
    pub build: fn(Sensor) -> Box<dyn Handler>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry").field("name", &self.name).finish()
    }
}

/// Every supported family, in priority order.
pub fn registry() -> Vec<HandlerEntry> {
    vec![
        HandlerEntry {
            name: environmental::NAME,
            probe: EnvironmentalHandler::probe,
            build: EnvironmentalHandler::boxed,
        },
        HandlerEntry {
            name: heart_rate::NAME,
            probe: HeartRateHandler::probe,
            build: HeartRateHandler::boxed,
        },
        HandlerEntry {
            name: headset::NAME,
            probe: HeadsetHandler::probe,
            build: HeadsetHandler::boxed,
        },
    ]
}

/// The first entry whose probe accepts `services`.
pub fn select<'a>(entries: &'a [HandlerEntry], services: &[GattService]) -> Option<&'a HandlerEntry> {
    entries.iter().find(|entry| (entry.probe)(services))
}

/// List services, retrying while the platform still reports none.
///
/// Returns whatever the last attempt saw; an empty list after `attempts`
/// tries is passed back to the caller to decide on.
pub async fn discover_services(
    device: &dyn BleDevice,
    attempts: usize,
    interval: Duration,
) -> Result<Vec<GattService>> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let services = device.services().await?;
        if !services.is_empty() {
            debug!(
                "{}: {} services after {attempt} attempt(s)",
                device.address(),
                services.len()
            );
            return Ok(services);
        }
        if attempt < attempts {
            debug!("{}: no services yet, retrying in {interval:?}", device.address());
            tokio::time::sleep(interval).await;
        }
    }
    Ok(Vec::new())
}

/// Fail with [`Error::ServiceMissing`] / [`Error::CharacteristicMissing`]
/// unless `service` exposes every characteristic in `required`.
pub(crate) fn require(services: &[GattService], service: Uuid, required: &[Uuid]) -> Result<()> {
    let found = find_service(services, service).ok_or(Error::ServiceMissing(service))?;
    match required.iter().find(|&&c| !found.has_characteristic(c)) {
        Some(&missing) => Err(Error::CharacteristicMissing(missing)),
        None => Ok(()),
    }
}

/// Subscribe to each characteristic. Failures are logged and skipped.
///
/// Returns how many subscriptions succeeded.
pub(crate) async fn subscribe_all(device: &dyn BleDevice, characteristics: &[Uuid]) -> usize {
    let mut ok = 0;
    for &uuid in characteristics {
        match device.subscribe(uuid).await {
            Ok(()) => ok += 1,
            Err(e) => warn!("{}: {e}", device.address()),
        }
    }
    ok
}

/// Fire-and-forget configuration write.
pub(crate) async fn write_logged(device: &dyn BleDevice, characteristic: Uuid, value: &[u8]) {
    if let Err(e) = device.write(characteristic, value).await {
        warn!("{}: write to {characteristic} failed: {e}", device.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use crate::transport::mock::MockDevice;

    async fn services_of(device: &MockDevice) -> Vec<GattService> {
        device.services().await.unwrap()
    }

    #[tokio::test]
    async fn each_family_selects_its_handler() {
        let entries = registry();
        let cases = [
            (MockDevice::environmental("A"), environmental::NAME),
            (MockDevice::heart_rate("B"), heart_rate::NAME),
            (MockDevice::headset("C"), headset::NAME),
        ];
        for (device, expected) in cases {
            let services = services_of(&device).await;
            assert_eq!(select(&entries, &services).unwrap().name, expected);
        }
    }

    #[tokio::test]
    async fn unknown_device_selects_nothing() {
        let battery = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
        let services = vec![GattService::new(battery, [])];
        assert!(select(&registry(), &services).is_none());
    }

    #[tokio::test]
    async fn list_order_breaks_ties() {
        // A device exposing both environmental and heart-rate services.
        let mut services = services_of(&MockDevice::heart_rate("A")).await;
        services.extend(services_of(&MockDevice::environmental("A")).await);
        assert_eq!(select(&registry(), &services).unwrap().name, environmental::NAME);

        let mut reversed = registry();
        reversed.reverse();
        assert_eq!(select(&reversed, &services).unwrap().name, heart_rate::NAME);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_retries_while_empty() {
        let device = MockDevice::heart_rate("A");
        device.delay_services(2);
        let services = discover_services(&device, 5, Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(services.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_gives_up_after_attempts() {
        let device = MockDevice::heart_rate("A");
        device.delay_services(10);
        let services = discover_services(&device, 3, Duration::from_secs(4))
            .await
            .unwrap();
        assert!(services.is_empty());
    }

    #[test]
    fn require_reports_what_is_missing() {
        let services = vec![GattService::new(HEART_RATE_SERVICE, [])];
        assert!(matches!(
            require(&services, HEADSET_SERVICE, &[]),
            Err(Error::ServiceMissing(u)) if u == HEADSET_SERVICE
        ));
        assert!(matches!(
            require(&services, HEART_RATE_SERVICE, &[HEART_RATE_MEASUREMENT_CHARACTERISTIC]),
            Err(Error::CharacteristicMissing(u)) if u == HEART_RATE_MEASUREMENT_CHARACTERISTIC
        ));
    }
}
