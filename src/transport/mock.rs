//! In-memory [`BleTransport`] with scripted devices.
//!
//! Tests and `--simulate` build [`MockDevice`]s advertising one of the
//! supported service layouts, then push payloads with [`MockDevice::notify`]
//! as if the hardware had sent them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{BleDevice, BleTransport, GattService, Notification, NotificationStream};
use crate::error::{Error, Result};
use crate::lock;
use crate::protocol::*;

#[derive(Default)]
struct DeviceState {
    connected: bool,
    link_lost: bool,
    connects: usize,
    fail_connects: usize,
    empty_service_polls: usize,
    subscribed: HashSet<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    values: HashMap<Uuid, Vec<u8>>,
    listeners: Vec<mpsc::UnboundedSender<Notification>>,
}

/// A fake peripheral. Records everything the exporter does to it.
pub struct MockDevice {
    address: String,
    services: Vec<GattService>,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new(address: impl Into<String>, services: Vec<GattService>) -> Self {
        Self {
            address: address.into(),
            services,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// A CC2650 exposing the humidity and IR temperature services.
    pub fn environmental(address: impl Into<String>) -> Self {
        Self::new(
            address,
            vec![
                GattService::new(
                    HUMIDITY_SERVICE,
                    [
                        HUMIDITY_VALUE_CHARACTERISTIC,
                        HUMIDITY_CONFIG_CHARACTERISTIC,
                        HUMIDITY_PERIOD_CHARACTERISTIC,
                    ],
                ),
                GattService::new(
                    TEMPERATURE_SERVICE,
                    [
                        TEMPERATURE_VALUE_CHARACTERISTIC,
                        TEMPERATURE_CONFIG_CHARACTERISTIC,
                        TEMPERATURE_PERIOD_CHARACTERISTIC,
                    ],
                ),
            ],
        )
    }

    /// A chest strap exposing the standard Heart Rate service.
    pub fn heart_rate(address: impl Into<String>) -> Self {
        Self::new(
            address,
            vec![GattService::new(
                HEART_RATE_SERVICE,
                [HEART_RATE_MEASUREMENT_CHARACTERISTIC],
            )],
        )
    }

    /// An EEG headset with control, EEG, IMU, telemetry and PPG streams.
    pub fn headset(address: impl Into<String>) -> Self {
        let characteristics = [
            CONTROL_CHARACTERISTIC,
            TELEMETRY_CHARACTERISTIC,
            ACCELEROMETER_CHARACTERISTIC,
            GYROSCOPE_CHARACTERISTIC,
        ]
        .into_iter()
        .chain(EEG_CHARACTERISTICS.iter().map(|&(uuid, _)| uuid))
        .chain(PPG_CHARACTERISTICS);
        Self::new(address, vec![GattService::new(HEADSET_SERVICE, characteristics)])
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        lock(&self.state).fail_connects = n;
    }

    /// Report no services for the next `n` discovery calls, like a stack
    /// whose GATT cache is still warming up.
    pub fn delay_services(&self, n: usize) {
        lock(&self.state).empty_service_polls = n;
    }

    /// Value returned by subsequent reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) {
        lock(&self.state).values.insert(characteristic, value.into());
    }

    /// Push a notification. Dropped unless the characteristic is subscribed.
    pub fn notify(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> bool {
        let mut state = lock(&self.state);
        if !state.subscribed.contains(&characteristic) {
            return false;
        }
        let notification = Notification {
            characteristic,
            value: value.into(),
        };
        state
            .listeners
            .retain(|tx| tx.send(notification.clone()).is_ok());
        !state.listeners.is_empty()
    }

    /// End every open notification stream, as a dropped link would.
    pub fn close_notifications(&self) {
        let mut state = lock(&self.state);
        state.listeners.clear();
        state.subscribed.clear();
    }

    /// Lose the link without ending notification streams, the way BlueZ
    /// behaves when a device walks out of range. Reads and writes fail
    /// until the next connect.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.link_lost = true;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        lock(&self.state).subscribed.contains(&characteristic)
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    fn check_characteristic(&self, uuid: Uuid) -> Result<()> {
        if lock(&self.state).link_lost {
            return Err(Error::Transport("not connected".into()));
        }
        if self.services.iter().any(|s| s.has_characteristic(uuid)) {
            Ok(())
        } else {
            Err(Error::CharacteristicMissing(uuid))
        }
    }
}

#[async_trait]
impl BleDevice for MockDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::ConnectFailed {
                address: self.address.clone(),
                reason: "scripted failure".into(),
            });
        }
        state.connected = true;
        state.link_lost = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.listeners.clear();
        state.subscribed.clear();
        Ok(())
    }

    async fn services(&self) -> Result<Vec<GattService>> {
        let mut state = lock(&self.state);
        if state.empty_service_polls > 0 {
            state.empty_service_polls -= 1;
            return Ok(Vec::new());
        }
        Ok(self.services.clone())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.check_characteristic(characteristic)?;
        Ok(lock(&self.state)
            .values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.check_characteristic(characteristic)?;
        lock(&self.state)
            .writes
            .push((characteristic, value.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.check_characteristic(characteristic)
            .map_err(|e| Error::NotificationSubscribeFailed {
                uuid: characteristic,
                reason: e.to_string(),
            })?;
        lock(&self.state).subscribed.insert(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).listeners.push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })
        .boxed())
    }
}

/// A transport whose visible device set is edited by the test.
#[derive(Default)]
pub struct MockTransport {
    devices: Mutex<Vec<Arc<MockDevice>>>,
    scans: Mutex<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: Arc<MockDevice>) {
        lock(&self.devices).push(device);
    }

    pub fn remove(&self, address: &str) {
        lock(&self.devices).retain(|d| !super::same_address(&d.address, address));
    }

    /// How many times the device list has been requested.
    pub fn scan_count(&self) -> usize {
        *lock(&self.scans)
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn devices(&self) -> Result<Vec<Arc<dyn BleDevice>>> {
        *lock(&self.scans) += 1;
        Ok(lock(&self.devices)
            .iter()
            .map(|d| d.clone() as Arc<dyn BleDevice>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_requires_subscription() {
        let device = MockDevice::heart_rate("AA");
        let mut stream = device.notifications().await.unwrap();

        assert!(!device.notify(HEART_RATE_MEASUREMENT_CHARACTERISTIC, [0, 60]));
        device
            .subscribe(HEART_RATE_MEASUREMENT_CHARACTERISTIC)
            .await
            .unwrap();
        assert!(device.notify(HEART_RATE_MEASUREMENT_CHARACTERISTIC, [0, 60]));

        let n = stream.next().await.unwrap();
        assert_eq!(n.characteristic, HEART_RATE_MEASUREMENT_CHARACTERISTIC);
        assert_eq!(n.value, vec![0, 60]);

        device.close_notifications();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_characteristic_is_rejected() {
        let device = MockDevice::heart_rate("AA");
        assert!(matches!(
            device.write(HUMIDITY_CONFIG_CHARACTERISTIC, &[1]).await,
            Err(Error::CharacteristicMissing(_))
        ));
        assert!(matches!(
            device.subscribe(CONTROL_CHARACTERISTIC).await,
            Err(Error::NotificationSubscribeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let device = MockDevice::environmental("AA");
        device.fail_connects(1);
        assert!(device.connect().await.is_err());
        assert!(device.connect().await.is_ok());
        assert!(device.is_connected());
        assert_eq!(device.connect_count(), 2);
    }

    #[tokio::test]
    async fn dropped_link_fails_io_until_reconnect() {
        let device = MockDevice::environmental("AA");
        device.connect().await.unwrap();
        device.drop_link();
        assert!(!device.is_connected());
        assert!(matches!(
            device.read(HUMIDITY_VALUE_CHARACTERISTIC).await,
            Err(Error::Transport(_))
        ));
        assert!(device.write(HUMIDITY_CONFIG_CHARACTERISTIC, &[1]).await.is_err());

        device.connect().await.unwrap();
        assert!(device.read(HUMIDITY_VALUE_CHARACTERISTIC).await.is_ok());
    }

    #[tokio::test]
    async fn transport_lists_and_removes() {
        let transport = MockTransport::new();
        transport.add(Arc::new(MockDevice::headset("00:55:DA:B5:35:5A")));
        assert_eq!(transport.devices().await.unwrap().len(), 1);
        transport.remove("00:55:da:b5:35:5a");
        assert!(transport.devices().await.unwrap().is_empty());
        assert_eq!(transport.scan_count(), 2);
    }
}
