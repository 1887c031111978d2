//! [`BleTransport`] backed by `btleplug` (BlueZ, CoreBluetooth, WinRT).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use super::{BleDevice, BleTransport, GattService, Notification, NotificationStream};
use crate::error::{Error, Result};

/// BlueZ's `Device1.Connect` can block indefinitely when the device walks
/// out of range; a BLE connect normally takes under two seconds.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// The first local adapter, scanning continuously from construction on.
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first adapter and start an unfiltered scan.
    ///
    /// The scan is never stopped; trackers poll [`BleTransport::devices`]
    /// for the peripherals it has seen.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("no Bluetooth adapter found".into()))?;

        // CBCentralManager starts in "unknown" and silently ignores scans
        // until it reports poweredOn.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("adapter still {state:?} after 3 s, scanning anyway");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("adapter_state() failed: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE discovery started");
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn devices(&self) -> Result<Vec<Arc<dyn BleDevice>>> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .into_iter()
            .map(|p| Arc::new(BtleplugDevice::new(self.adapter.clone(), p)) as Arc<dyn BleDevice>)
            .collect())
    }
}

/// One btleplug peripheral.
pub struct BtleplugDevice {
    adapter: Adapter,
    peripheral: Peripheral,
    address: String,
}

impl BtleplugDevice {
    fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        // CoreBluetooth hides MAC addresses; fall back to the platform id.
        let addr = peripheral.address();
        let address = if addr == BDAddr::default() {
            peripheral.id().to_string()
        } else {
            addr.to_string()
        };
        Self {
            adapter,
            peripheral,
            address,
        }
    }

    /// Resolves when the adapter reports this peripheral disconnected.
    ///
    /// BlueZ keeps the notification stream open after the link drops, so
    /// the adapter's event stream is the reliable signal.
    async fn disconnected(&self) -> BoxFuture<'static, ()> {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("{}: could not watch adapter events: {e}", self.address);
                return future::pending().boxed();
            }
        };
        let id = self.peripheral.id();
        let address = self.address.clone();
        async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        info!("{address}: disconnected");
                        return;
                    }
                }
            }
            warn!("{address}: adapter event stream ended");
        }
        .boxed()
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::CharacteristicMissing(uuid))
    }
}

#[async_trait]
impl BleDevice for BtleplugDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        let connect_failed = |reason: String| Error::ConnectFailed {
            address: self.address.clone(),
            reason,
        };

        if !self.peripheral.is_connected().await.unwrap_or(false) {
            tokio::time::timeout(CONNECT_TIMEOUT, self.peripheral.connect())
                .await
                .map_err(|_| connect_failed(format!("timed out after {CONNECT_TIMEOUT:?}")))?
                .map_err(|e| connect_failed(e.to_string()))?;
        }

        // BlueZ reports the link up before its GATT cache is populated;
        // discovering right away can return an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVERY_TIMEOUT, self.peripheral.discover_services())
            .await
            .map_err(|_| connect_failed("service discovery timed out".into()))?
            .map_err(|e| connect_failed(e.to_string()))?;
        debug!("{}: services discovered", self.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<GattService>> {
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService::new(s.uuid, s.characteristics.into_iter().map(|c| c.uuid)))
            .collect())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .write(&c, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&c)
            .await
            .map_err(|e| Error::NotificationSubscribeFailed {
                uuid: characteristic,
                reason: e.to_string(),
            })
    }

    /// Ends when the peripheral disconnects.
    async fn notifications(&self) -> Result<NotificationStream> {
        let disconnected = self.disconnected().await;
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .take_until(disconnected)
            .boxed())
    }
}
