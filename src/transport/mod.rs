//! The BLE surface the exporter needs, expressed as two async traits.
//!
//! [`btle`] implements them on top of `btleplug`; [`mock`] is a scripted
//! in-memory implementation for tests and `--simulate`.

pub mod btle;
pub mod mock;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

/// A primary GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// Find a service by UUID in a discovered service list.
pub fn find_service(services: &[GattService], uuid: Uuid) -> Option<&GattService> {
    services.iter().find(|s| s.uuid == uuid)
}

/// One value pushed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Every notification from one connected device, across all subscribed
/// characteristics. Ends when the link drops.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// A peripheral as seen by the exporter.
#[async_trait]
pub trait BleDevice: Send + Sync {
    /// Hardware address used to match configured sensors.
    fn address(&self) -> String;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Services discovered on the connected device. May be empty while the
    /// platform stack is still populating its GATT cache.
    async fn services(&self) -> Result<Vec<GattService>>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Enable notifications; values show up on [`BleDevice::notifications`].
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    async fn notifications(&self) -> Result<NotificationStream>;
}

/// The discovery side: whatever devices the adapter can currently see.
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn devices(&self) -> Result<Vec<Arc<dyn BleDevice>>>;
}

/// Case-insensitive address comparison (`aa:bb` matches `AA:BB`).
pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
