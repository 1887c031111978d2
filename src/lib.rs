//! # ble-exporter
//!
//! Async Rust library and daemon that tracks Bluetooth Low Energy sensors,
//! decodes their notifications into normalized [`types::Event`]s, and fans
//! those events out to any number of in-process consumers.
//!
//! ## Supported hardware
//!
//! | Family | Device | Identified by | Metric |
//! |---|---|---|---|
//! | Environmental | TI CC2650 SensorTag | humidity service `f000aa20-…` | `cc2650` |
//! | Heart rate | Polar H7 (any HRS strap) | Heart Rate service `0x180D` | `polar-h7` |
//! | EEG headset | Interaxon Muse (classic firmware) | service `0xFE8D` | `eeg` |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ble_exporter::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let hub = Arc::new(EventHub::new());
//!     let (_id, mut rx) = hub.subscribe_channel();
//!
//!     let tracker = SensorTracker::new("00:22:D0:AA:1F:3B", transport, hub.sink())?.spawn();
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{} → {:?}", event.sensor.hw_address, event.metrics);
//!     }
//!     tracker.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`tracker`] | Per-address connection supervisor: search, connect, select handler, retry |
//! | [`handler`] | The [`handler::Handler`] trait and the ordered probe registry |
//! | [`hub`] | In-process event fan-out |
//! | [`transport`] | BLE abstraction, with `btleplug` and mock implementations |
//! | [`types`] | Sensor, Metric, FieldValue, Event and headset sample types |
//! | [`protocol`] | GATT UUIDs, sampling constants, and control-channel framing |
//! | [`parse`] | Byte-level decoders for every sensor family |
//! | [`eeg`] | Headset multi-channel reassembly and sample clock |
//! | [`export`] | Time-series JSON shaping for downstream sinks |

pub mod eeg;
pub mod error;
pub mod export;
pub mod handler;
pub mod hub;
pub mod parse;
pub mod protocol;
pub mod tracker;
pub mod transport;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Supervision ───────────────────────────────────────────────────────────
    pub use crate::tracker::{
        SensorTracker, TrackerConfig, TrackerHandle, TrackerState, UnsupportedPolicy,
    };

    // ── Handlers and fan-out ──────────────────────────────────────────────────
    pub use crate::handler::{registry, Handler, HandlerEntry};
    pub use crate::hub::{EventHub, SubscriptionId};

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::btle::BtleplugTransport;
    pub use crate::transport::mock::{MockDevice, MockTransport};
    pub use crate::transport::{BleDevice, BleTransport, GattService, Notification};

    // ── Data model ────────────────────────────────────────────────────────────
    pub use crate::error::{Error, Result};
    pub use crate::types::{Event, EventSink, FieldValue, Metric, Sensor};
}
