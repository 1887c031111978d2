//! Per-address connection supervisor.
//!
//! A [`SensorTracker`] owns one device address for the life of the process:
//!
//! ```text
//! Searching ──found──▶ Connecting ──handler selected──▶ Handling
//!     ▲                    │                               │
//!     └────── Backoff ◀────┴──────── any failure ──────────┘
//! ```
//!
//! [`TrackerHandle::stop`] moves it to `Stopped` from any state. Every wait
//! in the loop races the cancellation token, so a stop is observed within
//! one poll interval even mid-search.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handler::{discover_services, registry, select, HandlerEntry};
use crate::transport::{same_address, BleDevice, BleTransport};
use crate::types::{EventSink, Sensor};

/// Bound on the best-effort disconnect after a session ends.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Searching,
    Connecting,
    Handling,
    Backoff,
    Stopped,
}

/// What to do when no handler recognises the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsupportedPolicy {
    /// Stop tracking this address. Other trackers keep running.
    #[default]
    Stop,
    /// Treat it like any other failure and try again after the backoff.
    Retry,
}

/// Retry and timing knobs for one tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Device-list polls per search cycle.
    pub search_attempts: usize,
    pub search_interval: Duration,
    /// Backoff between failed cycles.
    pub retry_delay: Duration,
    /// How long [`TrackerHandle::stop`] waits for the loop to exit.
    pub stop_timeout: Duration,
    pub service_discovery_attempts: usize,
    pub service_discovery_interval: Duration,
    pub on_unsupported: UnsupportedPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_attempts: 15,
            search_interval: Duration::from_secs(4),
            retry_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            service_discovery_attempts: 5,
            service_discovery_interval: Duration::from_secs(4),
            on_unsupported: UnsupportedPolicy::Stop,
        }
    }
}

/// Supervises one sensor address.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use ble_exporter::prelude::*;
/// # async fn demo(transport: Arc<dyn BleTransport>, hub: Arc<EventHub>) -> Result<()> {
/// let handle = SensorTracker::new("B0:B4:48:C9:1A:02", transport, hub.sink())?
///     .with_config(TrackerConfig::default())
///     .spawn();
/// // …
/// handle.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct SensorTracker {
    sensor: Sensor,
    transport: Arc<dyn BleTransport>,
    sink: EventSink,
    config: TrackerConfig,
    handlers: Vec<HandlerEntry>,
}

impl SensorTracker {
    /// Fails with [`Error::InvalidAddress`] for a blank address.
    pub fn new(
        address: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        sink: EventSink,
    ) -> Result<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(Error::InvalidAddress(address));
        }
        Ok(Self {
            sensor: Sensor::new(address),
            transport,
            sink,
            config: TrackerConfig::default(),
            handlers: registry(),
        })
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the handler registry; order is priority.
    pub fn with_handlers(mut self, handlers: Vec<HandlerEntry>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Start the supervision loop on its own task.
    pub fn spawn(self) -> TrackerHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TrackerState::Searching);
        let address = self.sensor.hw_address.clone();
        let stop_timeout = self.config.stop_timeout;
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token, state_tx).await });
        TrackerHandle {
            address,
            cancel,
            state: state_rx,
            stop_timeout,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, state: watch::Sender<TrackerState>) -> Result<()> {
        let address = self.sensor.hw_address.as_str();
        info!("{address}: tracking started");

        let outcome = loop {
            transition(&state, address, TrackerState::Searching);
            let device = match cancellable(&cancel, self.search()).await {
                None => break Ok(()),
                Some(Ok(device)) => device,
                Some(Err(e)) => {
                    warn!("{address}: {e}");
                    transition(&state, address, TrackerState::Backoff);
                    if cancellable(&cancel, tokio::time::sleep(self.config.retry_delay)).await.is_none() {
                        break Ok(());
                    }
                    continue;
                }
            };

            transition(&state, address, TrackerState::Connecting);
            let session = cancellable(&cancel, self.session(Arc::clone(&device), &state)).await;
            match tokio::time::timeout(DISCONNECT_TIMEOUT, device.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{address}: disconnect failed: {e}"),
                Err(_) => debug!("{address}: disconnect timed out"),
            }

            match session {
                None => break Ok(()),
                Some(Ok(())) => warn!("{address}: {}", Error::Disconnected),
                Some(Err(e))
                    if !e.is_transient() && self.config.on_unsupported == UnsupportedPolicy::Stop =>
                {
                    error!("{address}: {e}; no longer tracking this address");
                    break Err(e);
                }
                Some(Err(e)) => warn!("{address}: {e}"),
            }

            transition(&state, address, TrackerState::Backoff);
            info!("{address}: retrying in {:?}", self.config.retry_delay);
            if cancellable(&cancel, tokio::time::sleep(self.config.retry_delay)).await.is_none() {
                break Ok(());
            }
        };

        transition(&state, address, TrackerState::Stopped);
        info!("{address}: tracking stopped");
        outcome
    }

    /// Poll the transport until the address shows up or attempts run out.
    async fn search(&self) -> Result<Arc<dyn BleDevice>> {
        let address = &self.sensor.hw_address;
        let attempts = self.config.search_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.devices().await {
                Ok(devices) => {
                    if let Some(device) = devices.into_iter().find(|d| same_address(&d.address(), address)) {
                        info!("{address}: found");
                        return Ok(device);
                    }
                    debug!("{address}: not visible ({attempt}/{attempts})");
                }
                Err(e) => warn!("{address}: device listing failed: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.search_interval).await;
            }
        }
        Err(Error::DeviceNotFound(address.clone()))
    }

    /// Connect, pick a handler and run it until the link drops.
    ///
    /// `Ok` means the handler's notification stream ended.
    async fn session(
        &self,
        device: Arc<dyn BleDevice>,
        state: &watch::Sender<TrackerState>,
    ) -> Result<()> {
        let address = &self.sensor.hw_address;
        device.connect().await?;
        info!("{address}: connected");

        let services = discover_services(
            &*device,
            self.config.service_discovery_attempts,
            self.config.service_discovery_interval,
        )
        .await?;
        if services.is_empty() {
            return Err(Error::ConnectFailed {
                address: address.clone(),
                reason: "no GATT services discovered".into(),
            });
        }

        let entry = select(&self.handlers, &services)
            .ok_or_else(|| Error::UnsupportedSensor(address.clone()))?;
        info!("{address}: using {} handler", entry.name);
        transition(state, address, TrackerState::Handling);

        let handler = (entry.build)(self.sensor.clone());
        handler.gather(device, Arc::clone(&self.sink)).await
    }
}

fn transition(state: &watch::Sender<TrackerState>, address: &str, to: TrackerState) {
    debug!("{address}: → {to:?}");
    state.send_replace(to);
}

/// Race `fut` against cancellation. `None` means the token fired first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Control side of a spawned [`SensorTracker`].
pub struct TrackerHandle {
    address: String,
    cancel: CancellationToken,
    state: watch::Receiver<TrackerState>,
    stop_timeout: Duration,
    task: JoinHandle<Result<()>>,
}

impl TrackerHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> TrackerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<TrackerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait up to the configured stop timeout.
    ///
    /// Returns `false` if the loop did not exit in time; the task is then
    /// aborted and abandoned.
    pub async fn stop(mut self) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut self.task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                debug!("{}: tracker had already ended: {e}", self.address);
                true
            }
            Ok(Err(e)) => {
                warn!("{}: tracker task failed: {e}", self.address);
                true
            }
            Err(_) => {
                warn!(
                    "{}: tracker did not stop within {:?}, abandoning it",
                    self.address, self.stop_timeout
                );
                self.task.abort();
                false
            }
        }
    }

    /// Wait for the loop to end on its own (terminal error or stop).
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Transport(format!("tracker task failed: {e}"))),
        }
    }
}
