//! Link abstraction between a device session and the radio.
//!
//! A [`Transport`] owns one peripheral link. Subscribing to a characteristic
//! yields a bounded channel of raw notification payloads; the channel closing
//! while subscribed means the peripheral went away.
//!
//! [`SimulatedTransport`] replays scripted payloads and is what the tests and
//! the demo drive sessions with.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Base of the Bluetooth SIG 128-bit UUID space.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit Bluetooth short identifier into a full UUID.
pub fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// A peripheral link able to stream notifications.
///
/// Every future returned is `Send` so sessions can run on spawned tasks.
pub trait Transport: Send + 'static {
    /// Establish the link. Callers bound this with their own timeout.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start notifications on `characteristic`, buffered up to `capacity`.
    fn subscribe(
        &mut self,
        characteristic: Uuid,
        capacity: usize,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, TransportError>> + Send;

    /// Stop notifications on `characteristic`.
    fn unsubscribe(
        &mut self,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear the link down. Must be safe to call on a link that never connected.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Errors raised by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No radio adapter present
    Unavailable(String),
    /// Peripheral not found
    NotFound(String),
    /// Operation needs a connected link
    NotConnected,
    /// The characteristic is not exposed by the peripheral
    CharacteristicNotFound(Uuid),
    /// Error reported by the backend
    Backend(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unavailable(msg) => write!(f, "Transport unavailable: {msg}"),
            TransportError::NotFound(address) => write!(f, "Peripheral {address} not found"),
            TransportError::NotConnected => write!(f, "Link is not connected"),
            TransportError::CharacteristicNotFound(uuid) => {
                write!(f, "Characteristic {uuid} not found")
            }
            TransportError::Backend(msg) => write!(f, "Transport error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Link operations observed on a [`SimulatedTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Subscribed,
    Unsubscribed,
    Disconnected,
}

/// Shared view of a simulated link's history.
#[derive(Debug, Clone, Default)]
pub struct LinkProbe {
    events: Arc<Mutex<Vec<LinkEvent>>>,
}

impl LinkProbe {
    fn push(&self, event: LinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Every operation so far, in order.
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn was_disconnected(&self) -> bool {
        self.events().contains(&LinkEvent::Disconnected)
    }
}

/// Scripted in-process transport.
///
/// Payloads are sent one per `interval` after subscription. Once the script
/// runs out the stream stays open and silent, unless
/// [`disconnect_after`](Self::disconnect_after) is set, in which case the
/// channel closes after that many payloads as if the peripheral dropped.
#[derive(Debug)]
pub struct SimulatedTransport {
    payloads: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    connect_delay: Duration,
    connect_failure: Option<String>,
    disconnect_after: Option<usize>,
    connected: bool,
    feeder: Option<JoinHandle<()>>,
    probe: LinkProbe,
}

impl SimulatedTransport {
    pub fn new(payloads: Vec<Vec<u8>>, interval: Duration) -> Self {
        Self {
            payloads: Arc::new(payloads),
            interval,
            connect_delay: Duration::ZERO,
            connect_failure: None,
            disconnect_after: None,
            connected: false,
            feeder: None,
            probe: LinkProbe::default(),
        }
    }

    /// Delay every connect attempt.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make every connect attempt fail with `reason`.
    pub fn failing_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_failure = Some(reason.into());
        self
    }

    /// Close the notification stream after `count` payloads.
    pub fn disconnect_after(mut self, count: usize) -> Self {
        self.disconnect_after = Some(count);
        self
    }

    /// Handle for observing link operations after the transport is moved.
    pub fn probe(&self) -> LinkProbe {
        self.probe.clone()
    }

    fn stop_feeder(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl Transport for SimulatedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(reason) = &self.connect_failure {
            return Err(TransportError::Backend(reason.clone()));
        }
        self.connected = true;
        self.probe.push(LinkEvent::Connected);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        _characteristic: Uuid,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.stop_feeder();

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let payloads = Arc::clone(&self.payloads);
        let interval = self.interval;
        let limit = self.disconnect_after;

        self.feeder = Some(tokio::spawn(async move {
            let count = limit.unwrap_or(payloads.len()).min(payloads.len());
            for payload in payloads.iter().take(count) {
                tokio::time::sleep(interval).await;
                if tx.send(payload.clone()).await.is_err() {
                    return;
                }
            }
            if limit.is_none() {
                // Script exhausted; stay subscribed until the reader goes away.
                tx.closed().await;
            }
        }));

        self.probe.push(LinkEvent::Subscribed);
        Ok(rx)
    }

    async fn unsubscribe(&mut self, _characteristic: Uuid) -> Result<(), TransportError> {
        self.stop_feeder();
        self.probe.push(LinkEvent::Unsubscribed);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_feeder();
        self.connected = false;
        self.probe.push(LinkEvent::Disconnected);
        Ok(())
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.stop_feeder();
    }
}
