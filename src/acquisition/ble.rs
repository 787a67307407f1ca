//! Bluetooth Low Energy transport backed by btleplug.
//!
//! The peripheral is located by address, platform identifier or advertised
//! name, connected, and its services discovered. Notifications for the
//! subscribed characteristic are forwarded into the session's bounded queue
//! by a small task. The task ends when the notification stream does or when
//! the adapter reports the peripheral disconnected, and dropping its sender
//! closes the queue.

use crate::acquisition::transport::{Transport, TransportError};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(200);

fn backend(e: btleplug::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

/// A single BLE peripheral link.
pub struct BleTransport {
    address: String,
    scan_window: Duration,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    forwarder: Option<JoinHandle<()>>,
}

impl BleTransport {
    /// `address` may be a MAC address, a CoreBluetooth identifier or the
    /// advertised local name.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scan_window: Duration::from_secs(8),
            adapter: None,
            peripheral: None,
            forwarder: None,
        }
    }

    /// How long to scan for the peripheral before giving up.
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    async fn matches(&self, peripheral: &Peripheral) -> bool {
        let wanted = self.address.to_lowercase();
        if peripheral.address().to_string().to_lowercase() == wanted
            || format!("{:?}", peripheral.id()).to_lowercase().contains(&wanted)
        {
            return true;
        }
        match peripheral.properties().await {
            Ok(Some(props)) => props
                .local_name
                .is_some_and(|name| name.to_lowercase() == wanted),
            _ => false,
        }
    }

    async fn locate(&self) -> Result<(Adapter, Peripheral), TransportError> {
        if self.address.trim().is_empty() {
            return Err(TransportError::NotFound("<no address configured>".into()));
        }
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter found".into()))?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;
        let deadline = Instant::now() + self.scan_window;

        let found = loop {
            let peripherals = adapter.peripherals().await.map_err(backend)?;
            let mut hit = None;
            for peripheral in peripherals {
                if self.matches(&peripheral).await {
                    hit = Some(peripheral);
                    break;
                }
            }
            if hit.is_some() || Instant::now() >= deadline {
                break hit;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!(error = %e, "Stopping scan failed");
        }
        let peripheral = found.ok_or_else(|| TransportError::NotFound(self.address.clone()))?;
        Ok((adapter, peripheral))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self
            .peripheral
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))?;
        Ok((peripheral, characteristic))
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let (adapter, peripheral) = self.locate().await?;
        peripheral.connect().await.map_err(backend)?;
        // Keep the handle first so a failed discovery still gets disconnected.
        self.adapter = Some(adapter);
        self.peripheral = Some(peripheral.clone());
        peripheral.discover_services().await.map_err(backend)?;
        tracing::debug!(address = %self.address, "Services discovered");
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let adapter = self.adapter.as_ref().ok_or(TransportError::NotConnected)?;
        let events = adapter.events().await.map_err(backend)?;
        let notifications = peripheral.notifications().await.map_err(backend)?;
        peripheral.subscribe(&target).await.map_err(backend)?;

        let id = peripheral.id();
        let link_lost = events.filter_map(move |event| {
            let lost = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
            futures::future::ready(lost.then_some(()))
        });

        self.stop_forwarder();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let address = self.address.clone();
        self.forwarder = Some(tokio::spawn(async move {
            forward(notifications, link_lost, characteristic, tx).await;
            tracing::debug!(address = %address, "Notification forwarder stopped");
        }));
        Ok(rx)
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        self.stop_forwarder();
        let (peripheral, target) = self.characteristic(characteristic)?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.unsubscribe(&target).await.map_err(backend)?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_forwarder();
        self.adapter = None;
        if let Some(peripheral) = self.peripheral.take() {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await.map_err(backend)?;
            }
        }
        Ok(())
    }
}

/// Forward matching notifications into `tx` until the notification stream
/// ends, `link_lost` yields, or the receiver is dropped.
async fn forward<N, D>(
    mut notifications: N,
    mut link_lost: D,
    characteristic: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
) where
    N: Stream<Item = ValueNotification> + Unpin,
    D: Stream<Item = ()> + Unpin,
{
    loop {
        tokio::select! {
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    break;
                };
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            Some(()) = link_lost.next() => {
                tracing::warn!("Peripheral disconnected during capture");
                break;
            }
        }
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_ffe4_0000_1000_8000_0080_5f9b_34fb);

    fn notification(uuid: Uuid, value: u8) -> ValueNotification {
        ValueNotification {
            uuid,
            value: vec![value],
        }
    }

    #[tokio::test]
    async fn test_forward_filters_characteristic() {
        let other = Uuid::from_u128(1);
        let notifications = futures::stream::iter(vec![
            notification(CHARACTERISTIC, 1),
            notification(other, 2),
            notification(CHARACTERISTIC, 3),
        ]);
        let (tx, mut rx) = mpsc::channel(8);

        forward(notifications, futures::stream::pending(), CHARACTERISTIC, tx).await;

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![3]));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_event_closes_queue() {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link_lost = receiver_stream(link_rx);
        let (tx, mut rx) = mpsc::channel(8);

        let forwarder = tokio::spawn(forward(
            futures::stream::pending(),
            link_lost,
            CHARACTERISTIC,
            tx,
        ));
        link_tx.send(()).unwrap();

        assert_eq!(rx.recv().await, None);
        forwarder.await.unwrap();
    }

    fn receiver_stream(
        mut rx: mpsc::UnboundedReceiver<()>,
    ) -> impl Stream<Item = ()> + Unpin {
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
