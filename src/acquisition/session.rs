//! One garment's connection lifecycle.
//!
//! A [`DeviceSession`] connects a [`Transport`] under a timeout, records
//! decoded frames for a fixed window and tears the link down. Notification
//! payloads flow from the transport through a bounded queue that is drained
//! only by the session, so a slow consumer applies backpressure instead of
//! growing memory.

use crate::acquisition::packet::{PacketDecoder, PacketSchema};
use crate::acquisition::transport::{Transport, TransportError};
use crate::core::recording::Frame;
use crate::core::sync::DeviceStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

/// Everything needed to talk to one garment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Stable name used for ordering and error reports
    pub name: String,
    /// Platform address or identifier of the peripheral
    pub address: String,
    /// Characteristic carrying orientation notifications
    pub characteristic: Uuid,
    pub schema: PacketSchema,
}

/// Session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Bounded notification queue size
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Result of a completed recording window.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub device: String,
    pub frames: Vec<Frame>,
    /// Payloads rejected by the decoder
    pub malformed: u64,
}

impl RecordOutcome {
    pub fn into_stream(self) -> DeviceStream {
        DeviceStream::new(self.device, self.frames)
    }
}

/// How the recording loop ended.
enum WindowEnd {
    Elapsed,
    Disconnected,
    Cancelled,
}

/// An open link to one garment.
pub struct DeviceSession<T: Transport> {
    spec: DeviceSpec,
    transport: T,
    queue_capacity: usize,
}

impl<T: Transport> DeviceSession<T> {
    /// Connect to the device, giving up after `config.connect_timeout`.
    pub async fn open(
        mut transport: T,
        spec: DeviceSpec,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        tracing::debug!(device = %spec.name, address = %spec.address, "Connecting");

        let reason = match timeout(config.connect_timeout, transport.connect()).await {
            Ok(Ok(())) => {
                tracing::info!(device = %spec.name, "Connected");
                return Ok(Self {
                    spec,
                    transport,
                    queue_capacity: config.queue_capacity,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "connection timed out after {:.1}s",
                config.connect_timeout.as_secs_f64()
            ),
        };

        // Release whatever a half-finished attempt may hold.
        if let Err(e) = transport.disconnect().await {
            tracing::debug!(device = %spec.name, error = %e, "Cleanup after failed connect");
        }
        tracing::warn!(device = %spec.name, %reason, "Connection failed");
        Err(SessionError::ConnectionError {
            device: spec.name,
            reason,
        })
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn device(&self) -> &str {
        &self.spec.name
    }

    /// Record frames for `duration`.
    ///
    /// Malformed payloads are counted and skipped. The window ends early with
    /// [`SessionError::StreamInterrupted`] if the stream closes, or with
    /// [`SessionError::Cancelled`] once `cancel` reads `true`. Either way the
    /// frames received so far travel with the error. The session stays open;
    /// call [`close`](Self::close) afterwards on every path.
    pub async fn record(
        &mut self,
        duration: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RecordOutcome, SessionError> {
        let device = self.spec.name.clone();
        let characteristic = self.spec.characteristic;

        if *cancel.borrow() {
            return Err(SessionError::Cancelled {
                device,
                partial: Vec::new(),
            });
        }

        let mut queue = self
            .transport
            .subscribe(characteristic, self.queue_capacity)
            .await
            .map_err(|source| SessionError::Transport {
                device: device.clone(),
                source,
            })?;

        let deadline = Instant::now() + duration;
        let mut frames = Vec::new();
        let mut malformed = 0u64;
        let mut decoder = PacketDecoder::new(self.spec.schema);
        let mut cancel_live = true;

        let end = loop {
            tokio::select! {
                biased;

                changed = cancel.changed(), if cancel_live => match changed {
                    Ok(()) if *cancel.borrow() => break WindowEnd::Cancelled,
                    Ok(()) => {}
                    // Nobody can cancel us anymore
                    Err(_) => cancel_live = false,
                },
                _ = sleep_until(deadline) => break WindowEnd::Elapsed,
                payload = queue.recv() => match payload {
                    Some(raw) => match decoder.decode(&raw) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => {
                            malformed += 1;
                            tracing::debug!(device = %device, error = %e, "Skipping packet");
                        }
                    },
                    None => break WindowEnd::Disconnected,
                },
            }
        };

        drop(queue);
        let unsubscribed = self.transport.unsubscribe(characteristic).await;

        match end {
            WindowEnd::Elapsed => {
                unsubscribed.map_err(|source| SessionError::Transport {
                    device: device.clone(),
                    source,
                })?;
                if malformed > 0 {
                    tracing::warn!(device = %device, malformed, "Dropped malformed packets");
                }
                tracing::info!(
                    device = %device,
                    frames = frames.len(),
                    "Recording window complete"
                );
                Ok(RecordOutcome {
                    device,
                    frames,
                    malformed,
                })
            }
            WindowEnd::Disconnected => {
                tracing::warn!(device = %device, frames = frames.len(), "Stream interrupted");
                Err(SessionError::StreamInterrupted {
                    device,
                    partial: frames,
                })
            }
            WindowEnd::Cancelled => {
                tracing::info!(device = %device, frames = frames.len(), "Recording cancelled");
                Err(SessionError::Cancelled {
                    device,
                    partial: frames,
                })
            }
        }
    }

    /// Disconnect and release the link.
    pub async fn close(mut self) -> Result<(), SessionError> {
        let result = self.transport.disconnect().await;
        tracing::debug!(device = %self.spec.name, "Disconnected");
        result.map_err(|source| SessionError::Transport {
            device: self.spec.name,
            source,
        })
    }
}

/// Session failures. Every variant names the device.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Connect failed or timed out
    ConnectionError { device: String, reason: String },
    /// The stream closed before the window elapsed
    StreamInterrupted { device: String, partial: Vec<Frame> },
    /// A sibling failure cancelled the window
    Cancelled { device: String, partial: Vec<Frame> },
    /// Subscribe, unsubscribe or disconnect failed
    Transport {
        device: String,
        source: TransportError,
    },
}

impl SessionError {
    pub fn device(&self) -> &str {
        match self {
            SessionError::ConnectionError { device, .. }
            | SessionError::StreamInterrupted { device, .. }
            | SessionError::Cancelled { device, .. }
            | SessionError::Transport { device, .. } => device,
        }
    }

    /// Frames received before the failure, if any.
    pub fn partial_frames(&self) -> &[Frame] {
        match self {
            SessionError::StreamInterrupted { partial, .. }
            | SessionError::Cancelled { partial, .. } => partial,
            _ => &[],
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ConnectionError { device, reason } => {
                write!(f, "Failed to connect to {device}: {reason}")
            }
            SessionError::StreamInterrupted { device, partial } => write!(
                f,
                "Stream from {device} interrupted after {} frames",
                partial.len()
            ),
            SessionError::Cancelled { device, partial } => write!(
                f,
                "Recording on {device} cancelled after {} frames",
                partial.len()
            ),
            SessionError::Transport { device, source } => write!(f, "{device}: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::transport::{bluetooth_uuid, LinkEvent, SimulatedTransport};
    use crate::core::quaternion::{ComponentOrder, Orientation};

    fn spec(sensors: usize) -> DeviceSpec {
        DeviceSpec {
            name: "jacket".to_string(),
            address: "sim-jacket".to_string(),
            characteristic: bluetooth_uuid(0xFF64),
            schema: PacketSchema::new(sensors, ComponentOrder::WXYZ),
        }
    }

    fn payloads(schema: &PacketSchema, count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let q = Orientation::new(1.0, i as f64 / 100.0, 0.0, 0.0);
                schema
                    .encode(&vec![q; schema.sensors_per_device])
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_until_window_elapses() {
        let spec = spec(2);
        let link = SimulatedTransport::new(payloads(&spec.schema, 100), Duration::from_millis(10));
        let probe = link.probe();
        let (_tx, mut cancel) = watch::channel(false);

        let mut session = DeviceSession::open(link, spec, &SessionConfig::default())
            .await
            .unwrap();
        let outcome = session
            .record(Duration::from_millis(505), &mut cancel)
            .await
            .unwrap();
        session.close().await.unwrap();

        assert_eq!(outcome.frames.len(), 50);
        assert_eq!(outcome.malformed, 0);
        for (i, frame) in outcome.frames.iter().enumerate() {
            assert_eq!(frame.sequence_number(), i as u64);
        }
        assert_eq!(
            probe.events(),
            vec![
                LinkEvent::Connected,
                LinkEvent::Subscribed,
                LinkEvent::Unsubscribed,
                LinkEvent::Disconnected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_packets_are_counted_and_skipped() {
        let spec = spec(5);
        let mut script = payloads(&spec.schema, 4);
        script.insert(2, vec![0u8; 39]);
        let link = SimulatedTransport::new(script, Duration::from_millis(10));
        let (_tx, mut cancel) = watch::channel(false);

        let mut session = DeviceSession::open(link, spec, &SessionConfig::default())
            .await
            .unwrap();
        let outcome = session
            .record(Duration::from_secs(1), &mut cancel)
            .await
            .unwrap();
        session.close().await.unwrap();

        assert_eq!(outcome.frames.len(), 4);
        assert_eq!(outcome.malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let link = SimulatedTransport::new(vec![], Duration::from_millis(10))
            .with_connect_delay(Duration::from_secs(60));
        let probe = link.probe();
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        };

        let err = DeviceSession::open(link, spec(1), &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::ConnectionError { ref device, .. } if device == "jacket"
        ));
        assert!(probe.was_disconnected());
    }

    #[tokio::test]
    async fn test_connect_failure_names_device() {
        let link =
            SimulatedTransport::new(vec![], Duration::from_millis(10)).failing_connect("refused");
        let err = DeviceSession::open(link, spec(1), &SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.device(), "jacket");
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_window_keeps_partial_frames() {
        let spec = spec(1);
        let link = SimulatedTransport::new(payloads(&spec.schema, 10), Duration::from_millis(10))
            .disconnect_after(3);
        let probe = link.probe();
        let (_tx, mut cancel) = watch::channel(false);

        let mut session = DeviceSession::open(link, spec, &SessionConfig::default())
            .await
            .unwrap();
        let err = session
            .record(Duration::from_secs(5), &mut cancel)
            .await
            .unwrap_err();
        session.close().await.unwrap();

        assert!(matches!(err, SessionError::StreamInterrupted { .. }));
        assert_eq!(err.partial_frames().len(), 3);
        assert!(probe.was_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_window() {
        let spec = spec(1);
        let link = SimulatedTransport::new(payloads(&spec.schema, 1000), Duration::from_millis(10));
        let (tx, mut cancel) = watch::channel(false);

        let mut session = DeviceSession::open(link, spec, &SessionConfig::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(105)).await;
            let _ = tx.send(true);
        });
        let err = session
            .record(Duration::from_secs(10), &mut cancel)
            .await
            .unwrap_err();
        session.close().await.unwrap();

        assert!(matches!(err, SessionError::Cancelled { .. }));
        assert_eq!(err.partial_frames().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cancel_sender_does_not_end_window() {
        let spec = spec(1);
        let link = SimulatedTransport::new(payloads(&spec.schema, 10), Duration::from_millis(10));
        let (tx, mut cancel) = watch::channel(false);
        drop(tx);

        let mut session = DeviceSession::open(link, spec, &SessionConfig::default())
            .await
            .unwrap();
        let outcome = session
            .record(Duration::from_millis(200), &mut cancel)
            .await
            .unwrap();
        assert_eq!(outcome.frames.len(), 10);
    }
}
