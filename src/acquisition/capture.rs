//! Concurrent multi-garment capture.
//!
//! A capture runs in two phases. First every device session is opened
//! concurrently; if any connect fails, the sessions that did open are closed
//! and the failing device is reported. Then every session records on its own
//! task. The first session to fail flips a shared cancellation signal, its
//! siblings stop early and clean up, and the capture reports the device that
//! failed first. Results meet only at the fan-in, where the surviving streams
//! are synchronized into a single [`Recording`].

use crate::acquisition::session::{
    DeviceSession, DeviceSpec, RecordOutcome, SessionConfig, SessionError,
};
use crate::acquisition::transport::Transport;
use crate::core::recording::Recording;
use crate::core::sync::{SyncError, Synchronizer};
use crate::stats::{create_shared_stats, SharedCaptureStats};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A device paired with the link used to reach it.
pub struct DeviceLink<T: Transport> {
    pub spec: DeviceSpec,
    pub transport: T,
}

impl<T: Transport> DeviceLink<T> {
    pub fn new(spec: DeviceSpec, transport: T) -> Self {
        Self { spec, transport }
    }
}

/// A finished capture.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub recording: Recording,
    /// Malformed packets per device, in device order
    pub malformed: Vec<(String, u64)>,
}

/// Runs captures across a fixed set of devices.
#[derive(Debug, Clone)]
pub struct CaptureCoordinator {
    session_config: SessionConfig,
    synchronizer: Synchronizer,
    stats: SharedCaptureStats,
}

impl CaptureCoordinator {
    pub fn new(session_config: SessionConfig, synchronizer: Synchronizer) -> Self {
        Self {
            session_config,
            synchronizer,
            stats: create_shared_stats(),
        }
    }

    /// Count frames and drops into `stats`.
    pub fn with_stats(mut self, stats: SharedCaptureStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &SharedCaptureStats {
        &self.stats
    }

    /// Capture `duration` of data from every link and label the result.
    pub async fn capture<T: Transport>(
        &self,
        links: Vec<DeviceLink<T>>,
        label: &str,
        duration: Duration,
    ) -> Result<CaptureOutcome, CaptureError> {
        let created_at = Utc::now();
        let sessions = match self.open_all(links).await {
            Ok(sessions) => sessions,
            Err(e) => {
                self.stats.record_capture_failure();
                return Err(e);
            }
        };

        tracing::info!(devices = sessions.len(), label, "Recording started");
        let result = self.record_all(sessions, duration).await;
        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.stats.record_capture_failure();
                tracing::error!(error = %e, "Capture failed");
                return Err(e);
            }
        };

        let mut malformed = Vec::with_capacity(outcomes.len());
        let mut streams = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            self.stats.record_frames(outcome.frames.len() as u64);
            self.stats.record_dropped_packets(outcome.malformed);
            malformed.push((outcome.device.clone(), outcome.malformed));
            streams.push(outcome.into_stream());
        }
        malformed.sort_by_key(|(device, _)| {
            self.synchronizer
                .device_order()
                .iter()
                .position(|d| d == device)
        });

        let recording = self
            .synchronizer
            .synchronize(streams, label, created_at)
            .map_err(|e| {
                self.stats.record_capture_failure();
                CaptureError::Sync(e)
            })?;
        tracing::info!(
            frames = recording.len(),
            sensors = recording.sensor_count(),
            label,
            "Recording complete"
        );

        Ok(CaptureOutcome {
            recording,
            malformed,
        })
    }

    async fn open_all<T: Transport>(
        &self,
        links: Vec<DeviceLink<T>>,
    ) -> Result<Vec<DeviceSession<T>>, CaptureError> {
        let config = self.session_config;
        let handles: Vec<_> = links
            .into_iter()
            .map(|link| {
                let device = link.spec.name.clone();
                let handle = tokio::spawn(async move {
                    DeviceSession::open(link.transport, link.spec, &config).await
                });
                (device, handle)
            })
            .collect();

        let mut opened = Vec::with_capacity(handles.len());
        let mut failure = None;
        for (device, handle) in handles {
            match handle.await {
                Ok(Ok(session)) => opened.push(session),
                Ok(Err(e)) => {
                    failure.get_or_insert(CaptureError::Device {
                        device,
                        source: e,
                    });
                }
                Err(e) => {
                    failure.get_or_insert(CaptureError::Join {
                        device,
                        reason: e.to_string(),
                    });
                }
            }
        }

        match failure {
            None => Ok(opened),
            Some(e) => {
                for session in opened {
                    let device = session.device().to_string();
                    if let Err(close_err) = session.close().await {
                        tracing::warn!(device = %device, error = %close_err, "Close failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn record_all<T: Transport>(
        &self,
        sessions: Vec<DeviceSession<T>>,
        duration: Duration,
    ) -> Result<Vec<RecordOutcome>, CaptureError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut pending: Vec<String> = sessions.iter().map(|s| s.device().to_string()).collect();

        let mut tasks = JoinSet::new();
        for mut session in sessions {
            let mut cancel = cancel_rx.clone();
            tasks.spawn(async move {
                let result = session.record(duration, &mut cancel).await;
                let name = session.device().to_string();
                if let Err(e) = session.close().await {
                    tracing::warn!(device = %name, error = %e, "Close failed");
                }
                (name, result)
            });
        }
        drop(cancel_rx);

        let mut outcomes = Vec::with_capacity(pending.len());
        let mut failure: Option<CaptureError> = None;

        while let Some(joined) = tasks.join_next().await {
            let (device, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    if failure.is_none() {
                        tracing::warn!(error = %e, "Session task failed, cancelling the rest");
                        cancel_tx.send_replace(true);
                        // Named once every other task has reported in.
                        failure = Some(CaptureError::Join {
                            device: String::new(),
                            reason: e.to_string(),
                        });
                    }
                    continue;
                }
            };
            pending.retain(|d| *d != device);
            match result {
                Ok(outcome) => outcomes.push(outcome),
                // A sibling already failed; that failure is what gets reported.
                Err(SessionError::Cancelled { .. }) if failure.is_some() => {}
                Err(e) => {
                    if failure.is_none() {
                        tracing::warn!(device = %device, error = %e, "Cancelling other sessions");
                        cancel_tx.send_replace(true);
                        failure = Some(CaptureError::Device { device, source: e });
                    }
                }
            }
        }

        if let Some(CaptureError::Join { device, .. }) = failure.as_mut() {
            *device = pending.join(", ");
        }

        match failure {
            None => Ok(outcomes),
            Some(e) => Err(e),
        }
    }
}

/// Capture failures.
#[derive(Debug)]
pub enum CaptureError {
    /// A device session failed; this is the first device that did
    Device {
        device: String,
        source: SessionError,
    },
    /// Streams could not be combined
    Sync(SyncError),
    /// A session task panicked or was aborted
    Join { device: String, reason: String },
}

impl CaptureError {
    /// The device responsible, if the failure is tied to one.
    pub fn device(&self) -> Option<&str> {
        match self {
            CaptureError::Device { device, .. } | CaptureError::Join { device, .. } => {
                Some(device)
            }
            CaptureError::Sync(SyncError::InsufficientData { device }) => Some(device),
            CaptureError::Sync(_) => None,
        }
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Device { device, source } => {
                write!(f, "Capture failed on {device}: {source}")
            }
            CaptureError::Sync(e) => write!(f, "Capture failed: {e}"),
            CaptureError::Join { device, reason } => {
                write!(f, "Session task for {device} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Device { source, .. } => Some(source),
            CaptureError::Sync(e) => Some(e),
            CaptureError::Join { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::packet::PacketSchema;
    use crate::acquisition::transport::{bluetooth_uuid, SimulatedTransport, TransportError};
    use crate::core::quaternion::{ComponentOrder, Orientation};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const TICK: Duration = Duration::from_millis(10);

    fn spec(name: &str, sensors: usize) -> DeviceSpec {
        DeviceSpec {
            name: name.to_string(),
            address: format!("sim-{name}"),
            characteristic: bluetooth_uuid(0xFF64),
            schema: PacketSchema::new(sensors, ComponentOrder::WXYZ),
        }
    }

    fn script(spec: &DeviceSpec, count: usize, marker: f64) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let q = Orientation::new(1.0, marker, i as f64 / 1000.0, 0.0);
                spec.schema
                    .encode(&vec![q; spec.schema.sensors_per_device])
                    .unwrap()
            })
            .collect()
    }

    /// Simulated link whose notification setup can be made to panic.
    struct FaultyTransport {
        inner: SimulatedTransport,
        panic_on_subscribe: bool,
    }

    impl Transport for FaultyTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.inner.connect().await
        }

        async fn subscribe(
            &mut self,
            characteristic: Uuid,
            capacity: usize,
        ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            if self.panic_on_subscribe {
                panic!("notification handler crashed");
            }
            self.inner.subscribe(characteristic, capacity).await
        }

        async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
            self.inner.unsubscribe(characteristic).await
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.inner.disconnect().await
        }
    }

    fn coordinator() -> CaptureCoordinator {
        CaptureCoordinator::new(
            SessionConfig::default(),
            Synchronizer::new(vec!["jacket".to_string(), "pants".to_string()]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_combines_devices_in_order() {
        let jacket = spec("jacket", 5);
        let pants = spec("pants", 3);
        // pants stream faster, so more frames; trailing ones are truncated
        let links = vec![
            DeviceLink::new(
                pants.clone(),
                SimulatedTransport::new(script(&pants, 200, 0.2), TICK / 2),
            ),
            DeviceLink::new(
                jacket.clone(),
                SimulatedTransport::new(script(&jacket, 200, 0.1), TICK),
            ),
        ];

        let coordinator = coordinator();
        let outcome = coordinator
            .capture(links, "squat", Duration::from_millis(502))
            .await
            .unwrap();

        let recording = outcome.recording;
        assert_eq!(recording.label(), "squat");
        assert_eq!(recording.len(), 50);
        assert_eq!(recording.sensor_count(), 8);
        let first = &recording.frames()[0];
        assert!((first.sensor(0).unwrap().x() - 0.1).abs() < 1e-2);
        assert!((first.sensor(5).unwrap().x() - 0.2).abs() < 1e-2);
        assert_eq!(
            outcome.malformed,
            vec![("jacket".to_string(), 0), ("pants".to_string(), 0)]
        );
        assert_eq!(coordinator.stats().snapshot().frames_decoded, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sibling_failure_cancels_and_reports_device() {
        let jacket = spec("jacket", 5);
        let pants = spec("pants", 3);
        let jacket_link = SimulatedTransport::new(script(&jacket, 1000, 0.1), TICK);
        let pants_link =
            SimulatedTransport::new(script(&pants, 1000, 0.2), TICK).disconnect_after(20);
        let jacket_probe = jacket_link.probe();
        let pants_probe = pants_link.probe();

        let started = tokio::time::Instant::now();
        let err = coordinator()
            .capture(
                vec![
                    DeviceLink::new(jacket, jacket_link),
                    DeviceLink::new(pants, pants_link),
                ],
                "squat",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert_eq!(err.device(), Some("pants"));
        assert!(matches!(
            err,
            CaptureError::Device {
                source: SessionError::StreamInterrupted { .. },
                ..
            }
        ));
        // The jacket stopped long before its own window would have ended
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(jacket_probe.was_disconnected());
        assert!(pants_probe.was_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_session_cancels_siblings() {
        let jacket = spec("jacket", 5);
        let pants = spec("pants", 3);
        let jacket_inner = SimulatedTransport::new(script(&jacket, 1000, 0.1), TICK);
        let jacket_state = jacket_inner.probe();
        let links = vec![
            DeviceLink::new(
                jacket,
                FaultyTransport {
                    inner: jacket_inner,
                    panic_on_subscribe: false,
                },
            ),
            DeviceLink::new(
                pants.clone(),
                FaultyTransport {
                    inner: SimulatedTransport::new(script(&pants, 1000, 0.2), TICK),
                    panic_on_subscribe: true,
                },
            ),
        ];

        let started = tokio::time::Instant::now();
        let coordinator = coordinator();
        let err = coordinator
            .capture(links, "squat", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::Join { .. }), "{err}");
        assert_eq!(err.device(), Some("pants"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(jacket_state.was_disconnected());
        assert_eq!(coordinator.stats().snapshot().capture_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_releases_opened_sessions() {
        let jacket = spec("jacket", 5);
        let pants = spec("pants", 3);
        let jacket_link = SimulatedTransport::new(script(&jacket, 10, 0.1), TICK);
        let jacket_probe = jacket_link.probe();
        let pants_link =
            SimulatedTransport::new(vec![], TICK).with_connect_delay(Duration::from_secs(30));

        let coordinator = coordinator();
        let err = coordinator
            .capture(
                vec![
                    DeviceLink::new(jacket, jacket_link),
                    DeviceLink::new(pants, pants_link),
                ],
                "squat",
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert_eq!(err.device(), Some("pants"));
        assert!(matches!(
            err,
            CaptureError::Device {
                source: SessionError::ConnectionError { .. },
                ..
            }
        ));
        assert!(jacket_probe.was_disconnected());
        assert_eq!(coordinator.stats().snapshot().capture_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_is_insufficient_data() {
        let jacket = spec("jacket", 5);
        let pants = spec("pants", 3);

        let err = coordinator()
            .capture(
                vec![
                    DeviceLink::new(
                        jacket.clone(),
                        SimulatedTransport::new(script(&jacket, 50, 0.1), TICK),
                    ),
                    DeviceLink::new(pants, SimulatedTransport::new(vec![], TICK)),
                ],
                "squat",
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CaptureError::Sync(SyncError::InsufficientData { ref device }) if device == "pants"
        ));
    }
}
