//! Multi-stream synchronization.
//!
//! Device sessions finish at different wall-clock times and in arbitrary
//! order. The synchronizer puts their frame sequences back into configured
//! device order and aligns them by index.
//!
//! Alignment is index-based truncation: the recording is as long as the
//! shortest stream and trailing frames of longer streams are dropped. No
//! timestamp reconciliation is attempted; over capture windows of a few
//! seconds the notification cadence of the garments is close enough for
//! index position to stand in for time.

use crate::core::recording::{CombinedFrame, Frame, Recording, RecordingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The ordered frames produced by one device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStream {
    pub device: String,
    pub frames: Vec<Frame>,
}

impl DeviceStream {
    pub fn new(device: impl Into<String>, frames: Vec<Frame>) -> Self {
        Self {
            device: device.into(),
            frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Combines per-device frame sequences into one [`Recording`].
#[derive(Debug, Clone)]
pub struct Synchronizer {
    device_order: Vec<String>,
}

impl Synchronizer {
    /// Create a synchronizer that concatenates devices in `device_order`.
    pub fn new(device_order: Vec<String>) -> Self {
        Self { device_order }
    }

    pub fn device_order(&self) -> &[String] {
        &self.device_order
    }

    /// Fuse the streams into a recording.
    ///
    /// Streams may be passed in any order. Every configured device must be
    /// present and non-empty.
    pub fn synchronize(
        &self,
        mut streams: Vec<DeviceStream>,
        label: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Recording, SyncError> {
        if self.device_order.is_empty() {
            return Err(SyncError::NoStreams);
        }
        if let Some(unknown) = streams
            .iter()
            .find(|s| !self.device_order.contains(&s.device))
        {
            return Err(SyncError::UnknownDevice(unknown.device.clone()));
        }

        let mut ordered = Vec::with_capacity(self.device_order.len());
        for device in &self.device_order {
            let position = streams.iter().position(|s| &s.device == device);
            match position {
                Some(i) => ordered.push(streams.swap_remove(i)),
                None => {
                    return Err(SyncError::InsufficientData {
                        device: device.clone(),
                    })
                }
            }
        }

        if let Some(empty) = ordered.iter().find(|s| s.is_empty()) {
            return Err(SyncError::InsufficientData {
                device: empty.device.clone(),
            });
        }

        let length = ordered.iter().map(DeviceStream::len).min().unwrap_or(0);
        for stream in ordered.iter().filter(|s| s.len() > length) {
            tracing::debug!(
                device = %stream.device,
                dropped = stream.len() - length,
                "Truncating trailing frames"
            );
        }

        let mut recording = Recording::new(label, created_at);
        for i in 0..length {
            let frame = CombinedFrame::from_frames(ordered.iter().map(|s| &s.frames[i]));
            recording.push(frame).map_err(SyncError::Recording)?;
        }
        Ok(recording)
    }
}

/// Synchronization failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// No devices are configured
    NoStreams,
    /// A configured device produced no frames
    InsufficientData { device: String },
    /// A stream came from a device that is not configured
    UnknownDevice(String),
    Recording(RecordingError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NoStreams => write!(f, "No device streams configured"),
            SyncError::InsufficientData { device } => {
                write!(f, "Insufficient data: device '{device}' produced no frames")
            }
            SyncError::UnknownDevice(device) => write!(f, "Unknown device '{device}'"),
            SyncError::Recording(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}
