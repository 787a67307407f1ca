//! Frames, combined frames and recordings.
//!
//! A [`Frame`] is one decoded notification from one garment. Frames from all
//! garments at the same synchronized index form a [`CombinedFrame`], and an
//! ordered run of combined frames with a label is a [`Recording`].
//!
//! Recordings are append-only while they are being assembled. Normalization
//! and feature extraction never mutate them.

use crate::core::quaternion::{ComponentOrder, Orientation};
use crate::core::sync::{DeviceStream, SyncError, Synchronizer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Label given to N-pose calibration recordings.
pub const NPOSE_LABEL: &str = "npose";

/// One sensor's orientation within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sensor position in the frame (0-based)
    pub sensor_index: usize,
    /// Position of the source notification in its device stream
    pub sequence_number: u64,
    pub orientation: Orientation,
}

/// All sensors of one device captured by a single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    sequence_number: u64,
    readings: Vec<SensorReading>,
}

impl Frame {
    pub fn new(sequence_number: u64, orientations: Vec<Orientation>) -> Self {
        let readings = orientations
            .into_iter()
            .enumerate()
            .map(|(sensor_index, orientation)| SensorReading {
                sensor_index,
                sequence_number,
                orientation,
            })
            .collect();
        Self {
            sequence_number,
            readings,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn sensor_count(&self) -> usize {
        self.readings.len()
    }
}

/// Frames from every active device at one synchronized position.
///
/// Sensor indices are re-based so the combined frame addresses sensors
/// `0..sensor_count()` in configured device order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CombinedFrameRepr")]
pub struct CombinedFrame {
    readings: Vec<SensorReading>,
}

impl CombinedFrame {
    /// Concatenate device frames in the order given.
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Self {
        let mut readings = Vec::new();
        for frame in frames {
            for reading in frame.readings() {
                readings.push(SensorReading {
                    sensor_index: readings.len(),
                    ..*reading
                });
            }
        }
        Self { readings }
    }

    /// Build a combined frame directly from orientations (sequence number 0).
    pub fn from_orientations(orientations: Vec<Orientation>) -> Self {
        Self::from_frames([&Frame::new(0, orientations)])
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn sensor_count(&self) -> usize {
        self.readings.len()
    }

    pub fn sensor(&self, index: usize) -> Option<&Orientation> {
        self.readings.get(index).map(|r| &r.orientation)
    }

    pub fn orientations(&self) -> impl Iterator<Item = &Orientation> {
        self.readings.iter().map(|r| &r.orientation)
    }

    /// Replace every orientation, keeping indices and sequence numbers.
    /// Stops at the first error.
    pub fn map_orientations<E>(
        &self,
        mut f: impl FnMut(usize, &Orientation) -> Result<Orientation, E>,
    ) -> Result<Self, E> {
        let readings = self
            .readings
            .iter()
            .map(|r| {
                Ok(SensorReading {
                    orientation: f(r.sensor_index, &r.orientation)?,
                    ..*r
                })
            })
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { readings })
    }

    /// Flat `sensors * 4` layout used by stored recordings and the inference API.
    pub fn to_flat(&self, order: ComponentOrder) -> Vec<f64> {
        self.orientations().flat_map(|o| order.arrange(o)).collect()
    }

    /// Parse one flat frame holding exactly `sensors` quaternions.
    pub fn from_flat(
        values: &[f64],
        sensors: usize,
        order: ComponentOrder,
    ) -> Result<Self, RecordingError> {
        if sensors == 0 || values.len() != sensors * 4 {
            return Err(RecordingError::FrameLength {
                expected: sensors * 4,
                actual: values.len(),
            });
        }
        let orientations = values
            .chunks_exact(4)
            .map(|c| order.assemble([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::from_orientations(orientations))
    }
}

/// Deserialized frames are re-based so sensor indices match positions.
#[derive(Deserialize)]
struct CombinedFrameRepr {
    readings: Vec<SensorReading>,
}

impl From<CombinedFrameRepr> for CombinedFrame {
    fn from(repr: CombinedFrameRepr) -> Self {
        let readings = repr
            .readings
            .into_iter()
            .enumerate()
            .map(|(sensor_index, reading)| SensorReading {
                sensor_index,
                ..reading
            })
            .collect();
        Self { readings }
    }
}

/// An ordered sequence of combined frames with a label.
///
/// Deserialization goes through [`Recording::from_frames`], so a decoded
/// recording holds the same sensor count in every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordingRepr")]
pub struct Recording {
    label: String,
    created_at: DateTime<Utc>,
    frames: Vec<CombinedFrame>,
}

impl Recording {
    /// Start an empty recording.
    pub fn new(label: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            label: label.into(),
            created_at,
            frames: Vec::new(),
        }
    }

    /// Assemble a recording from frames, checking they share one sensor count.
    pub fn from_frames(
        label: impl Into<String>,
        created_at: DateTime<Utc>,
        frames: Vec<CombinedFrame>,
    ) -> Result<Self, RecordingError> {
        let mut recording = Self::new(label, created_at);
        for frame in frames {
            recording.push(frame)?;
        }
        Ok(recording)
    }

    /// Append a frame. All frames must have the same sensor count.
    pub fn push(&mut self, frame: CombinedFrame) -> Result<(), RecordingError> {
        if let Some(first) = self.frames.first() {
            if first.sensor_count() != frame.sensor_count() {
                return Err(RecordingError::InconsistentSensorCount {
                    frame: self.frames.len(),
                    expected: first.sensor_count(),
                    actual: frame.sensor_count(),
                });
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn frames(&self) -> &[CombinedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sensor count of the recording (0 when empty).
    pub fn sensor_count(&self) -> usize {
        self.frames.first().map_or(0, CombinedFrame::sensor_count)
    }

    /// The first frame, used as the normalization anchor.
    pub fn reference_frame(&self) -> Option<&CombinedFrame> {
        self.frames.first()
    }

    /// Time series of one sensor.
    pub fn sensor_series(&self, sensor: usize) -> Vec<Orientation> {
        self.frames
            .iter()
            .filter_map(|f| f.sensor(sensor).copied())
            .collect()
    }

    pub fn is_calibration(&self) -> bool {
        self.label == NPOSE_LABEL
    }

    /// Convert to the flat stored layout.
    pub fn to_stored(&self, order: ComponentOrder) -> StoredRecording {
        StoredRecording {
            data: StoredData::Flat(self.frames.iter().map(|f| f.to_flat(order)).collect()),
            label: self.label.clone(),
            created_at: Some(self.created_at),
        }
    }

    /// Save as JSON in the flat stored layout.
    pub fn save(&self, path: &Path, order: ComponentOrder) -> Result<(), RecordingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RecordingError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.to_stored(order))
            .map_err(|e| RecordingError::Parse(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| RecordingError::Io(e.to_string()))
    }
}

#[derive(Deserialize)]
struct RecordingRepr {
    label: String,
    created_at: DateTime<Utc>,
    frames: Vec<CombinedFrame>,
}

impl TryFrom<RecordingRepr> for Recording {
    type Error = RecordingError;

    fn try_from(repr: RecordingRepr) -> Result<Self, Self::Error> {
        Recording::from_frames(repr.label, repr.created_at, repr.frames)
    }
}

/// Frame payload of a stored recording.
///
/// Single-garment recorders write a flat list of frames. Dual-garment
/// recorders may nest per-device frame lists under the device name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredData {
    Flat(Vec<Vec<f64>>),
    Keyed(BTreeMap<String, Vec<Vec<f64>>>),
}

/// On-disk recording format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecording {
    pub data: StoredData,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl StoredRecording {
    pub fn load(path: &Path) -> Result<Self, RecordingError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| RecordingError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| RecordingError::Parse(e.to_string()))
    }

    /// Convert either stored layout into a [`Recording`].
    ///
    /// Keyed layouts go through the same index truncation as live captures
    /// and are concatenated in the layout's device order.
    pub fn to_recording(&self, layout: &RecordingLayout) -> Result<Recording, RecordingError> {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        match &self.data {
            StoredData::Flat(frames) => {
                let sensors = layout.total_sensors();
                let frames = frames
                    .iter()
                    .map(|values| CombinedFrame::from_flat(values, sensors, layout.order))
                    .collect::<Result<Vec<_>, _>>()?;
                Recording::from_frames(self.label.clone(), created_at, frames)
            }
            StoredData::Keyed(by_device) => {
                let mut streams = Vec::with_capacity(layout.devices.len());
                for (name, sensors) in &layout.devices {
                    let device_frames = by_device
                        .get(name)
                        .ok_or_else(|| RecordingError::MissingDevice(name.clone()))?;
                    let frames = device_frames
                        .iter()
                        .enumerate()
                        .map(|(i, values)| {
                            CombinedFrame::from_flat(values, *sensors, layout.order).map(|c| {
                                Frame::new(i as u64, c.orientations().copied().collect())
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    streams.push(DeviceStream::new(name.clone(), frames));
                }
                let order: Vec<String> = layout.devices.iter().map(|(n, _)| n.clone()).collect();
                Synchronizer::new(order)
                    .synchronize(streams, self.label.clone(), created_at)
                    .map_err(|e| match e {
                        SyncError::Recording(inner) => inner,
                        SyncError::InsufficientData { device } => {
                            RecordingError::EmptyDevice(device)
                        }
                        SyncError::UnknownDevice(device) => RecordingError::MissingDevice(device),
                        SyncError::NoStreams => RecordingError::MissingDevice(String::new()),
                    })
            }
        }
    }
}

/// Device topology and component order used to read stored recordings.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingLayout {
    /// Device names with their sensor counts, in combined-frame order
    pub devices: Vec<(String, usize)>,
    /// Slot order of each stored quaternion
    pub order: ComponentOrder,
}

impl RecordingLayout {
    pub fn total_sensors(&self) -> usize {
        self.devices.iter().map(|(_, n)| n).sum()
    }
}

/// Errors raised while assembling or loading recordings.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingError {
    /// A frame has a different sensor count from the first frame
    InconsistentSensorCount {
        frame: usize,
        expected: usize,
        actual: usize,
    },
    /// A flat frame has the wrong number of values
    FrameLength { expected: usize, actual: usize },
    /// A keyed recording is missing a configured device
    MissingDevice(String),
    /// A keyed recording has no frames for a device
    EmptyDevice(String),
    Io(String),
    Parse(String),
}

impl std::fmt::Display for RecordingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingError::InconsistentSensorCount {
                frame,
                expected,
                actual,
            } => write!(
                f,
                "Frame {frame} has {actual} sensors, recording has {expected}"
            ),
            RecordingError::FrameLength { expected, actual } => {
                write!(f, "Frame has {actual} values, expected {expected}")
            }
            RecordingError::MissingDevice(name) => {
                write!(f, "Recording has no data for device '{name}'")
            }
            RecordingError::EmptyDevice(name) => {
                write!(f, "Recording has no frames for device '{name}'")
            }
            RecordingError::Io(e) => write!(f, "IO error: {e}"),
            RecordingError::Parse(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for RecordingError {}
