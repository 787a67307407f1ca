//! Orientation normalization.
//!
//! Sensors report absolute orientations that depend on how the garment was
//! put on and which way the wearer was facing. Normalization re-expresses
//! each orientation relative to a reference so features compare across
//! recordings:
//!
//! - **self**: each sensor relative to its own first sample
//! - **sensor**: every sensor relative to one reference sensor's first sample
//! - **calibration**: each sensor relative to an N-pose calibration frame
//! - **relative-joint**: sensor `a` relative to sensor `b` at every frame,
//!   independent of global pose altogether
//!
//! All functions are pure. The same input always yields bit-identical output.

use crate::core::quaternion::{relative, Orientation};
use crate::core::recording::{CombinedFrame, Recording, RecordingError};

/// Normalize each sensor against its own first-frame orientation.
pub fn normalize_self(recording: &Recording) -> Result<Recording, NormalizeError> {
    let reference = recording
        .reference_frame()
        .ok_or(NormalizeError::EmptyRecording)?;
    let inverses: Vec<Orientation> = reference.orientations().map(Orientation::inverse).collect();
    apply(recording, |sensor, q| per_sensor(&inverses, sensor, q))
}

/// Normalize every sensor against the first-frame orientation of one sensor.
pub fn normalize_to_sensor(
    recording: &Recording,
    reference_sensor_index: usize,
) -> Result<Recording, NormalizeError> {
    let reference = recording
        .reference_frame()
        .ok_or(NormalizeError::EmptyRecording)?;
    let q_ref = reference
        .sensor(reference_sensor_index)
        .ok_or(NormalizeError::SensorOutOfRange {
            index: reference_sensor_index,
            sensors: reference.sensor_count(),
        })?;
    let inverse = q_ref.inverse();
    apply(recording, |_, q| Ok(inverse * *q))
}

/// Normalize each sensor against a calibration frame, typically the first
/// frame of an N-pose recording.
pub fn normalize_to_reference(
    recording: &Recording,
    reference: &CombinedFrame,
) -> Result<Recording, NormalizeError> {
    if recording.is_empty() {
        return Err(NormalizeError::EmptyRecording);
    }
    if reference.sensor_count() != recording.sensor_count() {
        return Err(NormalizeError::SensorCountMismatch {
            reference: reference.sensor_count(),
            recording: recording.sensor_count(),
        });
    }
    let inverses: Vec<Orientation> = reference.orientations().map(Orientation::inverse).collect();
    apply(recording, |sensor, q| per_sensor(&inverses, sensor, q))
}

/// Relative-joint orientation series of sensor `a` with respect to sensor `b`.
pub fn relative_series(
    recording: &Recording,
    a: usize,
    b: usize,
) -> Result<Vec<Orientation>, NormalizeError> {
    let sensors = recording.sensor_count();
    for index in [a, b] {
        if index >= sensors {
            return Err(NormalizeError::SensorOutOfRange { index, sensors });
        }
    }
    Ok(recording
        .frames()
        .iter()
        .filter_map(|f| Some(relative(f.sensor(a)?, f.sensor(b)?)))
        .collect())
}

fn per_sensor(
    inverses: &[Orientation],
    sensor: usize,
    q: &Orientation,
) -> Result<Orientation, NormalizeError> {
    inverses
        .get(sensor)
        .map(|inverse| *inverse * *q)
        .ok_or(NormalizeError::SensorOutOfRange {
            index: sensor,
            sensors: inverses.len(),
        })
}

fn apply(
    recording: &Recording,
    mut f: impl FnMut(usize, &Orientation) -> Result<Orientation, NormalizeError>,
) -> Result<Recording, NormalizeError> {
    let frames = recording
        .frames()
        .iter()
        .map(|frame| frame.map_orientations(&mut f))
        .collect::<Result<Vec<_>, _>>()?;
    Recording::from_frames(recording.label(), recording.created_at(), frames)
        .map_err(NormalizeError::Recording)
}

/// Normalization failures.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeError {
    EmptyRecording,
    SensorOutOfRange {
        index: usize,
        sensors: usize,
    },
    SensorCountMismatch {
        reference: usize,
        recording: usize,
    },
    Recording(RecordingError),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::EmptyRecording => write!(f, "Cannot normalize an empty recording"),
            NormalizeError::SensorOutOfRange { index, sensors } => {
                write!(f, "Sensor index {index} out of range ({sensors} sensors)")
            }
            NormalizeError::SensorCountMismatch {
                reference,
                recording,
            } => write!(
                f,
                "Reference has {reference} sensors, recording has {recording}"
            ),
            NormalizeError::Recording(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NormalizeError {}
