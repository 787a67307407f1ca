//! Core processing for captured movements.
//!
//! This module contains:
//! - Quaternion orientation values and component ordering
//! - Frames, combined frames, recordings and their stored layouts
//! - Multi-stream synchronization into recordings
//! - Orientation normalization
//! - Feature extraction for classifiers

pub mod features;
pub mod normalize;
pub mod quaternion;
pub mod recording;
pub mod sync;

// Re-export commonly used types
pub use features::{
    FeatureError, FeatureExtractor, FeatureSchema, FeatureVector, RelativePair,
    DEFAULT_RELATIVE_PAIRS,
};
pub use normalize::{
    normalize_self, normalize_to_reference, normalize_to_sensor, relative_series, NormalizeError,
};
pub use quaternion::{relative, Component, ComponentOrder, Orientation};
pub use recording::{
    CombinedFrame, Frame, Recording, RecordingError, RecordingLayout, SensorReading,
    StoredRecording, NPOSE_LABEL,
};
pub use sync::{DeviceStream, SyncError, Synchronizer};
