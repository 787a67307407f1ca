//! Feature extraction from normalized recordings.
//!
//! A recording is reduced to a fixed-length vector of statistics: for every
//! sensor and every quaternion component, the mean, standard deviation, min,
//! max and range over the whole series. The same statistics are computed for
//! a configured set of relative-joint pairs (e.g. upper arm against back).
//!
//! The schema (ordered feature names) depends only on the sensor count and
//! the pairs, never on the recording, so vectors from different recordings
//! line up with each other and with a previously trained classifier.

use crate::core::normalize::{normalize_self, relative_series, NormalizeError};
use crate::core::quaternion::{Component, Orientation};
use crate::core::recording::Recording;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use statrs::statistics::Statistics;

/// Per-component statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStat {
    Mean,
    Std,
    Min,
    Max,
    Range,
}

impl FeatureStat {
    pub const ALL: [FeatureStat; 5] = [
        FeatureStat::Mean,
        FeatureStat::Std,
        FeatureStat::Min,
        FeatureStat::Max,
        FeatureStat::Range,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStat::Mean => "mean",
            FeatureStat::Std => "std",
            FeatureStat::Min => "min",
            FeatureStat::Max => "max",
            FeatureStat::Range => "range",
        }
    }
}

/// Number of features per quaternion series.
pub const FEATURES_PER_SERIES: usize = Component::ALL.len() * FeatureStat::ALL.len();

/// A pair of sensors whose relative orientation is featurized.
///
/// Indices are 0-based; feature names use 1-based sensor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativePair {
    /// Moving segment
    pub a: usize,
    /// Segment it is measured against
    pub b: usize,
}

impl RelativePair {
    pub const fn new(a: usize, b: usize) -> Self {
        Self { a, b }
    }

    fn prefix(&self) -> String {
        format!("rel_s{}_s{}", self.a + 1, self.b + 1)
    }
}

/// Pairs used by the trained movement models: right upper arm vs back,
/// shoulder vs upper arm, and forearm vs hip.
pub const DEFAULT_RELATIVE_PAIRS: [RelativePair; 3] = [
    RelativePair::new(1, 4),
    RelativePair::new(0, 1),
    RelativePair::new(2, 7),
];

/// Ordered feature names for one sensor topology.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    sensor_count: usize,
    pairs: Vec<RelativePair>,
    names: Vec<String>,
}

impl FeatureSchema {
    /// Build the schema. Every pair must refer to two distinct existing sensors.
    pub fn new(sensor_count: usize, pairs: Vec<RelativePair>) -> Result<Self, FeatureError> {
        if sensor_count == 0 {
            return Err(FeatureError::SchemaMismatch {
                expected: 1,
                actual: 0,
            });
        }
        for pair in &pairs {
            if pair.a >= sensor_count || pair.b >= sensor_count || pair.a == pair.b {
                return Err(FeatureError::InvalidPair {
                    pair: *pair,
                    sensors: sensor_count,
                });
            }
        }

        let mut names = Vec::with_capacity((sensor_count + pairs.len()) * FEATURES_PER_SERIES);
        for sensor in 0..sensor_count {
            push_series_names(&mut names, &format!("s{}", sensor + 1));
        }
        for pair in &pairs {
            push_series_names(&mut names, &pair.prefix());
        }

        Ok(Self {
            sensor_count,
            pairs,
            names,
        })
    }

    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    pub fn pairs(&self) -> &[RelativePair] {
        &self.pairs
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn push_series_names(names: &mut Vec<String>, prefix: &str) {
    for component in Component::ALL {
        for stat in FeatureStat::ALL {
            names.push(format!("{prefix}_{}_{}", component.as_str(), stat.as_str()));
        }
    }
}

/// Ordered feature name to value mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    names: Vec<String>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Dense values in schema order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

/// Reduces recordings to feature vectors for a fixed schema.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Extract features from an already normalized recording.
    pub fn extract(&self, recording: &Recording) -> Result<FeatureVector, FeatureError> {
        if recording.is_empty() {
            return Err(FeatureError::EmptyRecording);
        }
        if recording.sensor_count() != self.schema.sensor_count {
            return Err(FeatureError::SchemaMismatch {
                expected: self.schema.sensor_count,
                actual: recording.sensor_count(),
            });
        }

        let mut values = Vec::with_capacity(self.schema.len());
        for sensor in 0..self.schema.sensor_count {
            push_series_stats(&mut values, &recording.sensor_series(sensor));
        }
        for pair in &self.schema.pairs {
            let series =
                relative_series(recording, pair.a, pair.b).map_err(FeatureError::Normalize)?;
            push_series_stats(&mut values, &series);
        }

        Ok(FeatureVector {
            names: self.schema.names.clone(),
            values,
        })
    }

    /// Self-normalize a raw recording, then extract.
    pub fn normalize_and_extract(
        &self,
        recording: &Recording,
    ) -> Result<FeatureVector, FeatureError> {
        if recording.is_empty() {
            return Err(FeatureError::EmptyRecording);
        }
        let normalized = normalize_self(recording).map_err(FeatureError::Normalize)?;
        self.extract(&normalized)
    }
}

fn push_series_stats(values: &mut Vec<f64>, series: &[Orientation]) {
    for component in Component::ALL {
        let samples: Vec<f64> = series.iter().map(|q| q.component(component)).collect();
        let min = Statistics::min(samples.iter());
        let max = Statistics::max(samples.iter());
        for stat in FeatureStat::ALL {
            values.push(match stat {
                FeatureStat::Mean => samples.iter().mean(),
                FeatureStat::Std => samples.iter().population_std_dev(),
                FeatureStat::Min => min,
                FeatureStat::Max => max,
                FeatureStat::Range => max - min,
            });
        }
    }
}

/// Feature extraction failures. No partial vector is ever produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureError {
    EmptyRecording,
    SchemaMismatch { expected: usize, actual: usize },
    InvalidPair { pair: RelativePair, sensors: usize },
    Normalize(NormalizeError),
}

impl std::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureError::EmptyRecording => write!(f, "Recording has no frames"),
            FeatureError::SchemaMismatch { expected, actual } => write!(
                f,
                "Schema mismatch: expected {expected} sensors, recording has {actual}"
            ),
            FeatureError::InvalidPair { pair, sensors } => write!(
                f,
                "Relative pair ({}, {}) is invalid for {sensors} sensors",
                pair.a, pair.b
            ),
            FeatureError::Normalize(e) => write!(f, "Normalization failed: {e}"),
        }
    }
}

impl std::error::Error for FeatureError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recording::CombinedFrame;
    use chrono::Utc;

    fn recording(len: usize, sensors: usize) -> Recording {
        let frames = (0..len)
            .map(|i| {
                let t = i as f64 * 0.1;
                CombinedFrame::from_orientations(
                    (0..sensors)
                        .map(|s| Orientation::new(t.cos(), t.sin() * (s as f64 + 1.0), 0.0, 0.0))
                        .collect(),
                )
            })
            .collect();
        Recording::from_frames("test", Utc::now(), frames).unwrap()
    }

    fn two_sensor_extractor() -> FeatureExtractor {
        FeatureExtractor::new(FeatureSchema::new(2, vec![RelativePair::new(0, 1)]).unwrap())
    }

    #[test]
    fn test_schema_length_and_names() {
        let schema = FeatureSchema::new(10, DEFAULT_RELATIVE_PAIRS.to_vec()).unwrap();
        assert_eq!(schema.len(), 10 * 20 + 3 * 20);
        assert_eq!(schema.names()[0], "s1_w_mean");
        assert_eq!(schema.names()[4], "s1_w_range");
        assert_eq!(schema.names()[5], "s1_x_mean");
        assert_eq!(schema.names()[199], "s10_z_range");
        assert_eq!(schema.names()[200], "rel_s2_s5_w_mean");
        assert_eq!(schema.names()[220], "rel_s1_s2_w_mean");
        assert_eq!(schema.names()[240], "rel_s3_s8_w_mean");
    }

    #[test]
    fn test_schema_rejects_bad_pairs() {
        assert!(matches!(
            FeatureSchema::new(4, vec![RelativePair::new(2, 7)]),
            Err(FeatureError::InvalidPair { .. })
        ));
        assert!(FeatureSchema::new(4, vec![RelativePair::new(1, 1)]).is_err());
    }

    #[test]
    fn test_schema_is_stable_across_lengths() {
        let extractor = two_sensor_extractor();
        let short = extractor.extract(&recording(3, 2)).unwrap();
        let long = extractor.extract(&recording(50, 2)).unwrap();
        assert_eq!(short.names(), long.names());
        assert_eq!(short.len(), extractor.schema().len());
    }

    #[test]
    fn test_statistics_values() {
        // w series of sensor 2 is constant 1.0, x varies
        let frames = [0.0, 0.6, 0.8]
            .iter()
            .map(|&x: &f64| {
                CombinedFrame::from_orientations(vec![
                    Orientation::new((1.0 - x * x).sqrt(), x, 0.0, 0.0),
                    Orientation::identity(),
                ])
            })
            .collect();
        let rec = Recording::from_frames("t", Utc::now(), frames).unwrap();
        let features = two_sensor_extractor().extract(&rec).unwrap();

        let mean = (0.0 + 0.6 + 0.8) / 3.0;
        assert!((features.get("s1_x_mean").unwrap() - mean).abs() < 1e-12);
        assert_eq!(features.get("s1_x_min"), Some(0.0));
        assert_eq!(features.get("s1_x_max"), Some(0.8));
        assert!((features.get("s1_x_range").unwrap() - 0.8).abs() < 1e-12);

        let var = [0.0, 0.6, 0.8]
            .iter()
            .map(|v: &f64| (v - mean).powi(2))
            .sum::<f64>()
            / 3.0;
        assert!((features.get("s1_x_std").unwrap() - var.sqrt()).abs() < 1e-12);

        assert_eq!(features.get("s2_w_std"), Some(0.0));
        // sensor 2 is identity, so the relative series equals sensor 1
        assert!((features.get("rel_s1_s2_x_max").unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_empty_recording_rejected() {
        let empty = Recording::new("empty", Utc::now());
        assert_eq!(
            two_sensor_extractor().extract(&empty).unwrap_err(),
            FeatureError::EmptyRecording
        );
    }

    #[test]
    fn test_sensor_count_mismatch() {
        let err = two_sensor_extractor().extract(&recording(5, 3)).unwrap_err();
        assert_eq!(
            err,
            FeatureError::SchemaMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_serializes_in_schema_order() {
        let features = two_sensor_extractor().extract(&recording(4, 2)).unwrap();
        let json = serde_json::to_string(&features).unwrap();
        let first = json.find("\"s1_w_mean\"").unwrap();
        let later = json.find("\"rel_s1_s2_z_range\"").unwrap();
        assert!(first < later);
    }

    #[test]
    fn test_normalize_and_extract_is_deterministic() {
        let extractor = two_sensor_extractor();
        let input = recording(20, 2);
        let a = extractor.normalize_and_extract(&input).unwrap();
        let b = extractor.normalize_and_extract(&input).unwrap();
        assert_eq!(a, b);
        // first frame identity after normalization means w never exceeds 1
        assert!(a.get("s1_w_max").unwrap() <= 1.0 + 1e-12);
    }
}
