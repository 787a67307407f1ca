//! Movement classification behind the `/predict` contract.
//!
//! A [`Model`] bundles a feature schema, a standard scaler and a
//! [`Classifier`]. Models are read once from a directory of JSON assets into
//! an immutable [`ModelRegistry`] keyed by movement type and model name:
//!
//! ```text
//! model_<movement_type>_<model_name>.json
//! ```
//!
//! The movement type may itself contain underscores; the last segment is the
//! model name.

use crate::core::features::{FeatureError, FeatureExtractor, FeatureSchema, RelativePair};
use crate::core::quaternion::ComponentOrder;
use crate::core::recording::{CombinedFrame, Recording, RecordingError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const MODEL_PREFIX: &str = "model_";
const MODEL_EXTENSION: &str = ".json";

/// Request body of `POST /predict`.
///
/// Fields are optional so a missing one can be reported as such instead of
/// failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Flat frames, `sensors * 4` values each in stored slot order
    pub movement_data: Option<Vec<Vec<f64>>>,
    pub movement_type: Option<String>,
    pub model_name: Option<String>,
}

/// Response body of `POST /predict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Success { prediction: String, status: String },
    Failure { error: String, status: String },
}

impl PredictResponse {
    pub fn success(prediction: impl Into<String>) -> Self {
        PredictResponse::Success {
            prediction: prediction.into(),
            status: "success".to_string(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        PredictResponse::Failure {
            error: error.into(),
            status: "failure".to_string(),
        }
    }
}

/// Maps a scaled feature vector to a movement label.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    fn predict(&self, features: &[f64]) -> Result<String, InferenceError>;

    /// Labels this classifier can emit.
    fn labels(&self) -> Vec<String>;
}

/// Per-feature standardization, `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self, InferenceError> {
        if mean.len() != scale.len() {
            return Err(InferenceError::InvalidAsset(format!(
                "scaler has {} means but {} scales",
                mean.len(),
                scale.len()
            )));
        }
        Ok(Self { mean, scale })
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn transform(&self, values: &[f64]) -> Result<Vec<f64>, InferenceError> {
        if values.len() != self.len() {
            return Err(InferenceError::DimensionMismatch {
                expected: self.len(),
                actual: values.len(),
            });
        }
        Ok(values
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| if *s == 0.0 { x - m } else { (x - m) / s })
            .collect())
    }
}

/// One class prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub label: String,
    pub values: Vec<f64>,
}

/// Assigns the label of the closest centroid in Euclidean distance.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestCentroid {
    centroids: Vec<Centroid>,
}

impl NearestCentroid {
    pub fn new(centroids: Vec<Centroid>) -> Result<Self, InferenceError> {
        let width = centroids
            .first()
            .map(|c| c.values.len())
            .ok_or_else(|| InferenceError::InvalidAsset("classifier has no centroids".into()))?;
        if centroids.iter().any(|c| c.values.len() != width) {
            return Err(InferenceError::InvalidAsset(
                "centroids differ in dimension".into(),
            ));
        }
        Ok(Self { centroids })
    }

    pub fn centroids(&self) -> &[Centroid] {
        &self.centroids
    }
}

impl Classifier for NearestCentroid {
    fn predict(&self, features: &[f64]) -> Result<String, InferenceError> {
        let mut best: Option<(&Centroid, f64)> = None;
        for centroid in &self.centroids {
            if centroid.values.len() != features.len() {
                return Err(InferenceError::DimensionMismatch {
                    expected: centroid.values.len(),
                    actual: features.len(),
                });
            }
            let distance: f64 = centroid
                .values
                .iter()
                .zip(features)
                .map(|(c, f)| (c - f).powi(2))
                .sum();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((centroid, distance));
            }
        }
        best.map(|(c, _)| c.label.clone())
            .ok_or_else(|| InferenceError::Prediction("classifier has no centroids".into()))
    }

    fn labels(&self) -> Vec<String> {
        self.centroids.iter().map(|c| c.label.clone()).collect()
    }
}

/// Serialized classifier parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassifierAsset {
    NearestCentroid { centroids: Vec<Centroid> },
}

/// On-disk model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAssets {
    pub sensor_count: usize,
    pub relative_pairs: Vec<RelativePair>,
    /// Must equal the names of the schema built from the two fields above
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub classifier: ClassifierAsset,
}

impl ModelAssets {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InferenceError::InvalidAsset(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| InferenceError::InvalidAsset(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), InferenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| InferenceError::InvalidAsset(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| InferenceError::InvalidAsset(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| InferenceError::InvalidAsset(e.to_string()))
    }
}

/// A ready-to-use classification pipeline.
#[derive(Debug, Clone)]
pub struct Model {
    extractor: FeatureExtractor,
    scaler: StandardScaler,
    classifier: Arc<dyn Classifier>,
}

impl Model {
    pub fn new(
        schema: FeatureSchema,
        scaler: StandardScaler,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, InferenceError> {
        if scaler.len() != schema.len() {
            return Err(InferenceError::InvalidAsset(format!(
                "scaler covers {} features, schema has {}",
                scaler.len(),
                schema.len()
            )));
        }
        Ok(Self {
            extractor: FeatureExtractor::new(schema),
            scaler,
            classifier,
        })
    }

    pub fn from_assets(assets: ModelAssets) -> Result<Self, InferenceError> {
        let schema = FeatureSchema::new(assets.sensor_count, assets.relative_pairs)
            .map_err(|e| InferenceError::InvalidAsset(e.to_string()))?;
        if schema.names() != assets.feature_names.as_slice() {
            return Err(InferenceError::InvalidAsset(
                "feature names do not match the schema".into(),
            ));
        }
        let classifier: Arc<dyn Classifier> = match assets.classifier {
            ClassifierAsset::NearestCentroid { centroids } => {
                Arc::new(NearestCentroid::new(centroids)?)
            }
        };
        Self::new(schema, assets.scaler, classifier)
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.extractor.schema()
    }

    pub fn classifier(&self) -> &Arc<dyn Classifier> {
        &self.classifier
    }

    /// Classify a raw recording.
    pub fn predict(&self, recording: &Recording) -> Result<String, InferenceError> {
        let features = self
            .extractor
            .normalize_and_extract(recording)
            .map_err(InferenceError::Features)?;
        let scaled = self.scaler.transform(features.values())?;
        self.classifier.predict(&scaled)
    }

    /// Classify flat frames as sent to `/predict`.
    ///
    /// Frames of the wrong width are skipped.
    pub fn predict_flat(
        &self,
        frames: &[Vec<f64>],
        order: ComponentOrder,
    ) -> Result<String, InferenceError> {
        let recording = self.recording_from_flat(frames, order)?;
        self.predict(&recording)
    }

    fn recording_from_flat(
        &self,
        frames: &[Vec<f64>],
        order: ComponentOrder,
    ) -> Result<Recording, InferenceError> {
        let sensors = self.schema().sensor_count();
        let combined: Vec<CombinedFrame> = frames
            .iter()
            .filter(|f| f.len() == sensors * 4)
            .map(|f| CombinedFrame::from_flat(f, sensors, order))
            .collect::<Result<_, _>>()
            .map_err(InferenceError::Recording)?;

        let skipped = frames.len() - combined.len();
        if skipped > 0 {
            tracing::debug!(skipped, expected = sensors * 4, "Skipped frames of the wrong width");
        }
        if combined.is_empty() {
            return Err(InferenceError::NoValidFrames);
        }
        Recording::from_frames("live", Utc::now(), combined).map_err(InferenceError::Recording)
    }
}

/// Immutable lookup of models by movement type and model name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, HashMap<String, Arc<Model>>>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Load every `model_*.json` file in `dir`.
    ///
    /// Files that fail to load are logged and skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, InferenceError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            InferenceError::InvalidAsset(format!("models folder {}: {e}", dir.display()))
        })?;

        let mut builder = Self::builder();
        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name();
            let Some((movement_type, model_name)) = file_name.to_str().and_then(parse_model_file)
            else {
                continue;
            };

            match ModelAssets::load(&entry.path()).and_then(Model::from_assets) {
                Ok(model) => {
                    tracing::info!(movement_type, model_name, "Loaded model");
                    builder = builder.insert(movement_type, model_name, model);
                }
                Err(e) => {
                    tracing::error!(movement_type, model_name, error = %e, "Failed to load model");
                }
            }
        }

        let registry = builder.build();
        tracing::info!(models = registry.len(), "Model loading complete");
        Ok(registry)
    }

    pub fn get(&self, movement_type: &str, model_name: &str) -> Option<&Arc<Model>> {
        self.models.get(movement_type)?.get(model_name)
    }

    /// `(movement_type, model_name)` pairs, sorted.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .models
            .iter()
            .flat_map(|(movement, models)| {
                models.keys().map(move |name| (movement.clone(), name.clone()))
            })
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.models.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects models before the registry is frozen.
#[derive(Debug, Default)]
pub struct ModelRegistryBuilder {
    models: HashMap<String, HashMap<String, Arc<Model>>>,
}

impl ModelRegistryBuilder {
    pub fn insert(mut self, movement_type: &str, model_name: &str, model: Model) -> Self {
        self.models
            .entry(movement_type.to_string())
            .or_default()
            .insert(model_name.to_string(), Arc::new(model));
        self
    }

    pub fn build(self) -> ModelRegistry {
        ModelRegistry {
            models: self.models,
        }
    }
}

/// Split `model_<movement_type>_<model_name>.json`.
pub fn parse_model_file(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name
        .strip_prefix(MODEL_PREFIX)?
        .strip_suffix(MODEL_EXTENSION)?;
    let (movement_type, model_name) = stem.rsplit_once('_')?;
    if movement_type.is_empty() || model_name.is_empty() {
        return None;
    }
    Some((movement_type, model_name))
}

/// File name for a model asset.
pub fn model_file_name(movement_type: &str, model_name: &str) -> String {
    format!("{MODEL_PREFIX}{movement_type}_{model_name}{MODEL_EXTENSION}")
}

/// Inference failures.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// Asset file missing, unreadable or inconsistent
    InvalidAsset(String),
    /// No frame had the width the model expects
    NoValidFrames,
    DimensionMismatch { expected: usize, actual: usize },
    Features(FeatureError),
    Recording(RecordingError),
    Prediction(String),
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceError::InvalidAsset(e) => write!(f, "Invalid model asset: {e}"),
            InferenceError::NoValidFrames => write!(
                f,
                "Could not process movement data. It might be empty or in the wrong format."
            ),
            InferenceError::DimensionMismatch { expected, actual } => {
                write!(f, "Expected {expected} features, got {actual}")
            }
            InferenceError::Features(e) => write!(f, "Feature extraction failed: {e}"),
            InferenceError::Recording(e) => write!(f, "{e}"),
            InferenceError::Prediction(e) => write!(f, "Prediction failed: {e}"),
        }
    }
}

impl std::error::Error for InferenceError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::DEFAULT_RELATIVE_PAIRS;
    use crate::core::quaternion::Orientation;

    /// A 10-sensor model with two classes: arms still vs arm raised.
    fn test_model() -> Model {
        let schema = FeatureSchema::new(10, DEFAULT_RELATIVE_PAIRS.to_vec()).unwrap();
        let extractor = FeatureExtractor::new(schema.clone());

        let still = extractor.normalize_and_extract(&movement(0.0)).unwrap();
        let raised = extractor.normalize_and_extract(&movement(0.6)).unwrap();
        let scaler = midpoint_scaler(still.values(), raised.values());
        let classifier = NearestCentroid::new(vec![
            Centroid {
                label: "Correct".into(),
                values: scaler.transform(still.values()).unwrap(),
            },
            Centroid {
                label: "Wrong".into(),
                values: scaler.transform(raised.values()).unwrap(),
            },
        ])
        .unwrap();

        Model::new(schema, scaler, Arc::new(classifier)).unwrap()
    }

    /// Standardization fitted to two rows: mean is the midpoint, scale half
    /// the spread (1 where the rows agree).
    fn midpoint_scaler(a: &[f64], b: &[f64]) -> StandardScaler {
        let mean = a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect();
        let scale = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let half = (x - y).abs() / 2.0;
                if half > 0.0 {
                    half
                } else {
                    1.0
                }
            })
            .collect();
        StandardScaler::new(mean, scale).unwrap()
    }

    /// Sensor 2 rotates about x by up to `amplitude` over 20 frames.
    fn movement(amplitude: f64) -> Recording {
        let frames = (0..20)
            .map(|i| {
                let angle = amplitude * i as f64 / 19.0;
                let mut sensors = vec![Orientation::identity(); 10];
                sensors[1] = Orientation::new((angle / 2.0).cos(), (angle / 2.0).sin(), 0.0, 0.0);
                CombinedFrame::from_orientations(sensors)
            })
            .collect();
        Recording::from_frames("test", Utc::now(), frames).unwrap()
    }

    fn flat(recording: &Recording) -> Vec<Vec<f64>> {
        recording
            .frames()
            .iter()
            .map(|f| f.to_flat(ComponentOrder::XYZW))
            .collect()
    }

    #[test]
    fn test_parse_model_file() {
        assert_eq!(
            parse_model_file("model_ShoulderAbduction_RandomForest.json"),
            Some(("ShoulderAbduction", "RandomForest"))
        );
        assert_eq!(
            parse_model_file("model_Sit_And_Reach_knn.json"),
            Some(("Sit_And_Reach", "knn"))
        );
        assert_eq!(parse_model_file("model_NoName.json"), None);
        assert_eq!(parse_model_file("scaler_Squat_knn.json"), None);
        assert_eq!(parse_model_file("model_Squat_knn.pkl"), None);
        assert_eq!(
            model_file_name("Sit_And_Reach", "knn"),
            "model_Sit_And_Reach_knn.json"
        );
    }

    #[test]
    fn test_scaler() {
        let scaler = StandardScaler::new(vec![2.0, 5.0], vec![2.0, 0.0]).unwrap();
        assert_eq!(scaler.transform(&[4.0, 6.0]).unwrap(), vec![1.0, 1.0]);
        assert!(StandardScaler::new(vec![0.0], vec![]).is_err());
        assert!(matches!(
            scaler.transform(&[1.0]),
            Err(InferenceError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_nearest_centroid() {
        let classifier = NearestCentroid::new(vec![
            Centroid {
                label: "a".into(),
                values: vec![0.0, 0.0],
            },
            Centroid {
                label: "b".into(),
                values: vec![10.0, 10.0],
            },
        ])
        .unwrap();
        assert_eq!(classifier.predict(&[1.0, 2.0]).unwrap(), "a");
        assert_eq!(classifier.predict(&[8.0, 9.0]).unwrap(), "b");
        assert!(classifier.predict(&[1.0]).is_err());
        assert!(NearestCentroid::new(vec![]).is_err());
    }

    #[test]
    fn test_model_predicts_movements() {
        let model = test_model();
        assert_eq!(model.predict(&movement(0.05)).unwrap(), "Correct");
        assert_eq!(model.predict(&movement(0.55)).unwrap(), "Wrong");
    }

    #[test]
    fn test_predict_flat_skips_bad_frames() {
        let model = test_model();
        let mut frames = flat(&movement(0.6));
        frames.insert(3, vec![0.0; 12]);
        assert_eq!(
            model.predict_flat(&frames, ComponentOrder::XYZW).unwrap(),
            "Wrong"
        );

        let garbage = vec![vec![0.0; 39], vec![]];
        assert_eq!(
            model.predict_flat(&garbage, ComponentOrder::XYZW).unwrap_err(),
            InferenceError::NoValidFrames
        );
    }

    #[test]
    fn test_assets_round_trip_through_registry() {
        let model = test_model();
        let classifier = NearestCentroid::new(
            model
                .classifier()
                .labels()
                .into_iter()
                .zip([0.0, 1.0])
                .map(|(label, v)| Centroid {
                    label,
                    values: vec![v; model.schema().len()],
                })
                .collect(),
        )
        .unwrap();
        let assets = ModelAssets {
            sensor_count: 10,
            relative_pairs: DEFAULT_RELATIVE_PAIRS.to_vec(),
            feature_names: model.schema().names().to_vec(),
            scaler: model.scaler.clone(),
            classifier: ClassifierAsset::NearestCentroid {
                centroids: classifier.centroids().to_vec(),
            },
        };

        let dir = std::env::temp_dir().join(format!("smartwear-models-{}", uuid::Uuid::new_v4()));
        assets
            .save(&dir.join(model_file_name("Sit_And_Reach", "centroid")))
            .unwrap();
        std::fs::write(dir.join(model_file_name("Squat", "broken")), "{not json").unwrap();
        std::fs::write(dir.join("README.txt"), "ignored").unwrap();

        let registry = ModelRegistry::load_dir(&dir).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Sit_And_Reach", "centroid").is_some());
        assert!(registry.get("Squat", "broken").is_none());
        assert_eq!(
            registry.entries(),
            vec![("Sit_And_Reach".to_string(), "centroid".to_string())]
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_assets_with_wrong_names_rejected() {
        let model = test_model();
        let mut names = model.schema().names().to_vec();
        names.swap(0, 1);
        let assets = ModelAssets {
            sensor_count: 10,
            relative_pairs: DEFAULT_RELATIVE_PAIRS.to_vec(),
            feature_names: names,
            scaler: model.scaler.clone(),
            classifier: ClassifierAsset::NearestCentroid {
                centroids: vec![Centroid {
                    label: "x".into(),
                    values: vec![0.0; model.schema().len()],
                }],
            },
        };
        assert!(matches!(
            Model::from_assets(assets),
            Err(InferenceError::InvalidAsset(_))
        ));
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(PredictResponse::success("Correct")).unwrap();
        assert_eq!(ok, serde_json::json!({"prediction": "Correct", "status": "success"}));
        let err = serde_json::to_value(PredictResponse::failure("nope")).unwrap();
        assert_eq!(err, serde_json::json!({"error": "nope", "status": "failure"}));
    }
}
