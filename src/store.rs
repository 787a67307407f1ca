//! On-disk layout of recording sessions.
//!
//! ```text
//! <root>/<movement>/<user>/npose_<timestamp>.json
//! <root>/<movement>/<user>/<label>/movement_<timestamp>.json
//! ```
//!
//! Movement files carry the label `<movement>_<label>`; calibration files
//! carry the N-pose label.

use crate::core::quaternion::ComponentOrder;
use crate::core::recording::{Recording, RecordingError, RecordingLayout, StoredRecording};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

const NPOSE_PREFIX: &str = "npose_";
const MOVEMENT_PREFIX: &str = "movement_";

/// Recording folder for one movement type and one user.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    movement: String,
}

impl SessionStore {
    pub fn new(root: &Path, movement: &str, user: &str) -> Self {
        Self {
            dir: root.join(movement).join(user),
            movement: movement.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Label written into movement files.
    pub fn file_label(&self, label: &str) -> String {
        format!("{}_{label}", self.movement)
    }

    pub fn movement_path(&self, label: &str, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(label)
            .join(format!("{MOVEMENT_PREFIX}{}.json", timestamp(at)))
    }

    pub fn npose_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{NPOSE_PREFIX}{}.json", timestamp(at)))
    }

    /// Most recent N-pose file of this session, if any.
    pub fn latest_npose(&self) -> Result<Option<PathBuf>, RecordingError> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RecordingError::Io(e.to_string()))?;
        let mut calibrations: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(NPOSE_PREFIX) && n.ends_with(".json"))
            })
            .collect();
        // Timestamps sort lexicographically
        calibrations.sort();
        Ok(calibrations.pop())
    }

    /// Save a movement recording under `label`.
    pub fn save_movement(
        &self,
        recording: &Recording,
        label: &str,
        order: ComponentOrder,
    ) -> Result<PathBuf, RecordingError> {
        let path = self.movement_path(label, recording.created_at());
        recording.save(&path, order)?;
        Ok(path)
    }

    /// Save an N-pose recording.
    pub fn save_npose(
        &self,
        recording: &Recording,
        order: ComponentOrder,
    ) -> Result<PathBuf, RecordingError> {
        let path = self.npose_path(recording.created_at());
        recording.save(&path, order)?;
        Ok(path)
    }
}

/// Load any stored recording file with the given layout.
pub fn load_recording(path: &Path, layout: &RecordingLayout) -> Result<Recording, RecordingError> {
    StoredRecording::load(path)?.to_recording(layout)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}
