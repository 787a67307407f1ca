//! Persistent capture counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running totals for captures and feature extraction.
#[derive(Debug)]
pub struct CaptureStats {
    /// Frames decoded from notifications
    frames_decoded: AtomicU64,
    /// Payloads rejected by the decoder
    packets_dropped: AtomicU64,
    /// Recordings written to disk
    recordings_saved: AtomicU64,
    /// Captures that ended with a device failure
    capture_failures: AtomicU64,
    /// Feature vectors extracted
    vectors_extracted: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            frames_decoded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            recordings_saved: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            vectors_extracted: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create counters backed by a JSON file, resuming from it if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!(error = %e, "Could not load previous capture stats");
        }

        stats
    }

    pub fn record_frames(&self, count: u64) {
        self.frames_decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped_packets(&self, count: u64) {
        self.packets_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_recording_saved(&self) {
        self.recordings_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vector_extracted(&self) {
        self.vectors_extracted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            recordings_saved: self.recordings_saved.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            vectors_extracted: self.vectors_extracted.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Fraction of received payloads that were rejected.
    pub fn drop_rate(&self) -> f64 {
        let snapshot = self.snapshot();
        let received = snapshot.frames_decoded + snapshot.packets_dropped;
        if received == 0 {
            0.0
        } else {
            snapshot.packets_dropped as f64 / received as f64
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Capture Statistics:\n\
             - Frames decoded: {}\n\
             - Packets dropped: {} ({:.2}%)\n\
             - Recordings saved: {}\n\
             - Failed captures: {}\n\
             - Feature vectors extracted: {}\n\
             - Session duration: {} seconds",
            stats.frames_decoded,
            stats.packets_dropped,
            self.drop_rate() * 100.0,
            stats.recordings_saved,
            stats.capture_failures,
            stats.vectors_extracted,
            stats.session_duration_secs
        )
    }

    /// Save counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.snapshot();
            let persisted = PersistedStats {
                frames_decoded: stats.frames_decoded,
                packets_dropped: stats.packets_dropped,
                recordings_saved: stats.recordings_saved,
                capture_failures: stats.capture_failures,
                vectors_extracted: stats.vectors_extracted,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.frames_decoded
                    .store(persisted.frames_decoded, Ordering::Relaxed);
                self.packets_dropped
                    .store(persisted.packets_dropped, Ordering::Relaxed);
                self.recordings_saved
                    .store(persisted.recordings_saved, Ordering::Relaxed);
                self.capture_failures
                    .store(persisted.capture_failures, Ordering::Relaxed);
                self.vectors_extracted
                    .store(persisted.vectors_extracted, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.recordings_saved.store(0, Ordering::Relaxed);
        self.capture_failures.store(0, Ordering::Relaxed);
        self.vectors_extracted.store(0, Ordering::Relaxed);
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_decoded: u64,
    pub packets_dropped: u64,
    pub recordings_saved: u64,
    pub capture_failures: u64,
    pub vectors_extracted: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    frames_decoded: u64,
    packets_dropped: u64,
    recordings_saved: u64,
    #[serde(default)]
    capture_failures: u64,
    vectors_extracted: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared counters.
pub type SharedCaptureStats = Arc<CaptureStats>;

pub fn create_shared_stats() -> SharedCaptureStats {
    Arc::new(CaptureStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedCaptureStats {
    Arc::new(CaptureStats::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = CaptureStats::new();

        stats.record_frames(120);
        stats.record_dropped_packets(3);
        stats.record_recording_saved();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_decoded, 120);
        assert_eq!(snapshot.packets_dropped, 3);
        assert_eq!(snapshot.recordings_saved, 1);
        assert_eq!(snapshot.vectors_extracted, 0);
    }

    #[test]
    fn test_drop_rate() {
        let stats = CaptureStats::new();
        assert_eq!(stats.drop_rate(), 0.0);

        stats.record_frames(99);
        stats.record_dropped_packets(1);
        assert!((stats.drop_rate() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_reset() {
        let stats = CaptureStats::new();
        stats.record_frames(10);
        stats.record_capture_failure();
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_decoded, 0);
        assert_eq!(snapshot.capture_failures, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("smartwear-stats-{}", uuid::Uuid::new_v4()))
            .join("stats.json");

        let stats = CaptureStats::with_persistence(path.clone());
        stats.record_frames(42);
        stats.record_vector_extracted();
        stats.save().unwrap();

        let restored = CaptureStats::with_persistence(path.clone());
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.frames_decoded, 42);
        assert_eq!(snapshot.vectors_extracted, 1);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_summary_format() {
        let summary = CaptureStats::new().summary();
        assert!(summary.contains("Frames decoded"));
        assert!(summary.contains("Packets dropped"));
        assert!(summary.contains("Feature vectors extracted"));
    }
}
