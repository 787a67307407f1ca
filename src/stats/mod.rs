//! Capture statistics for the smartwear agent.
//!
//! Counters for what the pipeline processed and dropped, kept across runs so
//! flaky links show up as a rising drop count.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_stats, create_shared_stats_with_persistence, CaptureStats, SharedCaptureStats,
    StatsSnapshot,
};
