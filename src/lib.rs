//! Smartwear Motion - multi-garment inertial capture for movement analysis.
//!
//! This library connects to sensorized garments (a jacket and trousers),
//! records their orientation streams, aligns them into combined frames,
//! removes each sensor's mounting offset and reduces a recording to a
//! fixed-size feature vector for a movement classifier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Smartwear Motion                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────┐               │
//! │  │  Session   │──▶│  Decoder   │──▶│ Synchronizer│──▶ Recording  │
//! │  │ (per link) │   │ (packets)  │   │ (fan-in)    │       │       │
//! │  └────────────┘   └────────────┘   └─────────────┘       ▼       │
//! │        │                                          ┌────────────┐ │
//! │        ▼                                          │ Normalizer │ │
//! │  ┌────────────┐                                   └────────────┘ │
//! │  │   Stats    │                                          │       │
//! │  └────────────┘   ┌────────────┐   ┌─────────────┐       ▼       │
//! │                   │ Classifier │◀──│  Features   │◀──────┘       │
//! │                   │ (/predict) │   │ (schema)    │               │
//! │                   └────────────┘   └─────────────┘               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use smartwear_motion::{core, Config, Recording};
//!
//! let config = Config::load().unwrap_or_default();
//! let extractor = core::FeatureExtractor::new(config.feature_schema()?);
//!
//! let recording: Recording = smartwear_motion::store::load_recording(
//!     std::path::Path::new("movement.json"),
//!     &config.layout(),
//! )?;
//! let features = extractor.normalize_and_extract(&recording)?;
//! println!("{} features", features.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod config;
pub mod core;
pub mod inference;
pub mod stats;
pub mod store;

pub mod client;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use acquisition::{
    CaptureCoordinator, CaptureError, DeviceLink, DeviceSession, DeviceSpec, PacketDecoder,
    PacketSchema, SessionError, Transport,
};
pub use config::{Config, DeviceConfig};
pub use core::{
    ComponentOrder, FeatureExtractor, FeatureSchema, FeatureVector, Orientation, Recording,
    Synchronizer,
};
pub use inference::{Model, ModelRegistry, PredictRequest, PredictResponse};
pub use stats::{CaptureStats, SharedCaptureStats};
pub use store::SessionStore;

// Client re-exports (when enabled)
#[cfg(feature = "client")]
pub use client::{ClientConfig, ClientError, InferenceClient};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
