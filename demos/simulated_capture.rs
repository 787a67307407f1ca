//! Demonstration of the capture pipeline without hardware.
//!
//! This example shows how to:
//! 1. Script two garments with the simulated transport
//! 2. Capture them concurrently into one recording
//! 3. Normalize the recording and extract its feature vector
//!
//! Run with: cargo run --example simulated_capture
//!
//! Set RUST_LOG=debug to see the session lifecycle.

use std::time::Duration;

use smartwear_motion::{
    acquisition::{CaptureCoordinator, DeviceLink, DeviceSpec, SimulatedTransport},
    config::{Config, DeviceConfig},
    core::{normalize_self, FeatureExtractor, Orientation},
    stats::create_shared_stats,
};
use tracing_subscriber::EnvFilter;

/// A slow squat: every sensor pitches forward and back once over `frames`.
fn squat_script(spec: &DeviceSpec, frames: usize) -> anyhow::Result<Vec<Vec<u8>>> {
    let sensors = spec.schema.sensors_per_device;
    (0..frames)
        .map(|i| {
            let phase = i as f64 / frames as f64 * std::f64::consts::TAU;
            let orientations: Vec<Orientation> = (0..sensors)
                .map(|s| {
                    let angle = 0.4 * phase.sin() * (s + 1) as f64 / sensors as f64;
                    Orientation::new((angle / 2.0).cos(), (angle / 2.0).sin(), 0.0, 0.0)
                })
                .collect();
            Ok(spec.schema.encode(&orientations)?)
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Smartwear Motion - Simulated Capture");
    println!("====================================");
    println!();

    let mut config = Config::default();
    config.devices = vec![
        DeviceConfig::new("jacket", "sim-jacket", 10),
        DeviceConfig::new("pants", "sim-pants", 6),
    ];
    config.validate()?;

    let mut links = Vec::new();
    for spec in config.device_specs() {
        let script = squat_script(&spec, 400)?;
        println!(
            "  {}: {} sensors, {} byte packets",
            spec.name,
            spec.schema.sensors_per_device,
            spec.schema.payload_len()
        );
        links.push(DeviceLink::new(
            spec,
            SimulatedTransport::new(script, Duration::from_millis(10)),
        ));
    }
    println!();

    let stats = create_shared_stats();
    let coordinator = CaptureCoordinator::new(config.session_config(), config.synchronizer())
        .with_stats(stats.clone());

    println!("Capturing for 2 seconds...");
    let outcome = coordinator
        .capture(links, "Squat_Correct", Duration::from_secs(2))
        .await?;
    println!(
        "Captured {} frames of {} sensors",
        outcome.recording.len(),
        outcome.recording.sensor_count()
    );
    println!();

    let extractor = FeatureExtractor::new(config.feature_schema()?);
    let features = extractor.extract(&normalize_self(&outcome.recording)?)?;
    stats.record_vector_extracted();

    println!("Feature vector ({} values), first entries:", features.len());
    for (name, value) in features.iter().take(10) {
        println!("  {name:<20} {value:>9.5}");
    }
    println!();
    println!("{}", stats.summary());

    Ok(())
}
