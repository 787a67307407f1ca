//! Smartwear Motion CLI
//!
//! Capture, calibrate and featurize garment movement recordings.

use anyhow::Context;
use clap::{Parser, Subcommand};
use smartwear_motion::{
    config::{Config, DeviceConfig},
    core::{normalize_self, normalize_to_reference, normalize_to_sensor, FeatureExtractor},
    stats::create_shared_stats_with_persistence,
    store::load_recording,
    VERSION,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smartwear")]
#[command(author = "Smartwear")]
#[command(version = VERSION)]
#[command(about = "Multi-garment inertial capture and movement features", long_about = None)]
struct Cli {
    /// Override configured garments (repeatable): name=address:sensors[:order]
    #[arg(long = "device", global = true, value_name = "NAME=ADDRESS:SENSORS")]
    devices: Vec<DeviceConfig>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record labelled movements from the garments (requires ble feature)
    Record {
        /// Movement type, e.g. Squat
        #[arg(long)]
        movement: String,

        /// Participant identifier
        #[arg(long)]
        user: String,

        /// Execution label, e.g. Correct
        #[arg(long)]
        label: String,

        /// Number of repetitions to record
        #[arg(long, default_value = "1")]
        count: usize,

        /// Recording length in seconds (defaults to the configured duration)
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Record an N-pose calibration (requires ble feature)
    Calibrate {
        #[arg(long)]
        movement: String,

        #[arg(long)]
        user: String,
    },

    /// Extract the feature vector of a stored recording
    Features {
        /// Recording file
        file: PathBuf,

        /// N-pose recording to normalize against
        #[arg(long, conflicts_with = "reference_sensor")]
        calibration: Option<PathBuf>,

        /// Normalize every sensor against this sensor's first sample
        #[arg(long)]
        reference_sensor: Option<usize>,
    },

    /// Classify a stored recording with a running inference service (requires client feature)
    Predict {
        file: PathBuf,

        #[arg(long)]
        movement: String,

        #[arg(long)]
        model: String,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "5000")]
        port: u16,
    },

    /// Serve the /predict endpoint (requires server feature)
    Serve {
        #[arg(long, default_value = "5000")]
        port: u16,

        /// Model folder (defaults to the configured models path)
        #[arg(long)]
        models: Option<PathBuf>,
    },

    /// Show cumulative capture statistics
    Stats {
        /// Clear the counters
        #[arg(long)]
        reset: bool,
    },

    /// Show configuration
    Config {
        /// Persist the effective configuration (including --device overrides)
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.devices)?;

    match cli.command {
        Commands::Record {
            movement,
            user,
            label,
            count,
            duration,
        } => {
            let duration = duration
                .map(Duration::from_secs_f64)
                .unwrap_or(config.recording_duration);
            cmd_record(&config, &movement, &user, &label, count, duration).await
        }
        Commands::Calibrate { movement, user } => cmd_calibrate(&config, &movement, &user).await,
        Commands::Features {
            file,
            calibration,
            reference_sensor,
        } => cmd_features(&config, &file, calibration.as_deref(), reference_sensor),
        Commands::Predict {
            file,
            movement,
            model,
            host,
            port,
        } => cmd_predict(&config, &file, &movement, &model, host, port).await,
        Commands::Serve { port, models } => {
            let models = models.unwrap_or_else(|| config.models_path.clone());
            cmd_serve(&config, port, &models).await
        }
        Commands::Stats { reset } => cmd_stats(&config, reset),
        Commands::Config { save } => cmd_config(&config, save),
    }
}

/// Load the stored configuration and apply `--device` overrides.
fn load_config(devices: Vec<DeviceConfig>) -> anyhow::Result<Config> {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e}; using defaults");
            Config::default()
        }
    };
    if !devices.is_empty() {
        config.devices = devices;
        config.validate()?;
    }
    Ok(config)
}

#[cfg(feature = "ble")]
async fn cmd_record(
    config: &Config,
    movement: &str,
    user: &str,
    label: &str,
    count: usize,
    duration: Duration,
) -> anyhow::Result<()> {
    use smartwear_motion::store::SessionStore;

    println!("Smartwear Motion v{VERSION}");
    println!();

    config.ensure_directories()?;
    let store = SessionStore::new(&config.recordings_path, movement, user);
    match store.latest_npose()? {
        Some(path) => println!("Calibration: {}", path.display()),
        None => {
            eprintln!("Warning: no N-pose calibration for {movement}/{user}.");
            eprintln!("Run `smartwear calibrate --movement {movement} --user {user}` first.");
        }
    }

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let coordinator = smartwear_motion::CaptureCoordinator::new(
        config.session_config(),
        config.synchronizer(),
    )
    .with_stats(stats.clone());
    let file_label = store.file_label(label);

    println!("Recording {count} x {:.1}s of {file_label}", duration.as_secs_f64());
    println!("Press Ctrl+C to stop");
    println!();

    for take in 1..=count {
        if take > 1 {
            println!("Next take in 2s...");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        let capture = coordinator.capture(ble_links(config), &file_label, duration);
        let outcome = tokio::select! {
            outcome = capture => outcome,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Interrupted.");
                break;
            }
        };

        match outcome {
            Ok(outcome) => {
                let path = store.save_movement(&outcome.recording, label, config.stored_order)?;
                stats.record_recording_saved();
                println!(
                    "[{take}/{count}] {} frames -> {}",
                    outcome.recording.len(),
                    path.display()
                );
                for (device, dropped) in outcome.malformed.iter().filter(|(_, n)| *n > 0) {
                    println!("  {device}: {dropped} malformed packets dropped");
                }
            }
            Err(e) => {
                eprintln!("[{take}/{count}] Capture failed: {e}");
            }
        }
    }

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }
    println!();
    println!("{}", stats.summary());
    Ok(())
}

#[cfg(feature = "ble")]
async fn cmd_calibrate(config: &Config, movement: &str, user: &str) -> anyhow::Result<()> {
    use smartwear_motion::core::NPOSE_LABEL;
    use smartwear_motion::store::SessionStore;

    config.ensure_directories()?;
    let store = SessionStore::new(&config.recordings_path, movement, user);
    let stats = create_shared_stats_with_persistence(config.stats_path());
    let coordinator = smartwear_motion::CaptureCoordinator::new(
        config.session_config(),
        config.synchronizer(),
    )
    .with_stats(stats.clone());

    println!("Stand in N-pose: arms down, palms facing your legs, feet together.");
    println!(
        "Recording {:.1}s calibration...",
        config.calibration_duration.as_secs_f64()
    );

    let outcome = coordinator
        .capture(ble_links(config), NPOSE_LABEL, config.calibration_duration)
        .await?;
    let path = store.save_npose(&outcome.recording, config.stored_order)?;
    stats.record_recording_saved();
    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }

    println!("Saved {} frames to {}", outcome.recording.len(), path.display());
    Ok(())
}

#[cfg(feature = "ble")]
fn ble_links(
    config: &Config,
) -> Vec<smartwear_motion::DeviceLink<smartwear_motion::acquisition::BleTransport>> {
    config
        .device_specs()
        .into_iter()
        .map(|spec| {
            let transport = smartwear_motion::acquisition::BleTransport::new(spec.address.clone());
            smartwear_motion::DeviceLink::new(spec, transport)
        })
        .collect()
}

#[cfg(not(feature = "ble"))]
async fn cmd_record(
    _config: &Config,
    _movement: &str,
    _user: &str,
    _label: &str,
    _count: usize,
    _duration: Duration,
) -> anyhow::Result<()> {
    eprintln!("Warning: recording ignored (ble feature not enabled at compile time)");
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn cmd_calibrate(_config: &Config, _movement: &str, _user: &str) -> anyhow::Result<()> {
    eprintln!("Warning: calibration ignored (ble feature not enabled at compile time)");
    Ok(())
}

fn cmd_features(
    config: &Config,
    file: &Path,
    calibration: Option<&Path>,
    reference_sensor: Option<usize>,
) -> anyhow::Result<()> {
    let layout = config.layout();
    let recording = load_recording(file, &layout)
        .with_context(|| format!("loading {}", file.display()))?;

    let normalized = match (calibration, reference_sensor) {
        (Some(path), _) => {
            let npose = load_recording(path, &layout)
                .with_context(|| format!("loading {}", path.display()))?;
            let reference = npose
                .reference_frame()
                .context("calibration recording has no frames")?;
            normalize_to_reference(&recording, reference)?
        }
        (None, Some(sensor)) => normalize_to_sensor(&recording, sensor)?,
        (None, None) => normalize_self(&recording)?,
    };

    let extractor = FeatureExtractor::new(config.feature_schema()?);
    let features = extractor.extract(&normalized)?;

    let stats = create_shared_stats_with_persistence(config.stats_path());
    stats.record_vector_extracted();
    if let Err(e) = stats.save() {
        tracing::warn!(error = %e, "Could not save stats");
    }

    println!("{}", serde_json::to_string_pretty(&features)?);
    Ok(())
}

#[cfg(feature = "client")]
async fn cmd_predict(
    config: &Config,
    file: &Path,
    movement: &str,
    model: &str,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    use smartwear_motion::{ClientConfig, InferenceClient};

    let recording = load_recording(file, &config.layout())
        .with_context(|| format!("loading {}", file.display()))?;
    let mut client_config = ClientConfig::new(host, port);
    client_config.frame_order = config.stored_order;
    let client = InferenceClient::new(client_config)?;

    match client.test_connection().await {
        Ok(true) => {}
        Ok(false) => eprintln!("Warning: inference health check failed"),
        Err(e) => eprintln!("Warning: Could not reach inference service: {e}"),
    }

    let prediction = client.predict(&recording, movement, model).await?;
    println!("{prediction}");
    Ok(())
}

#[cfg(not(feature = "client"))]
async fn cmd_predict(
    _config: &Config,
    _file: &Path,
    _movement: &str,
    _model: &str,
    _host: String,
    _port: u16,
) -> anyhow::Result<()> {
    eprintln!("Warning: predict ignored (client feature not enabled at compile time)");
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve(config: &Config, port: u16, models: &Path) -> anyhow::Result<()> {
    use smartwear_motion::server::{self, ServerConfig, ServerState};
    use smartwear_motion::ModelRegistry;

    let registry = ModelRegistry::load_dir(models)?;
    if registry.is_empty() {
        eprintln!("Warning: no models found in {}", models.display());
    }

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let server_config = ServerConfig::new(port);
    let state = ServerState::new(registry, config.stored_order).with_stats(stats.clone());

    let (addr, shutdown) = server::run(server_config, state).await?;
    println!("Serving /predict on http://{addr}");
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    let _ = shutdown.send(());

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save stats: {e}");
    }
    Ok(())
}

#[cfg(not(feature = "server"))]
async fn cmd_serve(_config: &Config, _port: u16, _models: &Path) -> anyhow::Result<()> {
    eprintln!("Warning: serve ignored (server feature not enabled at compile time)");
    Ok(())
}

fn cmd_stats(config: &Config, reset: bool) -> anyhow::Result<()> {
    let path = config.stats_path();

    if reset {
        let stats = create_shared_stats_with_persistence(path);
        stats.reset();
        stats.save()?;
        println!("Capture statistics cleared.");
        return Ok(());
    }

    println!("Smartwear Motion Status");
    println!("=======================");
    println!();
    println!("Devices:");
    for device in &config.devices {
        let address = if device.address.is_empty() {
            "<unset>"
        } else {
            device.address.as_str()
        };
        println!("  {}: {} sensors @ {}", device.name, device.sensors, address);
    }
    println!();

    if !path.exists() {
        println!("No previous session data found.");
        return Ok(());
    }

    let snapshot = create_shared_stats_with_persistence(path).snapshot();
    println!("Cumulative Statistics:");
    println!("  Frames decoded: {}", snapshot.frames_decoded);
    println!("  Packets dropped: {}", snapshot.packets_dropped);
    println!("  Recordings saved: {}", snapshot.recordings_saved);
    println!("  Capture failures: {}", snapshot.capture_failures);
    println!("  Feature vectors: {}", snapshot.vectors_extracted);
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    if save {
        config.save()?;
        println!("Saved configuration to {:?}", Config::config_path());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
