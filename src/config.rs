//! Configuration for the smartwear agent.

use crate::acquisition::packet::PacketSchema;
use crate::acquisition::session::{DeviceSpec, SessionConfig};
use crate::acquisition::transport::bluetooth_uuid;
use crate::core::features::{FeatureError, FeatureSchema, RelativePair, DEFAULT_RELATIVE_PAIRS};
use crate::core::quaternion::ComponentOrder;
use crate::core::recording::RecordingLayout;
use crate::core::sync::Synchronizer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Short identifier of the orientation characteristic on current firmware.
pub const ORIENTATION_CHARACTERISTIC: u16 = 0xFF64;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Garments in combined-frame order
    pub devices: Vec<DeviceConfig>,

    /// Characteristic carrying orientation notifications
    pub orientation_characteristic: Uuid,

    /// Length of each movement recording
    #[serde(with = "duration_serde")]
    pub recording_duration: Duration,

    /// Length of an N-pose calibration recording
    #[serde(with = "duration_serde")]
    pub calibration_duration: Duration,

    /// Upper bound on connecting to one garment
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Notification queue size per device
    pub queue_capacity: usize,

    /// Slot order of quaternions in stored recordings
    pub stored_order: ComponentOrder,

    /// Relative-joint pairs featurized after the per-sensor statistics
    pub relative_pairs: Vec<RelativePair>,

    /// Sensor used as the shared reference when no N-pose is available
    pub reference_sensor: usize,

    /// Root folder for recordings
    pub recordings_path: PathBuf,

    /// Folder of classifier assets served by the inference endpoint
    pub models_path: PathBuf,

    /// Path for storing stats
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smartwear-motion");

        Self {
            devices: vec![DeviceConfig::new("jacket", "", 10)],
            orientation_characteristic: bluetooth_uuid(ORIENTATION_CHARACTERISTIC),
            recording_duration: Duration::from_secs(4),
            calibration_duration: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            stored_order: ComponentOrder::XYZW,
            relative_pairs: DEFAULT_RELATIVE_PAIRS.to_vec(),
            reference_sensor: 4, // back
            recordings_path: data_dir.join("recordings"),
            models_path: data_dir.join("models"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smartwear-motion")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [&self.recordings_path, &self.models_path, &self.data_path] {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        Ok(())
    }

    /// Check the device topology and feature settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one device is required".into()));
        }
        for (i, device) in self.devices.iter().enumerate() {
            if device.sensors == 0 {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' has no sensors",
                    device.name
                )));
            }
            if self.devices[..i].iter().any(|d| d.name == device.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.reference_sensor >= self.total_sensors() {
            return Err(ConfigError::Invalid(format!(
                "reference_sensor {} out of range ({} sensors)",
                self.reference_sensor,
                self.total_sensors()
            )));
        }
        self.feature_schema()
            .map(|_| ())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn total_sensors(&self) -> usize {
        self.devices.iter().map(|d| d.sensors).sum()
    }

    /// Device names in combined-frame order.
    pub fn device_order(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    pub fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(self.device_order())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Per-device link settings for a capture.
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.devices
            .iter()
            .map(|d| DeviceSpec {
                name: d.name.clone(),
                address: d.address.clone(),
                characteristic: self.orientation_characteristic,
                schema: PacketSchema::new(d.sensors, d.component_order),
            })
            .collect()
    }

    /// How stored recordings map onto combined frames.
    pub fn layout(&self) -> RecordingLayout {
        RecordingLayout {
            devices: self
                .devices
                .iter()
                .map(|d| (d.name.clone(), d.sensors))
                .collect(),
            order: self.stored_order,
        }
    }

    pub fn feature_schema(&self) -> Result<FeatureSchema, FeatureError> {
        FeatureSchema::new(self.total_sensors(), self.relative_pairs.clone())
    }

    /// Path of the persisted capture stats.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }
}

/// One garment in the capture topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// MAC address, platform identifier or advertised name
    pub address: String,
    /// Sensors reported in each notification
    pub sensors: usize,
    /// Wire slot order of each quaternion
    #[serde(default)]
    pub component_order: ComponentOrder,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>, sensors: usize) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            sensors,
            component_order: ComponentOrder::WXYZ,
        }
    }
}

impl std::str::FromStr for DeviceConfig {
    type Err = ConfigError;

    /// Parse `name=address:sensors[:order]`, e.g.
    /// `jacket=BE5663ED-E011-B0C5-C8F7-2829764800F7:10`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ConfigError::Invalid(format!(
                "expected name=address:sensors[:order], got '{s}'"
            ))
        };

        let (name, rest) = s.split_once('=').ok_or_else(invalid)?;
        let mut parts = rest.rsplitn(3, ':').collect::<Vec<_>>();
        parts.reverse();

        // Addresses may contain ':' themselves, so peel fields off the end.
        let (address, sensors, order) = match parts.as_slice() {
            [address, sensors] => (*address, *sensors, None),
            [head, a, b] => match b.parse::<ComponentOrder>() {
                Ok(order) => (*head, *a, Some(order)),
                Err(_) => {
                    let address = rest.rsplit_once(':').map(|(a, _)| a).ok_or_else(invalid)?;
                    (address, *b, None)
                }
            },
            _ => return Err(invalid()),
        };

        let name = name.trim();
        let sensors: usize = sensors.trim().parse().map_err(|_| invalid())?;
        if name.is_empty() || sensors == 0 {
            return Err(invalid());
        }

        let mut device = DeviceConfig::new(name, address.trim(), sensors);
        if let Some(order) = order {
            device.component_order = order;
        }
        Ok(device)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as fractional seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_garment() -> Config {
        Config {
            devices: vec![
                DeviceConfig::new("jacket", "BE5663ED-E011-B0C5-C8F7-2829764800F7", 10),
                DeviceConfig::new("pants", "6BED8222-E5E9-9F63-6890-9C57DDB007FD", 4),
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.recording_duration, Duration::from_secs(4));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.stored_order, ComponentOrder::XYZW);
        assert_eq!(
            config.orientation_characteristic,
            bluetooth_uuid(ORIENTATION_CHARACTERISTIC)
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.feature_schema().unwrap().len(), 10 * 20 + 3 * 20);
    }

    #[test]
    fn test_json_round_trip() {
        let config = dual_garment();
        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.devices, config.devices);
        assert_eq!(restored.relative_pairs, config.relative_pairs);
        assert_eq!(restored.recording_duration, config.recording_duration);
        assert!(json.contains("\"stored_order\":\"xyzw\""));
    }

    #[test]
    fn test_layout_and_specs_follow_device_order() {
        let config = dual_garment();
        assert_eq!(config.total_sensors(), 14);
        assert_eq!(
            config.layout().devices,
            vec![("jacket".to_string(), 10), ("pants".to_string(), 4)]
        );

        let specs = config.device_specs();
        assert_eq!(specs[1].name, "pants");
        assert_eq!(specs[1].schema.payload_len(), 32);
        assert_eq!(specs[0].characteristic, config.orientation_characteristic);
    }

    #[test]
    fn test_validation() {
        let mut config = dual_garment();
        config.devices[1].name = "jacket".to_string();
        assert!(config.validate().is_err());

        let mut config = dual_garment();
        config.devices.clear();
        assert!(config.validate().is_err());

        // rel_s3_s8 needs at least eight sensors
        let mut config = Config::default();
        config.devices[0].sensors = 5;
        config.reference_sensor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_parsing() {
        let device: DeviceConfig = "jacket=BE5663ED-E011-B0C5-C8F7-2829764800F7:10"
            .parse()
            .unwrap();
        assert_eq!(device.name, "jacket");
        assert_eq!(device.address, "BE5663ED-E011-B0C5-C8F7-2829764800F7");
        assert_eq!(device.sensors, 10);
        assert_eq!(device.component_order, ComponentOrder::WXYZ);

        let device: DeviceConfig = "pants=AA:BB:CC:DD:EE:FF:4:xyzw".parse().unwrap();
        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.sensors, 4);
        assert_eq!(device.component_order, ComponentOrder::XYZW);

        let device: DeviceConfig = "pants=AA:BB:CC:DD:EE:FF:4".parse().unwrap();
        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.sensors, 4);

        assert!("jacket".parse::<DeviceConfig>().is_err());
        assert!("jacket=addr:zero".parse::<DeviceConfig>().is_err());
    }
}
