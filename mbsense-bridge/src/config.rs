//! Configuration for the Modbus bridge.

use std::collections::HashSet;
use std::path::Path;

use mbsense_common::config::{LoggingConfig, ZenohConfig};
use mbsense_common::serialization::Format;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] mbsense_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Encoding of published events and replies
    #[serde(default)]
    pub serialization: Format,

    /// Key expression prefix (default: "mbsense")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection shared by every unit without a `uri` of its own
    #[serde(default)]
    pub uri: Option<String>,

    /// Bundled codec providers to register (default: all of them)
    #[serde(default)]
    pub plugins: Option<Vec<String>>,

    /// Units (RTUs) to expose
    pub units: Vec<UnitConfig>,
}

fn default_key_prefix() -> String {
    mbsense_common::KEY_PREFIX.to_string()
}

/// Configuration of a single unit (RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unit identifier (used in key expressions)
    pub uid: String,

    /// Free-form description
    #[serde(default)]
    pub info: Option<String>,

    /// Connection URI: `tcp://host:port` or `tty://dev/ttyUSB0:19200`
    #[serde(default)]
    pub uri: Option<String>,

    /// Verb prefix (default: `uid`)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Modbus slave id, 0 leaves the transport default
    #[serde(default)]
    pub slaveid: u8,

    /// Response timeout in milliseconds, 0 uses the transport default
    #[serde(default)]
    pub timeout: u64,

    /// Log wire traffic at debug level
    #[serde(default)]
    pub debug: bool,

    /// Default polling frequency of the unit's sensors
    #[serde(default = "default_hertz")]
    pub hertz: u32,

    /// Default idle threshold in ticks, 0 never forces an emission
    #[serde(default)]
    pub idle: u32,

    /// Connection policy at startup
    #[serde(default)]
    pub autostart: Autostart,

    /// Sensors exposed by this unit
    pub sensors: Vec<SensorConfig>,
}

fn default_hertz() -> u32 {
    10
}

/// What to do with a unit's connection when the bridge starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Autostart {
    /// Stay disconnected until an admin `connect`.
    Off,
    /// Try to connect, keep the unit on failure.
    #[default]
    Try,
    /// Connection failure aborts the unit.
    Required,
}

impl TryFrom<u8> for Autostart {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Autostart::Off),
            1 => Ok(Autostart::Try),
            2 => Ok(Autostart::Required),
            other => Err(format!("invalid autostart {} (use 0, 1 or 2)", other)),
        }
    }
}

impl From<Autostart> for u8 {
    fn from(value: Autostart) -> Self {
        match value {
            Autostart::Off => 0,
            Autostart::Try => 1,
            Autostart::Required => 2,
        }
    }
}

/// Configuration of a sensor: a register range decoded by a codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor identifier, unique within its unit
    pub uid: String,

    #[serde(default)]
    pub info: Option<String>,

    /// First register address (0-based)
    pub register: u16,

    /// Register function: COIL_INPUT, COIL_HOLDING, REGISTER_INPUT, REGISTER_HOLDING
    #[serde(rename = "type")]
    pub function: String,

    /// Codec uri: `INT16` or `plugin://provider#format`
    pub format: String,

    /// Number of elements (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,

    /// Polling frequency (default: the unit's)
    #[serde(default)]
    pub hertz: Option<u32>,

    /// Idle threshold (default: the unit's)
    #[serde(default)]
    pub idle: Option<u32>,

    /// Codec initialisation arguments
    #[serde(default)]
    pub args: Option<serde_json::Value>,

    /// Usage description echoed by `info`
    #[serde(default)]
    pub usage: Option<serde_json::Value>,

    /// Sample request echoed by `info`
    #[serde(default)]
    pub sample: Option<serde_json::Value>,

    /// Subscribe at startup and publish every emission
    #[serde(default)]
    pub autosubscribe: bool,
}

fn default_count() -> u16 {
    1
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: BridgeConfig = mbsense_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = mbsense_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Register function ids and codec uris are checked when units are built,
    /// since codec resolution depends on the registered providers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.units.is_empty() {
            return Err(ConfigError::Validation(
                "At least one unit must be configured".to_string(),
            ));
        }

        let mut uids = HashSet::new();
        for unit in &self.units {
            if unit.uid.is_empty() {
                return Err(ConfigError::Validation(
                    "Unit uid cannot be empty".to_string(),
                ));
            }
            if !uids.insert(unit.uid.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate unit uid '{}'",
                    unit.uid
                )));
            }
            if unit.uri.is_none() && self.uri.is_none() {
                return Err(ConfigError::Validation(format!(
                    "Unit '{}': no uri and no global uri",
                    unit.uid
                )));
            }
            if unit.uri.is_none() && unit.slaveid == 0 {
                return Err(ConfigError::Validation(format!(
                    "Unit '{}': slaveid is required on the shared uri",
                    unit.uid
                )));
            }
            if unit.hertz == 0 {
                return Err(ConfigError::Validation(format!(
                    "Unit '{}': hertz must be positive",
                    unit.uid
                )));
            }
            if unit.sensors.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Unit '{}': at least one sensor must be configured",
                    unit.uid
                )));
            }

            let mut sensors = HashSet::new();
            for sensor in &unit.sensors {
                if sensor.uid.is_empty() || sensor.uid.contains('/') {
                    return Err(ConfigError::Validation(format!(
                        "Unit '{}': invalid sensor uid '{}'",
                        unit.uid, sensor.uid
                    )));
                }
                if !sensors.insert(sensor.uid.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Unit '{}': duplicate sensor uid '{}'",
                        unit.uid, sensor.uid
                    )));
                }
                if sensor.count == 0 {
                    return Err(ConfigError::Validation(format!(
                        "Sensor '{}/{}': count must be positive",
                        unit.uid, sensor.uid
                    )));
                }
                if sensor.hertz == Some(0) {
                    return Err(ConfigError::Validation(format!(
                        "Sensor '{}/{}': hertz must be positive",
                        unit.uid, sensor.uid
                    )));
                }
            }
        }

        Ok(())
    }
}

impl UnitConfig {
    /// Prefix of the unit's verbs.
    pub fn verb_prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(&self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_unit() {
        let json = r#"{
            units: [
                {
                    uid: "rtu01",
                    uri: "tcp://192.168.1.10:502",
                    slaveid: 1,
                    sensors: [
                        { uid: "temps", register: 0, type: "REGISTER_HOLDING", format: "INT16", count: 4 }
                    ]
                }
            ]
        }"#;

        let config = BridgeConfig::parse(json).unwrap();
        assert_eq!(config.key_prefix, "mbsense");
        assert_eq!(config.serialization, Format::Json);

        let unit = &config.units[0];
        assert_eq!(unit.uid, "rtu01");
        assert_eq!(unit.verb_prefix(), "rtu01");
        assert_eq!(unit.hertz, 10);
        assert_eq!(unit.idle, 0);
        assert_eq!(unit.autostart, Autostart::Try);
        assert_eq!(unit.sensors[0].function, "REGISTER_HOLDING");
        assert_eq!(unit.sensors[0].count, 4);
        assert_eq!(unit.sensors[0].hertz, None);
    }

    #[test]
    fn test_parse_plugin_sensor() {
        let json = r#"{
            serialization: "cbor",
            uri: "tty://dev/ttyUSB0:9600",
            plugins: ["king_pigeon"],
            units: [
                {
                    uid: "pigeon",
                    prefix: "kp",
                    slaveid: 4,
                    autostart: 2,
                    idle: 5,
                    sensors: [
                        {
                            uid: "counter",
                            register: 10,
                            type: "REGISTER_INPUT",
                            format: "plugin://king_pigeon#rcount",
                            args: { step: 10 },
                            hertz: 2,
                            autosubscribe: true
                        }
                    ]
                }
            ]
        }"#;

        let config = BridgeConfig::parse(json).unwrap();
        assert_eq!(config.serialization, Format::Cbor);
        assert_eq!(config.plugins.as_deref(), Some(&["king_pigeon".to_string()][..]));

        let unit = &config.units[0];
        assert!(unit.uri.is_none());
        assert_eq!(unit.verb_prefix(), "kp");
        assert_eq!(unit.autostart, Autostart::Required);

        let sensor = &unit.sensors[0];
        assert_eq!(sensor.args.as_ref().unwrap()["step"], 10);
        assert_eq!(sensor.hertz, Some(2));
        assert!(sensor.autosubscribe);
    }

    #[test]
    fn test_invalid_autostart() {
        let json = r#"{
            units: [{ uid: "a", uri: "tcp://h", autostart: 7, sensors: [] }]
        }"#;
        assert!(matches!(
            BridgeConfig::parse(json),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_validate_empty_units() {
        assert!(BridgeConfig::parse("{ units: [] }").is_err());
    }

    #[test]
    fn test_validate_missing_uri() {
        let json = r#"{
            units: [
                { uid: "a", sensors: [{ uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL" }] }
            ]
        }"#;
        let err = BridgeConfig::parse(json).unwrap_err();
        assert!(err.to_string().contains("no uri"));
    }

    #[test]
    fn test_validate_duplicate_sensor() {
        let json = r#"{
            units: [
                {
                    uid: "a",
                    uri: "tcp://h:502",
                    sensors: [
                        { uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL" },
                        { uid: "s", register: 1, type: "COIL_INPUT", format: "BOOL" }
                    ]
                }
            ]
        }"#;
        let err = BridgeConfig::parse(json).unwrap_err();
        assert!(err.to_string().contains("duplicate sensor"));
    }

    #[test]
    fn test_validate_zero_count() {
        let json = r#"{
            units: [
                {
                    uid: "a",
                    uri: "tcp://h:502",
                    sensors: [{ uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL", count: 0 }]
                }
            ]
        }"#;
        assert!(BridgeConfig::parse(json).is_err());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = BridgeConfig::parse(include_str!("../mbsense.json5")).unwrap();
        assert_eq!(config.units.len(), 3);
        assert_eq!(config.units[1].autostart, Autostart::Required);
    }

    #[test]
    fn test_load_from_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/mbsense.json5");
        let config = BridgeConfig::load_from_file(path).unwrap();
        assert_eq!(config.key_prefix, "mbsense");

        let missing = BridgeConfig::load_from_file("/nonexistent/mbsense.json5");
        assert!(matches!(missing, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_shared_uri_requires_slaveid() {
        let json = r#"{
            uri: "tcp://h:502",
            units: [
                { uid: "a", slaveid: 1, sensors: [{ uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL" }] },
                { uid: "b", sensors: [{ uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL" }] }
            ]
        }"#;
        let err = BridgeConfig::parse(json).unwrap_err();
        assert!(err.to_string().contains("Unit 'b'"));

        // A unit with its own uri may leave the slave id unset.
        let json = r#"{
            uri: "tcp://h:502",
            units: [
                { uid: "a", uri: "tcp://other:502", sensors: [{ uid: "s", register: 0, type: "COIL_INPUT", format: "BOOL" }] }
            ]
        }"#;
        assert!(BridgeConfig::parse(json).is_ok());
    }
}
