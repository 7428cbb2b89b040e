use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A decoded sensor value pushed to consumers.
///
/// `value` is whatever the sensor's codec produced: a scalar for single
/// element sensors, an array in address order otherwise, or a codec-specific
/// object (`{"windSpeed": 3.2}`, device info records, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Unix epoch milliseconds when the value was emitted.
    pub timestamp: i64,

    /// Unit (RTU) identifier.
    pub unit: String,

    /// Sensor identifier within the unit.
    pub sensor: String,

    /// The decoded value.
    pub value: serde_json::Value,
}

impl SensorEvent {
    /// Create a new event stamped with the current time.
    pub fn new(
        unit: impl Into<String>,
        sensor: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            unit: unit.into(),
            sensor: sensor.into(),
            value,
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
