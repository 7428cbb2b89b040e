//! Raymarine anemometer: wind direction from a sin/cos pair and wind speed
//! from a pulse counter.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::{Codec, Format, FormatRef, float_arg};
use crate::error::{Error, Result};

pub const PROVIDER: &str = "raymarine-anemometer";

/// Calibrated raw range of the sine channel.
const SIN_RANGE: (f64, f64) = (1450.0, 3270.0);
/// Calibrated raw range of the cosine channel.
const COS_RANGE: (f64, f64) = (1460.0, 3290.0);

/// Distance travelled by the wind per counter pulse, in meters.
const METERS_PER_PULSE: f64 = 1.25;
/// Minimum aggregation window before a speed is reported.
const SPEED_WINDOW: Duration = Duration::from_millis(5000);

pub fn formats() -> Vec<FormatRef> {
    vec![Arc::new(WindDirectionFormat), Arc::new(WindSpeedFormat)]
}

struct WindDirectionFormat;

impl Format for WindDirectionFormat {
    fn uid(&self) -> &str {
        "windDirection"
    }

    fn info(&self) -> &str {
        "json_float(radians)"
    }

    fn words(&self) -> usize {
        2
    }

    fn instantiate(&self, args: Option<&Value>) -> Result<Box<dyn Codec>> {
        let offset_deg = float_arg(args, "offset")?.unwrap_or(0.0);
        Ok(Box::new(WindDirection { offset_deg }))
    }
}

/// Maps the raw sine/cosine channels to an angle in `[0, 2π)`.
struct WindDirection {
    offset_deg: f64,
}

fn normalize(raw: f64, (min, max): (f64, f64)) -> f64 {
    (raw - min) / (max - min) * 2.0 - 1.0
}

impl WindDirection {
    fn angle(&self, sin_raw: u16, cos_raw: u16) -> f64 {
        let sin = normalize(f64::from(sin_raw), SIN_RANGE);
        let cos = normalize(f64::from(cos_raw), COS_RANGE);
        (cos.atan2(sin) + PI + self.offset_deg.to_radians()).rem_euclid(2.0 * PI)
    }
}

impl Codec for WindDirection {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        match words {
            [sin, cos, ..] => Ok(Some(json!({ "windDirection": self.angle(*sin, *cos) }))),
            _ => Err(Error::Format("windDirection needs 2 words".to_string())),
        }
    }
}

struct WindSpeedFormat;

impl Format for WindSpeedFormat {
    fn uid(&self) -> &str {
        "windSpeed"
    }

    fn info(&self) -> &str {
        "json_float(m/s)"
    }

    fn words(&self) -> usize {
        1
    }

    fn instantiate(&self, _args: Option<&Value>) -> Result<Box<dyn Codec>> {
        Ok(Box::new(WindSpeed::default()))
    }
}

/// Averages pulse counts over at least [`SPEED_WINDOW`].
///
/// The first sample starts the window. Each later sample adds the pulses
/// counted since the previous one and the time elapsed; once the window is
/// long enough the average speed is reported and the window restarts.
#[derive(Debug, Default)]
pub struct WindSpeed {
    last: Option<(u16, Instant)>,
    pulses: u64,
    elapsed: Duration,
}

impl WindSpeed {
    /// Feed one counter sample taken at `now`; returns the speed in m/s when
    /// a window completes.
    pub fn observe(&mut self, count: u16, now: Instant) -> Option<f64> {
        let (previous, since) = self.last.replace((count, now))?;
        self.pulses += u64::from(count.wrapping_sub(previous));
        self.elapsed += now.saturating_duration_since(since);

        if self.elapsed < SPEED_WINDOW {
            return None;
        }

        let speed = self.pulses as f64 * METERS_PER_PULSE / self.elapsed.as_secs_f64();
        self.pulses = 0;
        self.elapsed = Duration::ZERO;
        Some(speed)
    }
}

impl Codec for WindSpeed {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        let count = *words
            .first()
            .ok_or_else(|| Error::Format("windSpeed needs 1 word".to_string()))?;
        Ok(self
            .observe(count, Instant::now())
            .map(|speed| json!({ "windSpeed": speed })))
    }
}
