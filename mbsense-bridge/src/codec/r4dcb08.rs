//! R4DCB08 eight-channel temperature reader.

use std::sync::Arc;

use serde_json::Value;

use super::{Codec, Format, FormatRef};
use crate::error::{Error, Result};

pub const PROVIDER: &str = "r4dcb08_temperature";

const CHANNELS: usize = 8;

/// Register value reported for an unplugged probe.
const PROBE_ABSENT: u16 = 0x8000;

pub fn formats() -> Vec<FormatRef> {
    vec![Arc::new(Temps)]
}

/// Eight temperatures in tenths of a degree, signed.
struct Temps;

impl Format for Temps {
    fn uid(&self) -> &str {
        "temps"
    }

    fn info(&self) -> &str {
        "json_array"
    }

    fn words(&self) -> usize {
        CHANNELS
    }

    fn instantiate(&self, _args: Option<&Value>) -> Result<Box<dyn Codec>> {
        Ok(Box::new(Temps))
    }
}

impl Codec for Temps {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        let channels = words
            .get(..CHANNELS)
            .ok_or_else(|| Error::Format(format!("temps needs {} words", CHANNELS)))?;
        let temps = channels
            .iter()
            .map(|&raw| match raw {
                PROBE_ABSENT => Value::Null,
                _ => Value::from(f64::from(raw as i16) / 10.0),
            })
            .collect();
        Ok(Some(Value::Array(temps)))
    }
}
