//! King Pigeon I/O modules: device information block and pulse counters.

use std::sync::Arc;

use serde_json::{Value, json};

use super::builtin::words_to_u32;
use super::{Codec, Format, FormatRef, int_arg};
use crate::error::{Error, Result};

pub const PROVIDER: &str = "king_pigeon";

pub fn formats() -> Vec<FormatRef> {
    vec![Arc::new(DevInfo), Arc::new(RCountFormat)]
}

/// Six-register identification block.
struct DevInfo;

impl Format for DevInfo {
    fn uid(&self) -> &str {
        "devinfo"
    }

    fn info(&self) -> &str {
        "json_object"
    }

    fn words(&self) -> usize {
        6
    }

    fn instantiate(&self, _args: Option<&Value>) -> Result<Box<dyn Codec>> {
        Ok(Box::new(DevInfo))
    }
}

impl Codec for DevInfo {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        let [product, lot, serial, online, hardware, firmware] = words
            .get(..6)
            .and_then(|w| <[u16; 6]>::try_from(w).ok())
            .ok_or_else(|| Error::Format("devinfo needs 6 words".to_string()))?;
        Ok(Some(json!({
            "product": product,
            "lot": lot,
            "serial": serial,
            "online": online,
            "hardware": hardware,
            "firmware": firmware,
        })))
    }
}

struct RCountFormat;

impl Format for RCountFormat {
    fn uid(&self) -> &str {
        "rcount"
    }

    fn info(&self) -> &str {
        "json_integer"
    }

    fn words(&self) -> usize {
        2
    }

    fn instantiate(&self, args: Option<&Value>) -> Result<Box<dyn Codec>> {
        let step = match int_arg(args, "step")? {
            None => 1,
            Some(s) => u32::try_from(s)
                .map_err(|_| Error::Config(format!("rcount step {} out of range", s)))?,
        };
        Ok(Box::new(DeltaCounter::new(step)))
    }
}

/// Reports how much a 32-bit counter advanced since the last report.
///
/// The first sample only sets the baseline. Later samples are reported when
/// the counter moved by at least `step` from the baseline; smaller moves are
/// dropped and leave the baseline where it was.
#[derive(Debug)]
pub struct DeltaCounter {
    previous: Option<u32>,
    step: u32,
}

impl DeltaCounter {
    pub fn new(step: u32) -> Self {
        Self {
            previous: None,
            step,
        }
    }

    pub fn baseline(&self) -> Option<u32> {
        self.previous
    }

    /// Feed one counter sample.
    pub fn observe(&mut self, current: u32) -> Option<u32> {
        let Some(previous) = self.previous else {
            self.previous = Some(current);
            return None;
        };
        let delta = current.wrapping_sub(previous);
        if delta < self.step {
            return None;
        }
        self.previous = Some(current);
        Some(delta)
    }
}

impl Codec for DeltaCounter {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        let pair = words
            .get(..2)
            .ok_or_else(|| Error::Format("rcount needs 2 words".to_string()))?;
        Ok(self
            .observe(words_to_u32([pair[0], pair[1]]))
            .map(Value::from))
    }
}
