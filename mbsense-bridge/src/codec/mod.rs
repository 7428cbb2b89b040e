//! Value codecs: conversions between raw 16-bit words and JSON values.
//!
//! A [`Format`] describes a codec (its id and how many words one value
//! spans) and creates [`Codec`] instances. Each sensor owns the instance it
//! was bound with, so stateful decoders keep their state per sensor.

pub mod builtin;
pub mod king_pigeon;
pub mod r4dcb08;
pub mod raymarine;
pub mod registry;

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};

pub use registry::CodecRegistry;

/// A codec definition registered under a provider.
pub trait Format: Send + Sync {
    /// Format id, matched case-insensitively.
    fn uid(&self) -> &str;

    /// Short description of the decoded value.
    fn info(&self) -> &str;

    /// Number of 16-bit words one value spans.
    fn words(&self) -> usize;

    /// Create the codec bound to one sensor, with the sensor's `args`.
    fn instantiate(&self, args: Option<&Value>) -> Result<Box<dyn Codec>>;
}

/// A codec instance bound to a sensor.
pub trait Codec: Send {
    /// Decode one value from exactly [`Format::words`] words.
    ///
    /// `Ok(None)` means the codec has nothing to report for this sample.
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>>;

    /// Encode one value into exactly [`Format::words`] words.
    fn encode(&self, value: &Value, out: &mut [u16]) -> Result<()> {
        let _ = (value, out);
        Err(Error::Unsupported("codec is decode-only".to_string()))
    }
}

/// Shared handle on a registered format.
pub type FormatRef = Arc<dyn Format>;

/// Read an optional integer argument.
pub(crate) fn int_arg(args: Option<&Value>, name: &str) -> Result<Option<i64>> {
    match args.and_then(|a| a.get(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("argument '{}' must be an integer", name))),
    }
}

/// Read an optional numeric argument.
pub(crate) fn float_arg(args: Option<&Value>, name: &str) -> Result<Option<f64>> {
    match args.and_then(|a| a.get(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("argument '{}' must be a number", name))),
    }
}
