//! Built-in codecs, registered under the empty provider id.

use std::sync::Arc;

use serde_json::Value;

use super::{Codec, Format, FormatRef};
use crate::error::{Error, Result};

/// Provider id of the built-in codecs.
pub const PROVIDER: &str = "";

/// Byte order of a 32-bit float spread over two registers.
///
/// Letters name the bytes of the big-endian IEEE 754 value as they appear on
/// the wire, high byte of the first register first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOrder {
    /// `[AB, CD]`
    Abcd,
    /// `[BA, DC]`: bytes swapped in each register.
    Badc,
    /// `[CD, AB]`: registers swapped.
    Cdab,
    /// `[DC, BA]`: registers and bytes swapped.
    Dcba,
}

impl FloatOrder {
    /// Every order is its own inverse, so one permutation serves both ways.
    fn permute(self, b: [u8; 4]) -> [u8; 4] {
        match self {
            FloatOrder::Abcd => b,
            FloatOrder::Badc => [b[1], b[0], b[3], b[2]],
            FloatOrder::Cdab => [b[2], b[3], b[0], b[1]],
            FloatOrder::Dcba => [b[3], b[2], b[1], b[0]],
        }
    }
}

/// Assemble a 32-bit value from two registers, first register high.
pub fn words_to_u32(words: [u16; 2]) -> u32 {
    (u32::from(words[0]) << 16) | u32::from(words[1])
}

/// Split a 32-bit value into two registers, high half first.
pub fn u32_to_words(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Decode a float stored in `order`.
pub fn words_to_f32(words: [u16; 2], order: FloatOrder) -> f32 {
    let [a, b] = words[0].to_be_bytes();
    let [c, d] = words[1].to_be_bytes();
    f32::from_be_bytes(order.permute([a, b, c, d]))
}

/// Encode a float in `order`.
pub fn f32_to_words(value: f32, order: FloatOrder) -> [u16; 2] {
    let b = order.permute(value.to_be_bytes());
    [
        u16::from_be_bytes([b[0], b[1]]),
        u16::from_be_bytes([b[2], b[3]]),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    /// Two registers widened to 64 bits.
    Int64,
    Float(FloatOrder),
}

/// A stateless built-in codec. It is its own format.
#[derive(Debug, Clone)]
pub struct CoreCodec {
    uid: &'static str,
    kind: Kind,
}

const CORE: [CoreCodec; 10] = [
    CoreCodec { uid: "BOOL", kind: Kind::Bool },
    CoreCodec { uid: "INT16", kind: Kind::Int16 },
    CoreCodec { uid: "UINT16", kind: Kind::Uint16 },
    CoreCodec { uid: "INT32", kind: Kind::Int32 },
    CoreCodec { uid: "UINT32", kind: Kind::Uint32 },
    CoreCodec { uid: "INT64", kind: Kind::Int64 },
    CoreCodec { uid: "FLOAT_ABCD", kind: Kind::Float(FloatOrder::Abcd) },
    CoreCodec { uid: "FLOAT_BADC", kind: Kind::Float(FloatOrder::Badc) },
    CoreCodec { uid: "FLOAT_DCBA", kind: Kind::Float(FloatOrder::Dcba) },
    CoreCodec { uid: "FLOAT_CDAB", kind: Kind::Float(FloatOrder::Cdab) },
];

/// The built-in formats.
pub fn formats() -> Vec<FormatRef> {
    CORE.iter()
        .cloned()
        .map(|c| Arc::new(c) as FormatRef)
        .collect()
}

impl Format for CoreCodec {
    fn uid(&self) -> &str {
        self.uid
    }

    fn info(&self) -> &str {
        match self.kind {
            Kind::Bool => "json_boolean",
            Kind::Float(_) => "json_float",
            _ => "json_integer",
        }
    }

    fn words(&self) -> usize {
        match self.kind {
            Kind::Bool | Kind::Int16 | Kind::Uint16 => 1,
            _ => 2,
        }
    }

    fn instantiate(&self, _args: Option<&Value>) -> Result<Box<dyn Codec>> {
        Ok(Box::new(self.clone()))
    }
}

impl Codec for CoreCodec {
    fn decode(&mut self, words: &[u16]) -> Result<Option<Value>> {
        let pair = || -> Result<[u16; 2]> {
            words
                .get(..2)
                .map(|w| [w[0], w[1]])
                .ok_or_else(|| Error::Format(format!("{} needs 2 words", self.uid)))
        };
        let first = *words
            .first()
            .ok_or_else(|| Error::Format(format!("{} needs 1 word", self.uid)))?;

        let value = match self.kind {
            Kind::Bool => Value::Bool(first != 0),
            Kind::Int16 => Value::from(first as i16),
            Kind::Uint16 => Value::from(first),
            Kind::Int32 => Value::from(words_to_u32(pair()?) as i32),
            Kind::Uint32 => Value::from(words_to_u32(pair()?)),
            Kind::Int64 => Value::from(i64::from(words_to_u32(pair()?) as i32)),
            Kind::Float(order) => Value::from(f64::from(words_to_f32(pair()?, order))),
        };
        Ok(Some(value))
    }

    fn encode(&self, value: &Value, out: &mut [u16]) -> Result<()> {
        if out.len() < self.words() {
            return Err(Error::Format(format!(
                "{} needs {} words",
                self.uid,
                self.words()
            )));
        }

        match self.kind {
            Kind::Bool => {
                let b = value.as_bool().ok_or_else(|| self.mismatch(value))?;
                out[0] = u16::from(b);
            }
            Kind::Int16 => out[0] = self.integer(value, i16::MIN.into(), i16::MAX.into())? as i16 as u16,
            Kind::Uint16 => out[0] = self.integer(value, 0, u16::MAX.into())? as u16,
            Kind::Int32 | Kind::Int64 => {
                let v = self.integer(value, i32::MIN.into(), i32::MAX.into())?;
                out[..2].copy_from_slice(&u32_to_words(v as i32 as u32));
            }
            Kind::Uint32 => {
                let v = self.integer(value, 0, u32::MAX.into())?;
                out[..2].copy_from_slice(&u32_to_words(v as u32));
            }
            Kind::Float(order) => {
                if !value.is_f64() {
                    return Err(self.mismatch(value));
                }
                let v = value.as_f64().ok_or_else(|| self.mismatch(value))?;
                out[..2].copy_from_slice(&f32_to_words(v as f32, order));
            }
        }
        Ok(())
    }
}

impl CoreCodec {
    fn mismatch(&self, value: &Value) -> Error {
        Error::Format(format!("{} expects {}, got {}", self.uid, self.info(), value))
    }

    fn integer(&self, value: &Value, min: i64, max: i64) -> Result<i64> {
        let v = value.as_i64().ok_or_else(|| self.mismatch(value))?;
        if v < min || v > max {
            return Err(Error::Format(format!(
                "{} value {} out of range {}..={}",
                self.uid, v, min, max
            )));
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec(uid: &str) -> Box<dyn Codec> {
        formats()
            .into_iter()
            .find(|f| f.uid() == uid)
            .unwrap()
            .instantiate(None)
            .unwrap()
    }

    fn encode(uid: &str, value: Value) -> Result<Vec<u16>> {
        let mut out = vec![0; 2];
        codec(uid).encode(&value, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_word_pairs() {
        assert_eq!(words_to_u32([0x1234, 0x5678]), 0x1234_5678);
        assert_eq!(u32_to_words(0xDEAD_BEEF), [0xDEAD, 0xBEEF]);
    }

    #[test]
    fn test_float_orders() {
        // 123.456f32 = 0x42F6E979
        let natural = [0x42F6, 0xE979];
        assert!((words_to_f32(natural, FloatOrder::Abcd) - 123.456).abs() < 1e-4);
        assert_eq!(words_to_f32([0xE979, 0x42F6], FloatOrder::Cdab), words_to_f32(natural, FloatOrder::Abcd));
        assert_eq!(words_to_f32([0xF642, 0x79E9], FloatOrder::Badc), words_to_f32(natural, FloatOrder::Abcd));
        assert_eq!(words_to_f32([0x79E9, 0xF642], FloatOrder::Dcba), words_to_f32(natural, FloatOrder::Abcd));

        for order in [FloatOrder::Abcd, FloatOrder::Badc, FloatOrder::Cdab, FloatOrder::Dcba] {
            assert_eq!(words_to_f32(f32_to_words(-2.5, order), order), -2.5);
        }
    }

    #[test]
    fn test_word_counts() {
        let counts: Vec<_> = formats().iter().map(|f| (f.uid().to_string(), f.words())).collect();
        assert!(counts.contains(&("BOOL".to_string(), 1)));
        assert!(counts.contains(&("UINT16".to_string(), 1)));
        assert!(counts.contains(&("INT64".to_string(), 2)));
        assert!(counts.contains(&("FLOAT_CDAB".to_string(), 2)));
    }

    #[test]
    fn test_integer_decoding() {
        assert_eq!(codec("INT16").decode(&[0xFFFF]).unwrap(), Some(json!(-1)));
        assert_eq!(codec("UINT16").decode(&[0xFFFF]).unwrap(), Some(json!(65535)));
        assert_eq!(codec("INT32").decode(&[0xFFFF, 0xFFFE]).unwrap(), Some(json!(-2)));
        assert_eq!(codec("UINT32").decode(&[0xFFFF, 0xFFFE]).unwrap(), Some(json!(4294967294u32)));
        assert_eq!(codec("INT64").decode(&[0x8000, 0x0000]).unwrap(), Some(json!(i32::MIN as i64)));
        assert_eq!(codec("BOOL").decode(&[2]).unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_encode_decode_back() {
        for (uid, value) in [
            ("BOOL", json!(true)),
            ("INT16", json!(-1234)),
            ("UINT16", json!(54321)),
            ("INT32", json!(-70000)),
            ("UINT32", json!(3000000000u32)),
            ("INT64", json!(123456)),
            ("FLOAT_ABCD", json!(21.5)),
            ("FLOAT_DCBA", json!(-0.25)),
        ] {
            let words = encode(uid, value.clone()).unwrap();
            assert_eq!(codec(uid).decode(&words).unwrap(), Some(value), "{}", uid);
        }
    }

    #[test]
    fn test_kind_mismatch() {
        assert!(matches!(encode("BOOL", json!(1)), Err(Error::Format(_))));
        assert!(matches!(encode("INT16", json!(true)), Err(Error::Format(_))));
        assert!(matches!(encode("INT16", json!(1.5)), Err(Error::Format(_))));
        assert!(matches!(encode("FLOAT_ABCD", json!(3)), Err(Error::Format(_))));
        assert!(matches!(encode("FLOAT_ABCD", json!("3.0")), Err(Error::Format(_))));
    }

    #[test]
    fn test_range_checks() {
        assert!(matches!(encode("INT16", json!(40000)), Err(Error::Format(_))));
        assert!(matches!(encode("UINT16", json!(-1)), Err(Error::Format(_))));
        assert!(matches!(encode("UINT32", json!(-1)), Err(Error::Format(_))));
        assert!(matches!(encode("INT64", json!(1i64 << 40)), Err(Error::Format(_))));
    }
}
