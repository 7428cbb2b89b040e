//! Modbus register polling and codec engine, bridged to Zenoh.
//!
//! Units (RTUs) are reached over serial RTU or TCP links. Each unit exposes
//! sensors: a register range decoded into JSON values by a codec. Sensors
//! can be read and written on request, or subscribed to, in which case they
//! are polled and a value is emitted whenever the raw registers change.
//!
//! # Key Expressions
//!
//! ```text
//! mbsense/<unit>/<sensor>          decoded sensor events
//! mbsense/<verb>/@/cmd             requests ({"action": .., "data": ..})
//! mbsense/<verb>/@/reply           replies
//! mbsense/@/cmd, mbsense/@/reply   global ping and info
//! mbsense/@/status                 bridge status
//! ```
//!
//! Where `<verb>` is `<unit prefix>/<sensor>` or `<unit prefix>/admin`.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod function;
pub mod poller;
pub mod sensor;
pub mod transport;
pub mod unit;

pub use error::{Error, Result};
