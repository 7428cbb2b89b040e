//! Register functions: how a sensor's address range maps to wire requests.

use std::borrow::Cow;

use tokio_modbus::prelude::{Request, Response};

use crate::error::{Error, Result};
use crate::transport::TransportScope;

/// Maximum bits in one read request.
pub const MAX_READ_BITS: usize = 2000;
/// Maximum registers in one read request.
pub const MAX_READ_REGISTERS: usize = 125;
/// Maximum coils in one write request.
pub const MAX_WRITE_BITS: usize = 1968;
/// Maximum registers in one write request.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Modbus register classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterFunction {
    /// Discrete inputs (read-only, 1-bit)
    CoilInput,
    /// Coils (read/write, 1-bit)
    CoilHolding,
    /// Input registers (read-only, 16-bit)
    RegisterInput,
    /// Holding registers (read/write, 16-bit)
    RegisterHolding,
}

impl RegisterFunction {
    pub const ALL: [RegisterFunction; 4] = [
        RegisterFunction::CoilInput,
        RegisterFunction::CoilHolding,
        RegisterFunction::RegisterInput,
        RegisterFunction::RegisterHolding,
    ];

    /// Find a function by id, ignoring case.
    pub fn lookup(uid: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.uid().eq_ignore_ascii_case(uid))
            .ok_or_else(|| Error::Lookup(format!("unknown register type '{}'", uid)))
    }

    pub fn uid(&self) -> &'static str {
        match self {
            RegisterFunction::CoilInput => "COIL_INPUT",
            RegisterFunction::CoilHolding => "COIL_HOLDING",
            RegisterFunction::RegisterInput => "REGISTER_INPUT",
            RegisterFunction::RegisterHolding => "REGISTER_HOLDING",
        }
    }

    pub fn info(&self) -> &'static str {
        match self {
            RegisterFunction::CoilInput => "Boolean ReadOnly register",
            RegisterFunction::CoilHolding => "Boolean ReadWrite register",
            RegisterFunction::RegisterInput => "INT16 ReadOnly register",
            RegisterFunction::RegisterHolding => "INT16 ReadWrite register",
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(
            self,
            RegisterFunction::CoilInput | RegisterFunction::CoilHolding
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            RegisterFunction::CoilHolding | RegisterFunction::RegisterHolding
        )
    }

    /// Check that a range of `words` wire units fits in one request.
    pub fn validate_count(&self, words: usize) -> Result<()> {
        let (read_max, write_max) = if self.is_bit() {
            (MAX_READ_BITS, MAX_WRITE_BITS)
        } else {
            (MAX_READ_REGISTERS, MAX_WRITE_REGISTERS)
        };
        if words == 0 || words > read_max {
            return Err(Error::Config(format!(
                "{} cannot read {} units in one request (max {})",
                self.uid(),
                words,
                read_max
            )));
        }
        if self.is_writable() && words > write_max {
            return Err(Error::Config(format!(
                "{} cannot write {} units in one request (max {})",
                self.uid(),
                words,
                write_max
            )));
        }
        Ok(())
    }

    /// Read `count` units starting at `address`. Bits are returned one per
    /// word as 0 or 1.
    pub async fn read(
        &self,
        scope: &mut TransportScope<'_>,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = match self {
            RegisterFunction::CoilInput => Request::ReadDiscreteInputs(address, count),
            RegisterFunction::CoilHolding => Request::ReadCoils(address, count),
            RegisterFunction::RegisterInput => Request::ReadInputRegisters(address, count),
            RegisterFunction::RegisterHolding => Request::ReadHoldingRegisters(address, count),
        };

        let mut words = match scope.call(request).await? {
            Response::ReadDiscreteInputs(bits) | Response::ReadCoils(bits) => {
                bits.into_iter().map(u16::from).collect::<Vec<_>>()
            }
            Response::ReadInputRegisters(regs) | Response::ReadHoldingRegisters(regs) => regs,
            other => {
                return Err(Error::Connection(format!(
                    "unexpected reply to {}: {:?}",
                    self.uid(),
                    other
                )));
            }
        };

        // Bit replies are padded to whole bytes.
        if words.len() < count as usize {
            return Err(Error::Connection(format!(
                "short reply: {} of {} units",
                words.len(),
                count
            )));
        }
        words.truncate(count as usize);
        Ok(words)
    }

    /// Write `words` starting at `address`, with the single-value request
    /// when there is exactly one unit to write.
    pub async fn write(
        &self,
        scope: &mut TransportScope<'_>,
        address: u16,
        words: &[u16],
    ) -> Result<()> {
        let request = match (self, words) {
            (RegisterFunction::CoilHolding, [word]) => Request::WriteSingleCoil(address, *word != 0),
            (RegisterFunction::CoilHolding, _) => Request::WriteMultipleCoils(
                address,
                Cow::Owned(words.iter().map(|w| *w != 0).collect()),
            ),
            (RegisterFunction::RegisterHolding, [word]) => {
                Request::WriteSingleRegister(address, *word)
            }
            (RegisterFunction::RegisterHolding, _) => {
                Request::WriteMultipleRegisters(address, Cow::Owned(words.to_vec()))
            }
            _ => {
                return Err(Error::Unsupported(format!(
                    "{} is read-only",
                    self.uid()
                )));
            }
        };

        match scope.call(request).await? {
            Response::WriteSingleCoil(..)
            | Response::WriteMultipleCoils(..)
            | Response::WriteSingleRegister(..)
            | Response::WriteMultipleRegisters(..) => Ok(()),
            other => Err(Error::Connection(format!(
                "unexpected reply to {} write: {:?}",
                self.uid(),
                other
            ))),
        }
    }
}
