/// Modbus protocol definitions shared by the request engine
///
/// This module contains function codes, exception codes, the per-function
/// bounds table, unit-id rules and the byte/word order transforms applied to
/// multi-register point values.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus unit identifier
pub type UnitId = u8;

/// Maximum ADU length for Modbus TCP (MBAP header + PDU)
pub const MAX_TCP_ADU: usize = 260;

/// Maximum ADU length for Modbus RTU (unit id + PDU + CRC)
pub const MAX_RTU_ADU: usize = 256;

/// File record reference type (the only one defined by the standard)
pub const FILE_RECORD_REFERENCE_TYPE: u8 = 0x06;

/// Encapsulated interface type for device identification
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Single coil "on" value
pub const COIL_ON: u16 = 0xFF00;

/// Single coil "off" value
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
    /// Write File Record (0x15)
    WriteFileRecord = 0x15,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
    /// Encapsulated Interface Transport, Read Device Identification (0x2B)
    ReadDeviceIdentification = 0x2B,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x14 => Ok(ModbusFunction::ReadFileRecord),
            0x15 => Ok(ModbusFunction::WriteFileRecord),
            0x17 => Ok(ModbusFunction::ReadWriteMultipleRegisters),
            0x2B => Ok(ModbusFunction::ReadDeviceIdentification),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(self,
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteSingleRegister |
            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters |
            ModbusFunction::WriteFileRecord
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReadFileRecord => "Read File Record",
            ModbusFunction::WriteFileRecord => "Write File Record",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            ModbusFunction::ReadDeviceIdentification => "Read Device Identification",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "function code not supported by the device",
            ModbusException::IllegalDataAddress => "data address not available on the device",
            ModbusException::IllegalDataValue => "value in the query data field not allowed",
            ModbusException::ServerDeviceFailure => "unrecoverable error while performing the action",
            ModbusException::Acknowledge => "request accepted, long processing time",
            ModbusException::ServerDeviceBusy => "device busy with a long-duration command",
            ModbusException::MemoryParityError => "parity error reading the record file",
            ModbusException::GatewayPathUnavailable => "gateway could not allocate a path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "no response from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Check a unit id against the addressable range.
///
/// 0 is the broadcast address and never gets a response, 248..=254 are
/// reserved. 255 is accepted since TCP devices commonly answer on it.
pub fn validate_unit_id(unit_id: UnitId) -> ModbusResult<()> {
    match unit_id {
        0 | 248..=254 => Err(ModbusError::invalid_data(format!("Invalid unit id: {}", unit_id))),
        _ => Ok(()),
    }
}

/// Quantity limits of a function code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityBounds {
    pub min: u16,
    pub max: u16,
}

/// Bounds table lookup. `None` for functions that carry no quantity.
pub fn quantity_bounds(function: ModbusFunction) -> Option<QuantityBounds> {
    let (min, max) = match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => (1, 2000),
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => (1, 125),
        ModbusFunction::WriteMultipleCoils => (1, 1968),
        ModbusFunction::WriteMultipleRegisters => (1, 123),
        ModbusFunction::ReadWriteMultipleRegisters => (1, 121),
        ModbusFunction::ReadFileRecord | ModbusFunction::WriteFileRecord => (0x07, 0xF5),
        _ => return None,
    };
    Some(QuantityBounds { min, max })
}

/// Validate quantity and byte count for a function code.
///
/// For 0x14/0x15 the `quantity` is the request byte count. For 0x17 it is
/// the write quantity. Runs before any frame buffer is allocated.
pub fn validate_quantity(function: ModbusFunction, quantity: u16, byte_count: u16) -> ModbusResult<()> {
    let bounds = match quantity_bounds(function) {
        Some(bounds) => bounds,
        None => return Ok(()),
    };

    if quantity < bounds.min || quantity > bounds.max {
        return Err(ModbusError::invalid_data(format!(
            "{}: quantity {} outside {}..={}",
            function, quantity, bounds.min, bounds.max
        )));
    }

    let expected = match function {
        ModbusFunction::WriteMultipleCoils => Some((quantity + 7) / 8),
        ModbusFunction::WriteMultipleRegisters | ModbusFunction::ReadWriteMultipleRegisters => {
            Some(quantity * 2)
        }
        _ => None,
    };

    if let Some(expected) = expected {
        if byte_count == 0 || byte_count != expected {
            return Err(ModbusError::invalid_data(format!(
                "{}: byte count {} does not match quantity {} (expected {})",
                function, byte_count, quantity, expected
            )));
        }
    }

    Ok(())
}

/// Per-point byte order flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Swap the two bytes of every 16-bit register
    #[serde(default)]
    pub byte_swap: bool,
    /// Reverse the order of the 16-bit registers
    #[serde(default)]
    pub word_swap: bool,
}

impl SwapConfig {
    pub fn new(byte_swap: bool, word_swap: bool) -> Self {
        Self { byte_swap, word_swap }
    }

    pub fn is_identity(&self) -> bool {
        !self.byte_swap && !self.word_swap
    }

    /// Device order to big-endian value order.
    ///
    /// Both transforms are involutions, so `apply` and `invert` differ only
    /// in the order they are composed.
    pub fn invert(&self, bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        if self.byte_swap {
            swap_bytes_in_words(&mut out);
        }
        if self.word_swap {
            reverse_words(&mut out);
        }
        out
    }

    /// Big-endian value order to device order, applied before packet assembly
    pub fn apply(&self, bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        if self.word_swap {
            reverse_words(&mut out);
        }
        if self.byte_swap {
            swap_bytes_in_words(&mut out);
        }
        out
    }
}

fn swap_bytes_in_words(bytes: &mut [u8]) {
    for pair in bytes.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

fn reverse_words(bytes: &mut [u8]) {
    let words = bytes.len() / 2;
    for i in 0..words / 2 {
        let j = words - 1 - i;
        bytes.swap(2 * i, 2 * j);
        bytes.swap(2 * i + 1, 2 * j + 1);
    }
}

/// Text value conversions for on-demand writes
pub mod data_utils {
    use super::*;

    /// Map a single-coil text value to its wire value.
    ///
    /// Only the explicit zero spellings switch the coil off.
    pub fn coil_value_from_text(value: &str) -> u16 {
        match value.trim() {
            "0" | "00" | "0x00" | "0X00" => COIL_OFF,
            _ => COIL_ON,
        }
    }
}
