//! # Gateway Error Handling
//!
//! This module provides the error vocabulary of the gateway engine. Two very
//! different kinds of failure flow through the crate and they are kept apart
//! on purpose:
//!
//! - [`ModbusError`] is the internal library error. Frame decoding, transport
//!   I/O, configuration loading and value conversion return it through
//!   [`ModbusResult`] and `?`.
//! - [`StackStatus`] is the synchronous status every Request Manager call
//!   returns. Nothing in the engine ever raises a `ModbusError` across the
//!   Request Manager boundary; callers only ever see a status code.
//! - [`CompletionStatus`] is what a completion handler receives once a request
//!   leaves the Request Table: a correlated response, a device exception, a
//!   timeout, a shutdown or a transport failure.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket and serial port failures
//! - **Connection Errors**: connection establishment problems
//! - **Timeout Errors**: no response inside the configured window
//!
//! ### Protocol Errors
//! - **Frame Errors**: malformed or truncated frames
//! - **CRC Errors**: checksum failures on the serial line
//! - **Exception Responses**: standard Modbus exception codes from devices
//!
//! ### Data Errors
//! - **Invalid Function**: unsupported function codes
//! - **Invalid Data**: malformed values, hex strings, intents
//!
//! ### System Errors
//! - **Configuration Errors**: unreadable or inconsistent configuration
//! - **Internal Errors**: poisoned locks and similar invariant breaks
//!
//! ## Usage Examples
//!
//! ```rust
//! use voltage_modbus_gateway::{ModbusError, StackStatus};
//!
//! let err = ModbusError::timeout("read holding registers", 80);
//! assert!(err.is_recoverable());
//!
//! let status = StackStatus::MaxRequestsInFlight;
//! assert!(!status.is_success());
//! assert_eq!(status.code(), 2);
//! ```

use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for fallible engine operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Library error type
///
/// Each variant carries enough context to log a useful message; none of them
/// crosses the Request Manager boundary.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    ///
    /// # Examples
    /// - TCP connection reset by peer
    /// - Serial port unplugged
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Connection refused by remote device
    /// - Serial port cannot be opened
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Includes the operation that timed out and the configured window.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid data value
    ///
    /// # Examples
    /// - Hex string with odd length
    /// - Write intent missing a required field
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure on a serial frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unknown point name in the point directory
    #[error("Unknown point: {name}")]
    UnknownPoint { name: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error described by its standard code
    pub fn exception(function: u8, code: u8) -> Self {
        let message = ModbusException::from_u8(code)
            .map_or("Unknown Exception", ModbusException::description)
            .to_string();
        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an unknown point error
    pub fn unknown_point<S: Into<String>>(name: S) -> Self {
        Self::UnknownPoint { name: name.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// ```rust
    /// use voltage_modbus_gateway::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read", 80).is_recoverable());
    /// assert!(!ModbusError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// The specific duration is not known at this point; callers that care build
/// the timeout error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

/// Synchronous status returned by every Request Manager call
///
/// The numeric codes match the exit codes published at the external boundary
/// so a bus adapter can forward them unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackStatus {
    /// Request accepted and queued for dispatch
    Success,
    /// Bad unit id, out-of-range quantity/byte count, missing callback
    InvalidInputParameter,
    /// No free slot in the Request Table
    MaxRequestsInFlight,
    /// Assembled frame is longer than the transport's maximum ADU
    PacketLengthExceeded,
    /// The session refused the entry (draining, or could not be created)
    QueueSendFailed,
    /// Configuration change attempted while the stack is enabled
    StackAlreadyInitialized,
    /// Request issued before `start` or after `shutdown`
    StackNotInitialized,
}

impl StackStatus {
    /// Numeric status code
    pub fn code(self) -> u8 {
        match self {
            StackStatus::Success => 0,
            StackStatus::InvalidInputParameter => 1,
            StackStatus::MaxRequestsInFlight => 2,
            StackStatus::PacketLengthExceeded => 3,
            StackStatus::QueueSendFailed => 4,
            StackStatus::StackAlreadyInitialized => 5,
            StackStatus::StackNotInitialized => 6,
        }
    }

    pub fn is_success(self) -> bool {
        self == StackStatus::Success
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StackStatus::Success => "success",
            StackStatus::InvalidInputParameter => "invalid input parameter",
            StackStatus::MaxRequestsInFlight => "maximum requests in flight",
            StackStatus::PacketLengthExceeded => "packet length exceeded",
            StackStatus::QueueSendFailed => "queue send failed",
            StackStatus::StackAlreadyInitialized => "stack already initialized",
            StackStatus::StackNotInitialized => "stack not initialized",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

/// Outcome delivered to a completion handler
///
/// An exception response is a completed transaction, not an infrastructure
/// failure: it arrives as `Exception(code)` alongside the other outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Normal response correlated to the request
    Success,
    /// Device answered with a Modbus exception code
    Exception(u8),
    /// No response after the configured number of attempts
    Timeout,
    /// Stack shut down while the entry was queued or in flight
    Shutdown,
    /// Transport failed while sending or receiving
    Transport(String),
}

impl CompletionStatus {
    /// Exception code carried by the outcome, 0 if none
    pub fn exception_code(&self) -> u8 {
        match self {
            CompletionStatus::Exception(code) => *code,
            _ => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Exception(code) => write!(f, "exception 0x{:02X}", code),
            CompletionStatus::Timeout => write!(f, "timeout"),
            CompletionStatus::Shutdown => write!(f, "shutdown"),
            CompletionStatus::Transport(message) => write!(f, "transport error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ModbusError::timeout("read_registers", 5000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("data address not available"));
        assert!(ModbusError::exception(0x03, 0x06).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_stack_status_codes() {
        assert_eq!(StackStatus::Success.code(), 0);
        assert_eq!(StackStatus::InvalidInputParameter.code(), 1);
        assert_eq!(StackStatus::MaxRequestsInFlight.code(), 2);
        assert_eq!(StackStatus::PacketLengthExceeded.code(), 3);
        assert_eq!(StackStatus::QueueSendFailed.code(), 4);
        assert!(StackStatus::Success.is_success());
        assert!(format!("{}", StackStatus::QueueSendFailed).contains("queue send failed"));
    }

    #[test]
    fn test_completion_exception_code() {
        assert_eq!(CompletionStatus::Exception(0x02).exception_code(), 0x02);
        assert_eq!(CompletionStatus::Timeout.exception_code(), 0);
        assert!(!CompletionStatus::Shutdown.is_success());
    }
}
