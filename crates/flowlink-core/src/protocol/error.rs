//! Protocol errors

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::NO_ERROR_STATE;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Port is busy")]
    PortBusy,

    #[error("No complete response after {waited:?} ({received} bytes received)")]
    NoResponseTimeout { waited: Duration, received: usize },

    #[error("Checksum invalid: expected {expected:#04x}, got {}", received_checksum(.actual))]
    ChecksumInvalid { expected: u8, actual: Option<u8> },

    #[error("Data length {expected} does not match data length received {actual}")]
    IncorrectDataLength { expected: usize, actual: usize },

    #[error("Command data too long: {len} bytes (max {max})")]
    DataTooLong { len: usize, max: usize },

    #[error("Slave address mismatch - {expected:#04x} does not match {actual:#04x}")]
    SlaveAddressMismatch { expected: u8, actual: u8 },

    #[error("Command id mismatch - {expected:#04x} does not match {actual:#04x}")]
    CommandIdMismatch { expected: u8, actual: u8 },

    #[error("Slave reported error: {0}")]
    SlaveState(SlaveState),

    #[error("Port not open")]
    NotOpen,

    #[error("Port already open")]
    AlreadyOpen,

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Request write stalled for {waited:?}")]
    WriteTimeout { waited: Duration },

    #[error("Byte stream closed")]
    StreamClosed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn received_checksum(actual: &Option<u8>) -> String {
    match actual {
        Some(checksum) => format!("{checksum:#04x}"),
        None => "no checksum byte".to_string(),
    }
}

/// How a connection recovers from a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Wait the resend delay, then issue the original command again
    ResendOriginal,
    /// Immediately ask the slave to retransmit its last response
    RequestResend,
}

impl ProtocolError {
    /// Recovery action for this error, or `None` if it must propagate immediately
    pub fn recovery(&self) -> Option<Recovery> {
        match self {
            ProtocolError::ChecksumInvalid { .. } | ProtocolError::IncorrectDataLength { .. } => {
                Some(Recovery::RequestResend)
            }
            ProtocolError::PortBusy
            | ProtocolError::NoResponseTimeout { .. }
            | ProtocolError::SlaveAddressMismatch { .. }
            | ProtocolError::CommandIdMismatch { .. }
            | ProtocolError::SlaveState(_) => Some(Recovery::ResendOriginal),
            _ => None,
        }
    }

    /// Whether a connection may retry after this error
    pub fn is_recoverable(&self) -> bool {
        self.recovery().is_some()
    }
}

/// State byte reported by the slave with every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveState(pub u8);

impl SlaveState {
    /// Whether the slave executed the command without error
    pub fn is_ok(&self) -> bool {
        self.0 == NO_ERROR_STATE
    }

    /// Human readable cause for the state code
    pub fn message(&self) -> &'static str {
        match self.0 {
            0x00 => "no error",
            0x01 => "wrong data size",
            0x02 => "unknown command",
            0x03 => "no access rights for command",
            0x04 => "invalid parameter",
            0x05 => "wrong checksum",
            0x20 => "sensor busy",
            0x21 => "no ack from sensor",
            0x22 => "i2c crc false",
            0x23 => "sensor timeout",
            0x24 => "no measurement started",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (state {:#04x})", self.message(), self.0)
    }
}
