//! Message frame construction and parsing
//!
//! Request payload: `[slave address, command id, data length, data...]`
//!
//! Response payload: `[slave address, command id, slave state, data length, data...]`

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use super::{ProtocolError, SlaveState, MAX_COMMAND_DATA_LEN, RESEND_COMMAND_ID};

/// Number of header bytes in a response payload
const RESPONSE_HEADER_LEN: usize = 4;

/// A request sent to a slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Address of the slave
    pub slave_address: u8,
    /// Command to execute
    pub command_id: u8,
    /// Command parameters
    pub command_data: Vec<u8>,
}

impl RequestFrame {
    /// Create a new request
    pub fn new(slave_address: u8, command_id: u8, command_data: Vec<u8>) -> Self {
        Self {
            slave_address,
            command_id,
            command_data,
        }
    }

    /// Request asking `slave_address` to retransmit its last response
    pub fn resend(slave_address: u8) -> Self {
        Self::new(slave_address, RESEND_COMMAND_ID, Vec::new())
    }

    /// Encode the request payload
    ///
    /// Fails with [`ProtocolError::DataTooLong`] if the data does not fit the length byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = data_length(&self.command_data)?;

        let mut bytes = Vec::with_capacity(3 + self.command_data.len());
        bytes.push(self.slave_address);
        bytes.push(self.command_id);
        bytes.push(len);
        bytes.extend_from_slice(&self.command_data);
        Ok(bytes)
    }
}

/// A validated-length response from a slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Address of the responding slave
    pub slave_address: u8,
    /// Command the response belongs to
    pub command_id: u8,
    /// Execution state reported by the slave
    pub slave_state: SlaveState,
    /// Response data
    pub command_data: Vec<u8>,
}

impl ResponseFrame {
    /// Decode a response payload, checking the declared data length
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::IncorrectDataLength {
                expected: RESPONSE_HEADER_LEN,
                actual: data.len(),
            });
        }

        let declared = data[3] as usize;
        let command_data = &data[RESPONSE_HEADER_LEN..];
        if declared != command_data.len() {
            return Err(ProtocolError::IncorrectDataLength {
                expected: declared,
                actual: command_data.len(),
            });
        }

        Ok(Self {
            slave_address: data[0],
            command_id: data[1],
            slave_state: SlaveState(data[2]),
            command_data: command_data.to_vec(),
        })
    }

    /// Encode the response payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = data_length(&self.command_data)?;

        let mut bytes = Vec::with_capacity(RESPONSE_HEADER_LEN + self.command_data.len());
        bytes.push(self.slave_address);
        bytes.push(self.command_id);
        bytes.push(self.slave_state.0);
        bytes.push(len);
        bytes.extend_from_slice(&self.command_data);
        Ok(bytes)
    }
}

fn data_length(data: &[u8]) -> Result<u8, ProtocolError> {
    u8::try_from(data.len()).map_err(|_| ProtocolError::DataTooLong {
        len: data.len(),
        max: MAX_COMMAND_DATA_LEN,
    })
}

/// Builder for constructing requests
pub struct RequestBuilder {
    slave_address: u8,
    command_id: u8,
    data: Vec<u8>,
}

impl RequestBuilder {
    /// Create a new request builder
    pub fn new(slave_address: u8, command_id: u8) -> Self {
        Self {
            slave_address,
            command_id,
            data: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.data.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.data.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    /// Build the request
    pub fn build(self) -> RequestFrame {
        RequestFrame::new(self.slave_address, self.command_id, self.data)
    }
}

/// Displays bytes as space separated hex, e.g. `0x7e 0x00 0x7e`
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:#04x}")?;
        }
        Ok(())
    }
}
