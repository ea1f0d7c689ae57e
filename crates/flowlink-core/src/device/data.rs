//! Response data parsing

use byteorder::{BigEndian, ByteOrder};

use super::DeviceError;

/// Widest integer carried in command data
const MAX_INTEGER_BYTES: usize = 8;

/// Parse ASCII text. Only the first NUL is removed; bytes after it are kept.
pub fn parse_string(bytes: &[u8]) -> String {
    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => {
            let mut text = bytes[..nul].to_vec();
            text.extend_from_slice(&bytes[nul + 1..]);
            String::from_utf8_lossy(&text).into_owned()
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Parse a big-endian unsigned integer of up to 8 bytes. No bytes parse as 0.
pub fn parse_unsigned(bytes: &[u8]) -> Result<u64, DeviceError> {
    match bytes.len() {
        0 => Ok(0),
        n if n <= MAX_INTEGER_BYTES => Ok(BigEndian::read_uint(bytes, n)),
        n => Err(DeviceError::IntegerTooWide { len: n }),
    }
}

/// Parse a big-endian two's complement integer of up to 8 bytes. No bytes parse as 0.
pub fn parse_signed(bytes: &[u8]) -> Result<i64, DeviceError> {
    match bytes.len() {
        0 => Ok(0),
        n if n <= MAX_INTEGER_BYTES => Ok(BigEndian::read_int(bytes, n)),
        n => Err(DeviceError::IntegerTooWide { len: n }),
    }
}
