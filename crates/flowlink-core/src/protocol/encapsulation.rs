//! Frame encapsulation
//!
//! Wire format:
//! - 1 byte: terminal (0x7E)
//! - N bytes: payload
//! - 1 byte: checksum (complement of the payload sum, modulo 256)
//! - 1 byte: terminal (0x7E)
//!
//! Payload and checksum bytes from [`SPECIAL_BYTES`] are sent as
//! `[ESCAPE_BYTE, escape(byte)]`.

use super::{ProtocolError, ESCAPE_BYTE, SPECIAL_BYTES, TERMINAL_BYTE};

/// Bit flipped to escape a special byte
const ESCAPE_BIT: u8 = 5;

/// Escape (or unescape) a byte by flipping bit 5. Applying it twice is the identity.
pub fn escape(byte: u8) -> u8 {
    byte ^ (1 << ESCAPE_BIT)
}

fn is_special(byte: u8) -> bool {
    SPECIAL_BYTES.contains(&byte)
}

/// Calculate the checksum of a payload
pub fn calculate_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    !sum
}

/// Append the checksum, escape special bytes and wrap the result in terminal bytes
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let checksum = calculate_checksum(payload);

    let mut frame = Vec::with_capacity(2 * payload.len() + 4);
    frame.push(TERMINAL_BYTE);
    for &byte in payload.iter().chain(std::iter::once(&checksum)) {
        if is_special(byte) {
            frame.push(ESCAPE_BYTE);
            frame.push(escape(byte));
        } else {
            frame.push(byte);
        }
    }
    frame.push(TERMINAL_BYTE);
    frame
}

/// Strip terminal bytes, undo escaping and verify the trailing checksum.
///
/// Terminal bytes are removed wherever they occur, so frames that lost their
/// start or stop marker in a lower layer still decode. Returns the payload
/// without the checksum byte.
pub fn decode_frame(received: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut unescaped = Vec::with_capacity(received.len());
    let mut escaped = false;
    for &byte in received.iter().filter(|&&b| b != TERMINAL_BYTE) {
        if escaped {
            unescaped.push(escape(byte));
            escaped = false;
        } else if byte == ESCAPE_BYTE {
            escaped = true;
        } else {
            unescaped.push(byte);
        }
    }

    let received_checksum = unescaped.pop();
    let expected = calculate_checksum(&unescaped);
    match received_checksum {
        Some(actual) if actual == expected => Ok(unescaped),
        actual => Err(ProtocolError::ChecksumInvalid { expected, actual }),
    }
}
