//! Serial Protocol Communication
//!
//! Implements the framed request/response protocol spoken by the flow sensor.
//!
//! Frames are delimited by terminal bytes, byte-stuffed and protected by a one byte
//! checksum. At most one request is in flight per port.

mod collector;
mod connection;
pub mod encapsulation;
mod error;
mod packet;
mod port;
pub mod serial;
mod stream;

pub use collector::{collect_frame, CollectorTiming, FrameAssembler};
pub use connection::{validate_response, Attempt, AttemptMode, RetryConnection, Step};
pub use encapsulation::{calculate_checksum, decode_frame, encode_frame, escape};
pub use error::{ProtocolError, Recovery, SlaveState};
pub use packet::{HexBytes, RequestBuilder, RequestFrame, ResponseFrame};
pub use port::{Link, Port, StreamPort};
pub use serial::{find_sensor_cable, list_ports, PortInfo, SerialLink, UsbId};
pub use stream::{ByteLog, StreamView};

/// Default baud rate for sensor communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Byte marking the start and the end of every frame
pub const TERMINAL_BYTE: u8 = 0x7E;

/// Byte announcing that the following byte is escaped
pub const ESCAPE_BYTE: u8 = 0x7D;

/// Bytes that never appear unescaped inside a frame body
pub const SPECIAL_BYTES: [u8; 4] = [TERMINAL_BYTE, ESCAPE_BYTE, 0x11, 0x13];

/// Largest data block a single frame can carry, bounded by its one byte length field
pub const MAX_COMMAND_DATA_LEN: usize = u8::MAX as usize;

/// Slave state reported with a successful response
pub const NO_ERROR_STATE: u8 = 0x00;

/// Command asking the slave to retransmit its last response
pub const RESEND_COMMAND_ID: u8 = 0xF2;

/// Maximum silence between two bytes of one frame, in milliseconds
pub const DEFAULT_INTERBYTE_TIMEOUT_MS: u64 = 200;

/// Floor for the overall response deadline, in milliseconds.
/// Non real-time hosts should never wait less than this for a response.
pub const MIN_RESPONSE_TIMEOUT_MS: u64 = 200;

/// Longest a request write may stall before the port gives up, in milliseconds
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 500;

/// Maximum number of errors tolerated within one logical request
pub const DEFAULT_MAX_ERRORS: u32 = 3;

/// Delay before re-issuing the original command, in milliseconds
pub const DEFAULT_RESEND_DELAY_MS: u64 = 100;

/// Number of received bytes a port keeps for replay
pub const DEFAULT_LOG_CAPACITY: usize = 4096;
