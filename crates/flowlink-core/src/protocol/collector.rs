//! Response collection
//!
//! Assembles the next complete raw frame from a [`StreamView`] under two deadlines:
//! an overall response deadline, and an inter-byte deadline that is armed once the
//! first byte arrives and re-armed by every following byte.

use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::{HexBytes, ProtocolError, StreamView};

/// Deadlines applied while collecting one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorTiming {
    /// Bound on the whole wait, regardless of progress
    pub response_timeout: Duration,
    /// Bound on the silence between two bytes once a byte has been seen
    pub interbyte_timeout: Duration,
}

/// Accumulates bytes until they form a frame delimited by terminal bytes
#[derive(Debug)]
pub struct FrameAssembler {
    terminal: u8,
    bytes: Vec<u8>,
    /// Number of non-terminal bytes since the last terminal
    body_len: usize,
}

impl FrameAssembler {
    /// Create an assembler for frames delimited by `terminal`
    pub fn new(terminal: u8) -> Self {
        Self {
            terminal,
            bytes: Vec::new(),
            body_len: 0,
        }
    }

    /// Feed one byte. Returns the raw frame, terminals included, once it is complete.
    ///
    /// A terminal byte closes the frame only when a body precedes it; a terminal
    /// after nothing but terminals starts the frame afresh.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte != self.terminal {
            self.bytes.push(byte);
            self.body_len += 1;
            return None;
        }

        if self.body_len == 0 {
            self.bytes.clear();
            self.bytes.push(byte);
            return None;
        }

        self.bytes.push(byte);
        self.body_len = 0;
        Some(std::mem::take(&mut self.bytes))
    }

    /// Bytes accumulated towards the current frame
    pub fn pending(&self) -> &[u8] {
        &self.bytes
    }
}

/// Wait for the next complete frame delimited by `terminal`.
///
/// Fails with [`ProtocolError::NoResponseTimeout`] when either deadline fires, and
/// with [`ProtocolError::StreamClosed`] when the byte source ends first.
pub async fn collect_frame(
    view: &mut StreamView,
    terminal: u8,
    timing: CollectorTiming,
) -> Result<Vec<u8>, ProtocolError> {
    let started = Instant::now();
    let response_deadline = started + timing.response_timeout;
    let mut assembler = FrameAssembler::new(terminal);
    let mut received = 0usize;
    let mut last_byte: Option<Instant> = None;

    loop {
        let deadline = match last_byte {
            Some(at) => response_deadline.min(at + timing.interbyte_timeout),
            None => response_deadline,
        };

        let chunk = match timeout_at(deadline, view.next_chunk()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Err(ProtocolError::StreamClosed),
            Err(_) => {
                let waited = started.elapsed();
                info!(
                    ?waited,
                    received,
                    pending = %HexBytes(assembler.pending()),
                    "timeout during response collection"
                );
                return Err(ProtocolError::NoResponseTimeout { waited, received });
            }
        };

        last_byte = Some(Instant::now());
        received += chunk.len();
        for (i, &byte) in chunk.iter().enumerate() {
            if let Some(frame) = assembler.push(byte) {
                if i + 1 < chunk.len() {
                    debug!(
                        ignored = chunk.len() - i - 1,
                        "bytes after the frame were not consumed"
                    );
                }
                info!(frame = %HexBytes(&frame), "response");
                return Ok(frame);
            }
        }
        debug!(bytes = %HexBytes(assembler.pending()), "partial response");
    }
}
