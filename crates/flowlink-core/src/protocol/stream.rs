//! Received byte history
//!
//! A port appends every byte it receives to a [`ByteLog`]. Each request takes a
//! [`StreamView`]: a read cursor into the log that starts at a chosen offset and
//! sees everything appended after it, including bytes that arrived before anyone
//! started waiting for them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::warn;

struct LogState {
    /// Absolute offset of `bytes[0]`
    base: u64,
    bytes: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

impl LogState {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

fn lock(state: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    // Every mutation leaves the state consistent, so a poisoned lock is still usable
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Append-only log of received bytes with a bounded retained window
#[derive(Clone)]
pub struct ByteLog {
    state: Arc<Mutex<LogState>>,
    /// Bumped on every append and on close
    changed: Arc<watch::Sender<u64>>,
}

impl ByteLog {
    /// Create a log retaining at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (changed, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(LogState {
                base: 0,
                bytes: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            })),
            changed: Arc::new(changed),
        }
    }

    /// Append received bytes, dropping the oldest ones beyond the capacity
    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let end = {
            let mut state = lock(&self.state);
            state.bytes.extend(chunk.iter().copied());
            let excess = state.bytes.len().saturating_sub(state.capacity);
            if excess > 0 {
                state.bytes.drain(..excess);
                state.base += excess as u64;
            }
            state.end()
        };
        self.changed.send_replace(end);
    }

    /// Mark the source as finished. Views drain what is left and then end.
    pub fn close(&self) {
        let end = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.end()
        };
        self.changed.send_replace(end);
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Absolute offset one past the newest byte
    pub fn end(&self) -> u64 {
        lock(&self.state).end()
    }

    /// View observing only bytes appended from now on
    pub fn view(&self) -> StreamView {
        self.view_at(self.end())
    }

    /// View replaying from the absolute `offset`
    pub fn view_at(&self, offset: u64) -> StreamView {
        StreamView {
            state: Arc::clone(&self.state),
            cursor: offset,
            changed: self.changed.subscribe(),
        }
    }
}

/// Read cursor into a [`ByteLog`]. Never mutates the log.
pub struct StreamView {
    state: Arc<Mutex<LogState>>,
    cursor: u64,
    changed: watch::Receiver<u64>,
}

impl StreamView {
    /// Absolute offset of the next byte this view yields
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Take every byte available past the cursor without waiting
    pub fn drain(&mut self) -> Vec<u8> {
        self.drain_inner().0
    }

    fn drain_inner(&mut self) -> (Vec<u8>, bool) {
        let state = lock(&self.state);
        if self.cursor < state.base {
            warn!(
                skipped = state.base - self.cursor,
                "stream view fell behind the retained log"
            );
            self.cursor = state.base;
        }
        let start = ((self.cursor - state.base) as usize).min(state.bytes.len());
        let available: Vec<u8> = state.bytes.range(start..).copied().collect();
        self.cursor += available.len() as u64;
        (available, state.closed)
    }

    /// Wait for the next bytes past the cursor.
    ///
    /// Returns `None` once the log is closed and nothing is left to read.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            self.changed.borrow_and_update();
            let (chunk, closed) = self.drain_inner();
            if !chunk.is_empty() {
                return Some(chunk);
            }
            if closed || self.changed.changed().await.is_err() {
                return None;
            }
        }
    }
}
