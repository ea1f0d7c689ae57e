//! Ports
//!
//! A [`Port`] owns the physical byte channel and exchanges one framed payload for
//! one framed response. At most one exchange is in flight per port; a second caller
//! fails fast with [`ProtocolError::PortBusy`] instead of queuing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument, Span};

use super::{
    collect_frame, decode_frame, encode_frame, ByteLog, CollectorTiming, HexBytes, ProtocolError,
    TERMINAL_BYTE,
};
use crate::config::PortTiming;

/// Size of a single read from the transport
const READ_CHUNK_SIZE: usize = 256;

/// Raw request/response exchange over a physical channel
#[async_trait]
pub trait Port: Send + Sync {
    /// Open the underlying channel
    async fn open(&self) -> Result<(), ProtocolError>;

    /// Close the underlying channel
    async fn close(&self) -> Result<(), ProtocolError>;

    /// Frame and send `payload`, then wait for and unframe the response.
    ///
    /// `response_timeout` is the slave's declared maximum response time.
    async fn transceive(
        &self,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError>;
}

/// Shared port, e.g. several connections over one physical link
#[async_trait]
impl<P: Port + ?Sized> Port for Arc<P> {
    async fn open(&self) -> Result<(), ProtocolError> {
        (**self).open().await
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        (**self).close().await
    }

    async fn transceive(
        &self,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        (**self).transceive(payload, response_timeout).await
    }
}

/// Something a [`StreamPort`] can connect to
#[async_trait]
pub trait Link: Send + Sync {
    /// Byte stream produced by a successful connect
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish the byte stream
    async fn connect(&self) -> Result<Self::Stream, ProtocolError>;

    /// Name used in log output
    fn name(&self) -> String;
}

/// Busy flag guard; clears the flag when dropped, on every exit path
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ProtocolError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard(flag))
            .map_err(|_| ProtocolError::PortBusy)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct OpenState<S> {
    writer: WriteHalf<S>,
    log: ByteLog,
    reader: JoinHandle<()>,
}

/// [`Port`] over any async byte stream produced by a [`Link`]
pub struct StreamPort<L: Link> {
    link: L,
    timing: PortTiming,
    busy: AtomicBool,
    open: Mutex<Option<OpenState<L::Stream>>>,
    span: Span,
}

impl<L: Link> StreamPort<L> {
    /// Create a closed port
    pub fn new(link: L, timing: PortTiming) -> Self {
        let span = info_span!("port", name = %link.name());
        Self::with_span(link, timing, span)
    }

    /// Create a closed port logging into `span`
    pub fn with_span(link: L, timing: PortTiming, span: Span) -> Self {
        Self {
            link,
            timing,
            busy: AtomicBool::new(false),
            open: Mutex::new(None),
            span,
        }
    }

    /// Whether a transceive is currently in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the port is open
    pub async fn is_open(&self) -> bool {
        self.open.lock().await.is_some()
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        let mut open = self.open.lock().await;
        if open.is_some() {
            return Err(ProtocolError::AlreadyOpen);
        }

        let stream = self.link.connect().await?;
        let (reader, writer) = split(stream);
        let log = ByteLog::new(self.timing.log_capacity);
        let reader = tokio::spawn(read_into_log(reader, log.clone()).in_current_span());

        *open = Some(OpenState {
            writer,
            log,
            reader,
        });
        debug!("opened");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        let mut state = self.open.lock().await.take().ok_or(ProtocolError::NotOpen)?;
        state.reader.abort();
        state.log.close();
        match timeout(self.timing.write_timeout(), state.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "shutdown failed"),
            Err(_) => debug!("shutdown stalled"),
        }
        debug!("closed");
        Ok(())
    }

    async fn exchange(
        &self,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let encoded = encode_frame(payload);

        // Observe the stream before writing so a fast response is not missed
        let mut view = {
            let mut open = self.open.lock().await;
            let state = open.as_mut().ok_or(ProtocolError::NotOpen)?;
            let view = state.log.view();
            debug!(frame = %HexBytes(&encoded), "write");
            let waited = self.timing.write_timeout();
            let write = async {
                state.writer.write_all(&encoded).await?;
                state.writer.flush().await
            };
            timeout(waited, write)
                .await
                .map_err(|_| ProtocolError::WriteTimeout { waited })??;
            view
        };

        let timing = CollectorTiming {
            response_timeout: self.timing.response_deadline(response_timeout),
            interbyte_timeout: self.timing.interbyte_timeout(),
        };
        let raw = collect_frame(&mut view, TERMINAL_BYTE, timing).await?;
        decode_frame(&raw)
    }
}

async fn read_into_log<R: AsyncRead + Unpin>(mut reader: R, log: ByteLog) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("byte stream ended");
                break;
            }
            Ok(n) => log.append(&buf[..n]),
            Err(e) => {
                warn!(error = %e, "read failed");
                break;
            }
        }
    }
    log.close();
}

#[async_trait]
impl<L: Link> Port for StreamPort<L> {
    async fn open(&self) -> Result<(), ProtocolError> {
        self.connect().instrument(self.span.clone()).await
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.disconnect().instrument(self.span.clone()).await
    }

    async fn transceive(
        &self,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.exchange(payload, response_timeout)
            .instrument(self.span.clone())
            .await
    }
}

impl<L: Link> Drop for StreamPort<L> {
    fn drop(&mut self) {
        if let Some(state) = self.open.get_mut().take() {
            state.reader.abort();
            state.log.close();
        }
    }
}
