//! Serial Transport Module
//!
//! The router sits behind a single serial line. This module splits it into a
//! buffered read half and a write half, each behind its own async lock. The
//! read half is either borrowed per call by the command exchange or held for
//! the lifetime of the event stream; the write half is shared by both.
//!
//! The line can be a local serial port, opened 8N1 without flow control, or a
//! TCP serial bridge (`tcp://host:port`). Anything that is
//! `AsyncRead + AsyncWrite` works, which is how the tests drive the hub over
//! in-memory pipes.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use hbus_protocol::{decode_buf, Decoded, ResponseFrame, READ_BUFFER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits,
};
use tracing::{debug, trace};

/// Default line speed of the router.
pub const DEFAULT_BAUD: u32 = 19200;

/// Boxed read half of the line.
type LineReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of the line.
type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ============================================================================
// Read Half
// ============================================================================

/// Buffered read half of the serial line.
///
/// All reads go through an internal buffer, so a read abandoned by a
/// timeout or a cancelled task never loses bytes: whatever arrived stays
/// buffered for the next reader.
pub struct BusReader {
    inner: LineReader,
    buf: BytesMut,
}

impl BusReader {
    /// Wrap a read half.
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        BusReader {
            inner: Box::new(inner),
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Read whatever the line has into the buffer.
    ///
    /// End of stream is reported as `UnexpectedEof`: the router never closes
    /// the line on its own.
    async fn fill(&mut self) -> io::Result<usize> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial line closed",
            ));
        }
        trace!("Bus: read {} bytes, {} buffered", n, self.buf.len());
        Ok(n)
    }

    /// Wait until at least one byte is buffered, consuming nothing.
    ///
    /// Safe to cancel: a byte that arrives stays in the buffer.
    pub async fn wait_readable(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(())
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Ok(self.buf.split_to(n).to_vec())
    }

    /// Read a single byte.
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.get_u8())
    }

    /// Put bytes back at the front of the buffer.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.buf.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.buf);
        self.buf = merged;
    }

    /// Read the next checksum-valid frame.
    ///
    /// Returns the frame together with the number of resync steps taken to
    /// reach it. Invalid bytes are dropped here and never surface.
    pub async fn next_frame(&mut self) -> io::Result<(ResponseFrame, usize)> {
        let mut resyncs = 0;
        loop {
            match decode_buf(&mut self.buf) {
                Decoded::Frame(frame) => return Ok((frame, resyncs)),
                Decoded::Resync { discarded, cause } => {
                    debug!("Bus: resync, dropped {} bytes ({})", discarded, cause);
                    resyncs += 1;
                }
                Decoded::NeedMore => {
                    self.fill().await?;
                }
            }
        }
    }

    /// Number of bytes received but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop every buffered byte, returning how many there were.
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }
}

impl std::fmt::Debug for BusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusReader")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Write Half
// ============================================================================

/// Write half of the serial line.
pub struct BusWriter {
    inner: LineWriter,
}

impl BusWriter {
    /// Wrap a write half.
    pub fn new(inner: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        BusWriter {
            inner: Box::new(inner),
        }
    }

    /// Write one encoded frame and flush it onto the line.
    pub async fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }
}

// ============================================================================
// Shared Line
// ============================================================================

/// The shared serial line.
///
/// Cloning is cheap and every clone refers to the same line.
#[derive(Clone)]
pub struct SerialBus {
    reader: Arc<Mutex<BusReader>>,
    writer: Arc<Mutex<BusWriter>>,
}

impl SerialBus {
    /// Build a bus from a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_halves(read_half, write_half)
    }

    /// Build a bus from separate read and write halves.
    pub fn from_halves(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        SerialBus {
            reader: Arc::new(Mutex::new(BusReader::new(reader))),
            writer: Arc::new(Mutex::new(BusWriter::new(writer))),
        }
    }

    /// Open a bus endpoint.
    ///
    /// `tcp://host:port` connects to a serial-over-TCP bridge and ignores
    /// `baud`; anything else is opened as a serial port. Bytes the port
    /// received before opening are discarded.
    pub async fn open(endpoint: &str, baud: u32) -> io::Result<Self> {
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            debug!("Bus: connected to serial bridge {}", addr);
            return Ok(Self::new(stream));
        }
        let port = tokio_serial::new(endpoint, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(serial_error)?;
        port.clear(ClearBuffer::Input).map_err(serial_error)?;
        debug!("Bus: opened {} at {} baud", endpoint, baud);
        Ok(Self::new(port))
    }

    /// Write one encoded frame.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_frame(bytes).await
    }

    /// Borrow the read half.
    pub async fn lock_reader(&self) -> tokio::sync::MutexGuard<'_, BusReader> {
        self.reader.lock().await
    }

    /// Take the read half for a long-lived owner.
    pub async fn lock_reader_owned(&self) -> OwnedMutexGuard<BusReader> {
        self.reader.clone().lock_owned().await
    }

    /// Whether someone currently holds the read half.
    pub fn reader_busy(&self) -> bool {
        self.reader.try_lock().is_err()
    }
}

fn serial_error(e: tokio_serial::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl std::fmt::Debug for SerialBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBus")
            .field("reader_busy", &self.reader_busy())
            .finish()
    }
}
