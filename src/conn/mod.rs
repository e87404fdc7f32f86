//! Packet-framed MySQL connections.
//!
//! A [`PacketConn`] wraps a [`Transport`] with the 4-byte-header wire
//! framing: payload chunking at 2^24 - 1 bytes, sequence verification, lazy
//! sequence resets, an optional read deadline and an optional compression
//! layer. During the handshake it is driven whole by one task; for the relay
//! it splits into a [`PacketReader`] and a [`PacketWriter`] that share the
//! sequence counter and reset flags through single-word atomics.

mod compress;
mod transport;

pub use transport::Transport;

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};

use crate::protocol::{DecodeError, DecodePacket, EncodePacket, WireBuf};
use compress::{CompressedReader, CompressedWriter};

/// Maximum payload carried by one wire packet.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

const PACKET_HEADER_LEN: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Zero the sequence counter on the next read.
pub const SEQ_RESET_ON_READ: u8 = 0b01;
/// Zero the sequence counter on the next write.
pub const SEQ_RESET_ON_WRITE: u8 = 0b10;
/// Zero the sequence counter on whichever of read/write happens next.
pub const SEQ_RESET_BOTH: u8 = SEQ_RESET_ON_READ | SEQ_RESET_ON_WRITE;

/// Framed-connection failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid packet sequence {got}, expected {expected}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("compressed frame decodes to {got} bytes, header says {expected}")]
    UncompressedLengthMismatch { expected: usize, got: usize },

    #[error("packet exceeds max allowed size {limit}")]
    PacketTooLarge { limit: u64 },

    #[error("read timed out")]
    ReadTimeout,

    #[error("operation requires an uncompressed connection")]
    CompressionActive,
}

/// Sequence counter plus pending-reset flags, shared between the two halves
/// of a connection (and, separately, between the two halves of its
/// compression layer). One relay direction writes each flag bit and the
/// opposite direction consumes it, so a plain atomic word is enough.
#[derive(Clone)]
pub(crate) struct SequenceState {
    seq: Arc<AtomicU8>,
    reset: Arc<AtomicU8>,
}

impl SequenceState {
    fn new(start: u8) -> Self {
        Self {
            seq: Arc::new(AtomicU8::new(start)),
            reset: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Replace the pending reset flags; a mark overrides any stale flag
    /// left from the relay hand-off. During relay each connection receives
    /// only one kind of mark (on-write from the inbound copier, on-read
    /// from the outbound copier), so the store cannot race.
    fn mark_reset(&self, flags: u8) {
        self.reset.store(flags, Ordering::SeqCst);
    }

    /// Consume `flag` if pending and zero the counter.
    fn apply_reset(&self, flag: u8) {
        if self.reset.fetch_and(!flag, Ordering::SeqCst) & flag != 0 {
            self.seq.store(0, Ordering::SeqCst);
        }
    }

    fn get(&self) -> u8 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Current value, post-incrementing mod 256.
    fn advance(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

enum ReadSource {
    Plain(BufReader<ReadHalf<Transport>>),
    Compressed(CompressedReader),
}

impl ReadSource {
    async fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), ConnError> {
        match self {
            ReadSource::Plain(r) => {
                r.read_exact(dst).await?;
                Ok(())
            }
            ReadSource::Compressed(c) => c.read_exact_into(dst).await,
        }
    }
}

enum WriteSink {
    Plain(BufWriter<WriteHalf<Transport>>),
    Compressed(CompressedWriter),
}

impl WriteSink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnError> {
        match self {
            WriteSink::Plain(w) => {
                w.write_all(data).await?;
                Ok(())
            }
            WriteSink::Compressed(c) => c.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> Result<(), ConnError> {
        match self {
            WriteSink::Plain(w) => {
                w.flush().await?;
                Ok(())
            }
            WriteSink::Compressed(c) => c.flush().await,
        }
    }
}

/// Read half of a framed connection.
pub struct PacketReader {
    src: ReadSource,
    state: SequenceState,
    read_timeout: Option<Duration>,
    max_allowed_packet: u64,
}

impl PacketReader {
    async fn read_exact_timed(&mut self, dst: &mut [u8]) -> Result<(), ConnError> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.src.read_exact_into(dst))
                .await
                .map_err(|_| ConnError::ReadTimeout)?,
            None => self.src.read_exact_into(dst).await,
        }
    }

    /// Read one wire packet, verify its sequence and append the payload to
    /// `out`. Returns the payload length; a length of [`MAX_PAYLOAD_LEN`]
    /// means more partials follow.
    pub async fn read_partial_packet(&mut self, out: &mut BytesMut) -> Result<usize, ConnError> {
        let mut head = [0u8; PACKET_HEADER_LEN];
        self.read_exact_timed(&mut head).await?;
        // Sampled after the header arrives; the peer direction may set the
        // flag while this read is parked.
        self.state.apply_reset(SEQ_RESET_ON_READ);

        let sequence = head[3];
        let expected = self.state.get();
        if sequence != expected {
            return Err(ConnError::SequenceMismatch {
                expected,
                got: sequence,
            });
        }
        self.state.advance();

        let len = head[0] as usize | (head[1] as usize) << 8 | (head[2] as usize) << 16;
        let start = out.len();
        out.resize(start + len, 0);
        self.read_exact_timed(&mut out[start..]).await?;
        Ok(len)
    }

    /// Read a complete logical payload, reassembling chunked packets.
    pub async fn read_packet(&mut self, out: &mut BytesMut) -> Result<(), ConnError> {
        let start = out.len();
        loop {
            let n = self.read_partial_packet(out).await?;
            if (out.len() - start) as u64 > self.max_allowed_packet {
                return Err(ConnError::PacketTooLarge {
                    limit: self.max_allowed_packet,
                });
            }
            if n < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    /// Mark the sequence counter for reset on the next matching operation.
    pub fn set_reset_option(&self, flags: u8) {
        self.state.mark_reset(flags);
        if let ReadSource::Compressed(c) = &self.src {
            c.state.mark_reset(flags);
        }
    }

    /// Read whatever bytes are available, bypassing the packet framing.
    pub(crate) async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        match &mut self.src {
            ReadSource::Plain(r) => Ok(r.read(buf).await?),
            ReadSource::Compressed(_) => Err(ConnError::CompressionActive),
        }
    }
}

/// Write half of a framed connection.
pub struct PacketWriter {
    sink: WriteSink,
    state: SequenceState,
}

impl PacketWriter {
    /// Write one logical payload, chunking at [`MAX_PAYLOAD_LEN`]. An exact
    /// multiple of the chunk size is terminated by a zero-length packet so
    /// the reader can tell the payload is complete.
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), ConnError> {
        self.state.apply_reset(SEQ_RESET_ON_WRITE);

        let mut rest = data;
        loop {
            let chunk = rest.len().min(MAX_PAYLOAD_LEN);
            let head = [
                chunk as u8,
                (chunk >> 8) as u8,
                (chunk >> 16) as u8,
                self.state.advance(),
            ];
            self.sink.write_all(&head).await?;
            self.sink.write_all(&rest[..chunk]).await?;
            rest = &rest[chunk..];
            if chunk < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> Result<(), ConnError> {
        self.sink.flush().await
    }

    /// Mark the sequence counter for reset on the next matching operation.
    pub fn set_reset_option(&self, flags: u8) {
        self.state.mark_reset(flags);
        if let WriteSink::Compressed(c) = &self.sink {
            c.state.mark_reset(flags);
        }
    }

    /// Write bytes bypassing the packet framing.
    pub(crate) async fn write_raw_all(&mut self, data: &[u8]) -> Result<(), ConnError> {
        match &mut self.sink {
            WriteSink::Plain(w) => {
                w.write_all(data).await?;
                Ok(())
            }
            WriteSink::Compressed(_) => Err(ConnError::CompressionActive),
        }
    }
}

/// A framed MySQL connection over a [`Transport`].
pub struct PacketConn {
    reader: PacketReader,
    writer: PacketWriter,
}

impl PacketConn {
    pub fn new(transport: impl Into<Transport>) -> Self {
        Self::resume(transport.into(), 0)
    }

    /// Build a connection whose sequence counter starts at `sequence`. Used
    /// after a TLS upgrade: the byte stream is replaced and the buffers are
    /// fresh, but the protocol's sequence numbering continues.
    pub fn resume(transport: Transport, sequence: u8) -> Self {
        let state = SequenceState::new(sequence);
        let (r, w) = tokio::io::split(transport);
        Self {
            reader: PacketReader {
                src: ReadSource::Plain(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, r)),
                state: state.clone(),
                read_timeout: None,
                max_allowed_packet: u64::MAX,
            },
            writer: PacketWriter {
                sink: WriteSink::Plain(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, w)),
                state,
            },
        }
    }

    /// Flush and tear the framing down, returning the underlying transport
    /// and the current sequence counter. Fails if compression is installed.
    pub async fn into_transport(mut self) -> Result<(Transport, u8), ConnError> {
        self.writer.flush().await?;
        let sequence = self.reader.state.get();
        let ReadSource::Plain(r) = self.reader.src else {
            return Err(ConnError::CompressionActive);
        };
        let WriteSink::Plain(w) = self.writer.sink else {
            return Err(ConnError::CompressionActive);
        };
        Ok((r.into_inner().unsplit(w.into_inner()), sequence))
    }

    /// Install the compressed-protocol layer. Replaces the plain buffered
    /// reader/writer; calling it on an already-compressed connection is a
    /// no-op.
    pub fn enable_compression(mut self) -> Self {
        let state = SequenceState::new(0);
        self.reader.src = match self.reader.src {
            ReadSource::Plain(r) => {
                ReadSource::Compressed(CompressedReader::new(r, state.clone()))
            }
            src => src,
        };
        self.writer.sink = match self.writer.sink {
            WriteSink::Plain(w) => WriteSink::Compressed(CompressedWriter::new(w, state)),
            sink => sink,
        };
        self
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.reader.read_timeout = timeout;
    }

    pub fn set_max_allowed_packet(&mut self, limit: u64) {
        self.reader.max_allowed_packet = limit;
    }

    /// Mark the sequence counter for reset on the next matching operation.
    pub fn set_reset_option(&self, flags: u8) {
        self.reader.set_reset_option(flags);
        self.writer.set_reset_option(flags);
    }

    pub async fn read_partial_packet(&mut self, out: &mut BytesMut) -> Result<usize, ConnError> {
        self.reader.read_partial_packet(out).await
    }

    pub async fn read_packet(&mut self, out: &mut BytesMut) -> Result<(), ConnError> {
        self.reader.read_packet(out).await
    }

    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), ConnError> {
        self.writer.write_packet(data).await
    }

    pub async fn flush(&mut self) -> Result<(), ConnError> {
        self.writer.flush().await
    }

    /// Encode, write and flush one packet.
    pub async fn send_packet(&mut self, pkt: &impl EncodePacket) -> Result<(), ConnError> {
        let mut b = WireBuf::new();
        pkt.encode(&mut b);
        self.write_packet(b.as_slice()).await?;
        self.flush().await
    }

    /// Read and decode one packet.
    pub async fn recv_packet<P: DecodePacket>(&mut self) -> Result<P, ConnError> {
        let mut payload = BytesMut::new();
        self.read_packet(&mut payload).await?;
        let mut b = WireBuf::from_bytes(payload);
        Ok(P::decode(&mut b)?)
    }

    /// Split into independently owned halves for the relay phase.
    pub fn split(self) -> (PacketReader, PacketWriter) {
        (self.reader, self.writer)
    }
}
