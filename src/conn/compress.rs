use std::io::{Read, Write};

use bytes::{Buf, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};

use super::transport::Transport;
use super::{ConnError, SequenceState, SEQ_RESET_ON_READ, SEQ_RESET_ON_WRITE};

/// Frames below this size are sent as-is; compressing them would grow them.
const MIN_COMPRESS_LEN: usize = 128;

/// Cap on buffered packet-layer bytes per frame. The frame's payload-length
/// field is a u24 and deflate may expand incompressible input, so the cap
/// stays well under 2^24 - 1.
const MAX_PENDING_LEN: usize = (1 << 23) - 1;

const FRAME_HEADER_LEN: usize = 7;

fn read_len3(b: &[u8]) -> usize {
    b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16
}

fn write_len3(b: &mut [u8], n: usize) {
    b[0] = n as u8;
    b[1] = (n >> 8) as u8;
    b[2] = (n >> 16) as u8;
}

/// Read side of the compressed-protocol framing: decompresses one frame at a
/// time and serves the packet layer from the decoded buffer.
pub(crate) struct CompressedReader {
    inner: BufReader<ReadHalf<Transport>>,
    buf: BytesMut,
    pub(crate) state: SequenceState,
}

impl CompressedReader {
    pub(crate) fn new(inner: BufReader<ReadHalf<Transport>>, state: SequenceState) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            state,
        }
    }

    pub(crate) async fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), ConnError> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.buf.is_empty() {
                self.load_frame().await?;
                continue;
            }
            let n = self.buf.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            filled += n;
        }
        Ok(())
    }

    async fn load_frame(&mut self) -> Result<(), ConnError> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        self.inner.read_exact(&mut head).await?;
        // Sampled after the header arrives; the peer direction may set the
        // flag while this read is parked.
        self.state.apply_reset(SEQ_RESET_ON_READ);

        let payload_len = read_len3(&head[0..3]);
        let sequence = head[3];
        let uncompressed_len = read_len3(&head[4..7]);

        let expected = self.state.get();
        if sequence != expected {
            return Err(ConnError::SequenceMismatch {
                expected,
                got: sequence,
            });
        }

        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload).await?;

        if uncompressed_len == 0 {
            // Payload carries packet-layer bytes verbatim.
            self.buf.extend_from_slice(&payload);
        } else {
            let mut decoded = Vec::with_capacity(uncompressed_len);
            ZlibDecoder::new(&payload[..]).read_to_end(&mut decoded)?;
            if decoded.len() != uncompressed_len {
                return Err(ConnError::UncompressedLengthMismatch {
                    expected: uncompressed_len,
                    got: decoded.len(),
                });
            }
            self.buf.extend_from_slice(&decoded);
        }

        self.state.advance();
        Ok(())
    }
}

/// Write side of the compressed-protocol framing: collects packet-layer
/// bytes and emits one frame per flush.
pub(crate) struct CompressedWriter {
    inner: BufWriter<WriteHalf<Transport>>,
    pending: BytesMut,
    pub(crate) state: SequenceState,
}

impl CompressedWriter {
    pub(crate) fn new(inner: BufWriter<WriteHalf<Transport>>, state: SequenceState) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            state,
        }
    }

    pub(crate) async fn write_all(&mut self, mut data: &[u8]) -> Result<(), ConnError> {
        while !data.is_empty() {
            let capacity = MAX_PENDING_LEN - self.pending.len();
            if capacity >= data.len() {
                self.pending.extend_from_slice(data);
                return Ok(());
            }
            self.pending.extend_from_slice(&data[..capacity]);
            self.flush_frame().await?;
            data = &data[capacity..];
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), ConnError> {
        if self.pending.is_empty() {
            self.inner.flush().await?;
            return Ok(());
        }
        self.flush_frame().await
    }

    async fn flush_frame(&mut self) -> Result<(), ConnError> {
        self.state.apply_reset(SEQ_RESET_ON_WRITE);

        let mut head = [0u8; FRAME_HEADER_LEN];
        let compressed;
        let payload: &[u8] = if self.pending.len() < MIN_COMPRESS_LEN {
            write_len3(&mut head[0..3], self.pending.len());
            write_len3(&mut head[4..7], 0);
            &self.pending
        } else {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.pending)?;
            compressed = encoder.finish()?;
            write_len3(&mut head[0..3], compressed.len());
            write_len3(&mut head[4..7], self.pending.len());
            &compressed
        };
        head[3] = self.state.advance();

        self.inner.write_all(&head).await?;
        self.inner.write_all(payload).await?;
        self.pending.clear();
        self.inner.flush().await?;
        Ok(())
    }
}
