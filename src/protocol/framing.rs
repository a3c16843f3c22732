//! Newline-delimited frame extraction for MCP stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length to
//! prevent memory exhaustion caused by unterminated or maliciously large
//! messages from a misbehaving peer process.
//!
//! Two faces over one implementation:
//!
//! - [`LineFrameCodec`] is a [`Decoder`] for
//!   [`tokio_util::codec::FramedRead`], used by the transport's read task.
//! - [`FrameAssembler`] is a push-style buffer for callers that hold raw
//!   chunks in hand (the proxy's inspection path): [`FrameAssembler::feed`]
//!   accepts an arbitrary slice of the stream and returns every complete
//!   frame, retaining a trailing partial line for the next call. Chunk
//!   boundaries are invisible: any partition of the same bytes yields the
//!   same frames.
//!
//! Empty and whitespace-only lines are discarded at this layer; frame
//! *content* is never judged here — malformed JSON passes through for the
//! codec above to reject.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum frame length accepted on inbound streams: 1 MiB.
///
/// Lines exceeding this limit cause [`LineFrameCodec::decode`] to return
/// [`AppError::Codec`] with `"line too long"`; the remainder of the line is
/// discarded and decoding resumes at the next delimiter.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line-framing decoder for newline-delimited JSON streams.
///
/// Delegates to [`LinesCodec`] with a fixed [`MAX_LINE_BYTES`] limit and
/// skips blank lines instead of yielding them. A trailing `\r` is stripped,
/// so CRLF-delimited peers are tolerated.
#[derive(Debug)]
pub struct LineFrameCodec(LinesCodec);

impl LineFrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFrameCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next non-blank line from `src`.
    ///
    /// Returns `Ok(None)` when `src` holds no complete line yet (buffering).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Codec`]`("line too long: …")` when a line exceeds
    /// [`MAX_LINE_BYTES`]; the stream remains usable and the next call
    /// resumes after the offending delimiter. I/O errors map to
    /// [`AppError::Io`].
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src).map_err(map_codec_error)? {
                Some(line) if line.trim().is_empty() => {}
                other => return Ok(other),
            }
        }
    }

    /// Decode the final unterminated line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src).map_err(map_codec_error)? {
                Some(line) if line.trim().is_empty() => {}
                other => return Ok(other),
            }
        }
    }
}

/// Map a [`LinesCodecError`] to an [`AppError`].
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Codec(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

// ── Push-style assembler ──────────────────────────────────────────────────────

/// Incremental frame assembler for callers that receive raw byte chunks.
///
/// Feed any slice of the stream and collect the complete frames it unlocked;
/// a trailing partial line is retained internally and prefixed to the next
/// chunk. The assembler never rejects input: an oversized line is dropped
/// with a warning (and counted), and everything else — malformed JSON
/// included — is passed through untouched for the JSON-RPC codec to judge.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    codec: LineFrameCodec,
    buf: BytesMut,
    oversized: u64,
}

impl FrameAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every complete frame accumulated so far.
    ///
    /// For any partition of a byte sequence into chunks, the concatenation
    /// of the frames returned by successive calls equals the frames returned
    /// by feeding the whole sequence at once.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) => {
                    self.oversized += 1;
                    warn!(%err, "frame dropped by assembler");
                }
            }
        }
        frames
    }

    /// Drain a trailing unterminated fragment at end of stream, if any.
    ///
    /// Callers decide what to do with it; the transport and proxy drop it,
    /// since a frame without its delimiter was never completed by the peer.
    pub fn finish(&mut self) -> Option<String> {
        match self.codec.decode_eof(&mut self.buf) {
            Ok(tail) => tail,
            Err(err) => {
                self.oversized += 1;
                warn!(%err, "trailing fragment dropped by assembler");
                None
            }
        }
    }

    /// Number of oversized lines dropped so far.
    #[must_use]
    pub fn oversized(&self) -> u64 {
        self.oversized
    }

    /// Number of bytes currently buffered awaiting a delimiter.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
