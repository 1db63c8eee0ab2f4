//! Compression layer.
//!
//! Two stream transforms the broker may negotiate, never both at once:
//!
//! - Snappy framing format: a stream identifier chunk followed by compressed
//!   or literal chunks, each carrying a masked CRC-32C of its uncompressed
//!   bytes.
//! - Raw deflate (no zlib header), sync-flushed after every write so the peer
//!   can decode each command as soon as it arrives.
//!
//! Both are sans-IO: bytes in, bytes out. Input may be split at any boundary.

use bytes::{Buf, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{QuayError, Result};

const STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const MAX_UNCOMPRESSED_CHUNK: usize = 65536;

const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;

/// Negotiated compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Snappy,
    /// Deflate at level 1 (fastest) to 9 (smallest)
    Deflate { level: u32 },
}

impl Compression {
    /// Encoder for bytes we send.
    pub fn deflater(self) -> Deflater {
        match self {
            Self::Snappy => Deflater::Snappy(SnappyEncoder::new()),
            Self::Deflate { level } => Deflater::Deflate(Compress::new(
                flate2::Compression::new(level.clamp(1, 9)),
                false,
            )),
        }
    }

    /// Decoder for bytes we receive.
    pub fn inflater(self) -> Inflater {
        match self {
            Self::Snappy => Inflater::Snappy(SnappyDecoder::new()),
            Self::Deflate { .. } => Inflater::Deflate(Decompress::new(false)),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snappy => write!(f, "snappy"),
            Self::Deflate { level } => write!(f, "deflate(level={level})"),
        }
    }
}

/// Outbound transform.
pub enum Deflater {
    Snappy(SnappyEncoder),
    Deflate(Compress),
}

impl Deflater {
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Snappy(enc) => enc.encode(data),
            Self::Deflate(c) => deflate(c, data),
        }
    }
}

/// Inbound transform.
pub enum Inflater {
    Snappy(SnappyDecoder),
    Deflate(Decompress),
}

impl Inflater {
    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Snappy(dec) => dec.decode(data),
            Self::Deflate(d) => inflate(d, data),
        }
    }
}

fn deflate(c: &mut Compress, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut input = data;
    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(1024));
        }
        let before = c.total_in();
        c.compress_vec(input, &mut out, FlushCompress::Sync)
            .map_err(|e| QuayError::compression(e.to_string()))?;
        let consumed = (c.total_in() - before) as usize;
        input = &input[consumed..];

        // flush is complete once input is drained and output had room to spare
        if input.is_empty() && out.len() < out.capacity() {
            return Ok(out);
        }
    }
}

fn inflate(d: &mut Decompress, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4 + 64);
    let mut input = data;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(1024));
        }
        let before_in = d.total_in();
        let before_out = d.total_out();
        let status = d
            .decompress_vec(input, &mut out, FlushDecompress::Sync)
            .map_err(|e| QuayError::compression(e.to_string()))?;
        let consumed = (d.total_in() - before_in) as usize;
        let produced = d.total_out() - before_out;
        input = &input[consumed..];

        match status {
            Status::StreamEnd | Status::BufError => return Ok(out),
            Status::Ok if input.is_empty() && out.len() < out.capacity() => return Ok(out),
            Status::Ok if consumed == 0 && produced == 0 => return Ok(out),
            Status::Ok => {}
        }
    }
}

/// CRC-32C as masked by the snappy framing format.
fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Snappy framing encoder.
pub struct SnappyEncoder {
    encoder: snap::raw::Encoder,
    wrote_identifier: bool,
}

impl SnappyEncoder {
    pub fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            wrote_identifier: false,
        }
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 32);
        if !self.wrote_identifier {
            out.extend_from_slice(STREAM_IDENTIFIER);
            self.wrote_identifier = true;
        }
        for chunk in data.chunks(MAX_UNCOMPRESSED_CHUNK) {
            let compressed = self
                .encoder
                .compress_vec(chunk)
                .map_err(|e| QuayError::compression(e.to_string()))?;
            let (kind, body) = if compressed.len() < chunk.len() {
                (CHUNK_COMPRESSED, compressed.as_slice())
            } else {
                (CHUNK_UNCOMPRESSED, chunk)
            };
            let len = (body.len() + 4) as u32;
            out.push(kind);
            out.extend_from_slice(&len.to_le_bytes()[..3]);
            out.extend_from_slice(&masked_crc(chunk).to_le_bytes());
            out.extend_from_slice(body);
        }
        Ok(out)
    }
}

impl Default for SnappyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Snappy framing decoder. Buffers partial chunks across calls.
pub struct SnappyDecoder {
    decoder: snap::raw::Decoder,
    buf: BytesMut,
    seen_identifier: bool,
}

impl SnappyDecoder {
    pub fn new() -> Self {
        Self {
            decoder: snap::raw::Decoder::new(),
            buf: BytesMut::new(),
            seen_identifier: false,
        }
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        while self.buf.len() >= 4 {
            let kind = self.buf[0];
            let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], 0]) as usize;
            if self.buf.len() < 4 + len {
                break;
            }
            self.buf.advance(4);
            let body = self.buf.split_to(len);

            match kind {
                CHUNK_STREAM_IDENTIFIER => {
                    if &body[..] != b"sNaPpY" {
                        return Err(QuayError::compression("bad snappy stream identifier"));
                    }
                    self.seen_identifier = true;
                }
                _ if !self.seen_identifier => {
                    return Err(QuayError::compression(
                        "snappy stream does not start with an identifier",
                    ));
                }
                CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                    if body.len() < 4 {
                        return Err(QuayError::compression("snappy chunk shorter than checksum"));
                    }
                    let expected = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    let start = out.len();
                    if kind == CHUNK_COMPRESSED {
                        let raw = self
                            .decoder
                            .decompress_vec(&body[4..])
                            .map_err(|e| QuayError::compression(e.to_string()))?;
                        out.extend_from_slice(&raw);
                    } else {
                        out.extend_from_slice(&body[4..]);
                    }
                    if masked_crc(&out[start..]) != expected {
                        return Err(QuayError::compression("snappy checksum mismatch"));
                    }
                }
                0x02..=0x7f => {
                    return Err(QuayError::compression(format!(
                        "reserved unskippable snappy chunk 0x{kind:02x}"
                    )));
                }
                // padding and reserved skippable chunks
                _ => {}
            }
        }
        Ok(out)
    }
}

impl Default for SnappyDecoder {
    fn default() -> Self {
        Self::new()
    }
}
