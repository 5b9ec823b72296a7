//! Protocol codec
//!
//! Encoding and decoding functions for the binary wire protocol.
//!
//! ## Wire Format
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    +---------------+---------------+---------------+---------------+
//!   0| Magic         | Opcode        | Key length                    |
//!    +---------------+---------------+---------------+---------------+
//!   4| Extras length | Data type     | vbucket id / status           |
//!    +---------------+---------------+---------------+---------------+
//!   8| Total body length                                             |
//!    +---------------+---------------+---------------+---------------+
//!  12| Opaque                                                        |
//!    +---------------+---------------+---------------+---------------+
//!  16| CAS                                                           |
//!    |                                                               |
//!    +---------------+---------------+---------------+---------------+
//!  24| extras | key | value                                          |
//! ```
//!
//! All integers are big-endian. `extras length + key length` must not exceed
//! the total body length; the value is whatever remains.

use std::io::{ErrorKind as IoErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MemdError, Result};
use crate::status::StatusCode;

use super::{Magic, Opcode, Packet};

/// Fixed header size
pub const HEADER_SIZE: usize = 24;

/// Maximum body size accepted from the wire (document limit plus headroom)
pub const MAX_BODY_SIZE: u32 = 32 * 1024 * 1024;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a packet to bytes
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + packet.body_len());
    encode_into(packet, &mut buf);
    buf.to_vec()
}

/// Encode a packet, appending to an existing buffer
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE + packet.body_len());

    buf.put_u8(packet.magic as u8);
    buf.put_u8(packet.opcode.code());
    buf.put_u16(packet.key.len() as u16);
    buf.put_u8(packet.extras.len() as u8);
    buf.put_u8(packet.datatype);
    match packet.magic {
        Magic::Request => buf.put_u16(packet.vbucket),
        Magic::Response => buf.put_u16(packet.status.code()),
    }
    buf.put_u32(packet.body_len() as u32);
    buf.put_u32(packet.opaque);
    buf.put_u64(packet.cas);

    buf.put_slice(&packet.extras);
    buf.put_slice(&packet.key);
    buf.put_slice(&packet.value);
}

// =============================================================================
// Decoding
// =============================================================================

/// Parsed fixed header
#[derive(Debug, Clone, Copy)]
struct Header {
    magic: Magic,
    opcode: Opcode,
    key_len: usize,
    extras_len: usize,
    datatype: u8,
    vbucket_or_status: u16,
    body_len: usize,
    opaque: u32,
    cas: u64,
}

fn parse_header(mut bytes: &[u8]) -> Result<Header> {
    debug_assert!(bytes.len() >= HEADER_SIZE);

    let magic_byte = bytes.get_u8();
    let magic = Magic::from_u8(magic_byte)
        .ok_or_else(|| MemdError::Protocol(format!("Invalid magic: 0x{:02x}", magic_byte)))?;
    let opcode = Opcode::from(bytes.get_u8());
    let key_len = bytes.get_u16() as usize;
    let extras_len = bytes.get_u8() as usize;
    let datatype = bytes.get_u8();
    let vbucket_or_status = bytes.get_u16();
    let body_len = bytes.get_u32();
    let opaque = bytes.get_u32();
    let cas = bytes.get_u64();

    if body_len > MAX_BODY_SIZE {
        return Err(MemdError::Protocol(format!(
            "Body too large: {} bytes (max {})",
            body_len, MAX_BODY_SIZE
        )));
    }

    let body_len = body_len as usize;
    if key_len + extras_len > body_len {
        return Err(MemdError::Protocol(format!(
            "Length mismatch: extras {} + key {} exceeds body {}",
            extras_len, key_len, body_len
        )));
    }

    Ok(Header {
        magic,
        opcode,
        key_len,
        extras_len,
        datatype,
        vbucket_or_status,
        body_len,
        opaque,
        cas,
    })
}

fn assemble(header: Header, mut body: Bytes) -> Packet {
    let extras = body.split_to(header.extras_len);
    let key = body.split_to(header.key_len);

    let (vbucket, status) = match header.magic {
        Magic::Request => (header.vbucket_or_status, StatusCode::Success),
        Magic::Response => (0, StatusCode::from(header.vbucket_or_status)),
    };

    Packet {
        magic: header.magic,
        opcode: header.opcode,
        datatype: header.datatype,
        vbucket,
        status,
        opaque: header.opaque,
        cas: header.cas,
        extras,
        key,
        value: body,
    }
}

/// Decode one complete packet from a byte slice
///
/// The slice must hold exactly one frame; trailing bytes are rejected.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < HEADER_SIZE {
        return Err(MemdError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let header = parse_header(bytes)?;
    let total_len = HEADER_SIZE + header.body_len;
    if bytes.len() != total_len {
        return Err(MemdError::Protocol(format!(
            "Frame length mismatch: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }

    let body = Bytes::copy_from_slice(&bytes[HEADER_SIZE..]);
    Ok(assemble(header, body))
}

/// Try to split one complete frame off the front of a buffer
///
/// Returns `Ok(None)` if the buffer does not yet hold a full frame.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Packet>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = parse_header(&buf[..HEADER_SIZE])?;
    if buf.len() < HEADER_SIZE + header.body_len {
        buf.reserve(HEADER_SIZE + header.body_len - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(HEADER_SIZE + header.body_len);
    frame.advance(HEADER_SIZE);
    Ok(Some(assemble(header, frame.freeze())))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete packet from a blocking stream
pub fn read_packet<R: Read>(reader: &mut R) -> Result<Packet> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let parsed = parse_header(&header)?;
    let mut body = vec![0u8; parsed.body_len];
    if parsed.body_len > 0 {
        reader.read_exact(&mut body)?;
    }

    Ok(assemble(parsed, Bytes::from(body)))
}

/// Write a packet to a stream
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<()> {
    let bytes = encode_packet(packet);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Incremental frame reader for streams with a read timeout
///
/// Unlike [`read_packet`], a timeout part-way through a frame does not lose
/// the bytes already received; they stay buffered for the next call.
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Read until a full frame is available
    ///
    /// Returns `Ok(None)` when the read timed out with no complete frame, and
    /// an `UnexpectedEof` I/O error when the peer closed the stream.
    pub fn poll<R: Read>(&mut self, reader: &mut R) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = decode_frame(&mut self.buf)? {
                return Ok(Some(packet));
            }

            let mut chunk = [0u8; 8 * 1024];
            match reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(MemdError::Io(std::io::Error::new(
                        IoErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
