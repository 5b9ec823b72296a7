//! Codec Tests
//!
//! Tests for packet encoding/decoding and stream framing.

use std::io::{Cursor, Read};

use bytes::BytesMut;
use memdcore::protocol::{
    decode_frame, decode_packet, encode_packet, read_packet, write_packet, FrameReader,
    HelloFeature, Magic, Opcode, Packet, DATATYPE_JSON, HEADER_SIZE, MAX_BODY_SIZE,
};
use memdcore::{MemdError, StatusCode};

fn sample_request() -> Packet {
    let mut packet = Packet::request(Opcode::Set)
        .with_key(&b"mykey"[..])
        .with_extras(vec![0, 0, 0, 7, 0, 0, 0, 0])
        .with_value(&b"{\"a\":1}"[..])
        .with_vbucket(513)
        .with_cas(0xdead_beef)
        .with_datatype(DATATYPE_JSON);
    packet.opaque = 42;
    packet
}

// =============================================================================
// Header Layout Tests
// =============================================================================

#[test]
fn test_header_layout() {
    let bytes = encode_packet(&sample_request());

    assert_eq!(bytes[0], 0x80);
    assert_eq!(bytes[1], 0x01);
    assert_eq!(&bytes[2..4], &[0, 5]);
    assert_eq!(bytes[4], 8);
    assert_eq!(bytes[5], DATATYPE_JSON);
    assert_eq!(&bytes[6..8], &513u16.to_be_bytes());
    assert_eq!(&bytes[8..12], &(8u32 + 5 + 7).to_be_bytes());
    assert_eq!(&bytes[12..16], &42u32.to_be_bytes());
    assert_eq!(&bytes[16..24], &0xdead_beefu64.to_be_bytes());
    assert_eq!(&bytes[HEADER_SIZE + 8..HEADER_SIZE + 13], b"mykey");
    assert_eq!(bytes.len(), HEADER_SIZE + 20);
}

#[test]
fn test_response_carries_status_not_vbucket() {
    let request = sample_request();
    let response = Packet::response_to(&request, StatusCode::NotMyVbucket);
    let bytes = encode_packet(&response);

    assert_eq!(bytes[0], 0x81);
    assert_eq!(&bytes[6..8], &[0x00, 0x07]);

    let decoded = decode_packet(&bytes).unwrap();
    assert_eq!(decoded.magic, Magic::Response);
    assert_eq!(decoded.status, StatusCode::NotMyVbucket);
    assert_eq!(decoded.opaque, 42);
    assert_eq!(decoded.opcode, Opcode::Set);
}

#[test]
fn test_decode_request() {
    let packet = sample_request();
    let decoded = decode_packet(&encode_packet(&packet)).unwrap();
    assert_eq!(decoded, packet);
    assert!(decoded.is_json());
    assert_eq!(decoded.flags(), 7);
}

#[test]
fn test_unknown_opcode_and_status_survive() {
    let mut bytes = encode_packet(&Packet::request(Opcode::Get));
    bytes[1] = 0x7a;
    let decoded = decode_packet(&bytes).unwrap();
    assert_eq!(decoded.opcode, Opcode::Other(0x7a));
    assert_eq!(encode_packet(&decoded), bytes);

    let mut response = Packet::response_to(&Packet::request(Opcode::Get), StatusCode::Success);
    response.status = StatusCode::from(0x4242);
    let decoded = decode_packet(&encode_packet(&response)).unwrap();
    assert_eq!(decoded.status, StatusCode::Other(0x4242));
}

#[test]
fn test_opcode_table_values() {
    assert_eq!(Opcode::Stat.code(), 0x10);
    assert_eq!(Opcode::Hello.code(), 0x1f);
    assert_eq!(Opcode::DcpStreamReq.code(), 0x53);
    assert_eq!(Opcode::GetReplica.code(), 0x83);
    assert_eq!(Opcode::SelectBucket.code(), 0x89);
    assert_eq!(Opcode::GetClusterConfig.code(), 0xb5);
    assert_eq!(Opcode::SubDocMultiMutation.code(), 0xd1);
    assert_eq!(Opcode::SubDocGetCount.code(), 0xd2);
    assert_eq!(HelloFeature::Json.code(), 0x0b);

    for opcode in Opcode::ALL {
        assert_eq!(Opcode::from(opcode.code()), *opcode);
    }
}

// =============================================================================
// Malformed Input Tests
// =============================================================================

#[test]
fn test_invalid_magic() {
    let mut bytes = encode_packet(&sample_request());
    bytes[0] = 0x42;
    assert!(matches!(decode_packet(&bytes), Err(MemdError::Protocol(_))));
}

#[test]
fn test_short_header() {
    let bytes = encode_packet(&sample_request());
    assert!(matches!(decode_packet(&bytes[..10]), Err(MemdError::Protocol(_))));
}

#[test]
fn test_key_longer_than_body() {
    let mut bytes = encode_packet(&sample_request());
    bytes[2..4].copy_from_slice(&100u16.to_be_bytes());
    assert!(matches!(decode_packet(&bytes), Err(MemdError::Protocol(_))));
}

#[test]
fn test_oversized_body_rejected() {
    let mut bytes = encode_packet(&Packet::request(Opcode::Get));
    bytes[8..12].copy_from_slice(&(MAX_BODY_SIZE + 1).to_be_bytes());
    let mut buf = BytesMut::from(&bytes[..]);
    assert!(matches!(decode_frame(&mut buf), Err(MemdError::Protocol(_))));
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut bytes = encode_packet(&sample_request());
    bytes.push(0);
    assert!(decode_packet(&bytes).is_err());
}

// =============================================================================
// Stream Framing Tests
// =============================================================================

#[test]
fn test_decode_frame_waits_for_full_frame() {
    let bytes = encode_packet(&sample_request());
    let mut buf = BytesMut::new();

    buf.extend_from_slice(&bytes[..HEADER_SIZE - 1]);
    assert!(decode_frame(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&bytes[HEADER_SIZE - 1..bytes.len() - 1]);
    assert!(decode_frame(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&bytes[bytes.len() - 1..]);
    assert_eq!(decode_frame(&mut buf).unwrap(), Some(sample_request()));
    assert!(buf.is_empty());
}

#[test]
fn test_decode_frame_back_to_back() {
    let first = sample_request();
    let mut second = Packet::request(Opcode::Get).with_key(&b"other"[..]);
    second.opaque = 43;

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_packet(&first));
    buf.extend_from_slice(&encode_packet(&second));

    assert_eq!(decode_frame(&mut buf).unwrap(), Some(first));
    assert_eq!(decode_frame(&mut buf).unwrap(), Some(second));
    assert_eq!(decode_frame(&mut buf).unwrap(), None);
}

#[test]
fn test_read_write_stream() {
    let mut cursor = Cursor::new(Vec::new());
    write_packet(&mut cursor, &sample_request()).unwrap();
    write_packet(&mut cursor, &Packet::request(Opcode::Hello)).unwrap();

    cursor.set_position(0);
    assert_eq!(read_packet(&mut cursor).unwrap(), sample_request());
    assert_eq!(read_packet(&mut cursor).unwrap().opcode, Opcode::Hello);
    assert!(matches!(read_packet(&mut cursor), Err(MemdError::Io(_))));
}

/// Hands out bytes in fixed-size chunks, then reports a timeout
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.data.len() {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[test]
fn test_frame_reader_keeps_partial_frames() {
    let bytes = encode_packet(&sample_request());
    let mut trickle = Trickle {
        data: bytes[..30].to_vec(),
        pos: 0,
        chunk: 7,
    };
    let mut reader = FrameReader::new();

    assert!(reader.poll(&mut trickle).unwrap().is_none());
    assert_eq!(reader.buffered(), 30);

    trickle.data = bytes.clone();
    assert_eq!(reader.poll(&mut trickle).unwrap(), Some(sample_request()));
    assert_eq!(reader.buffered(), 0);
}

#[test]
fn test_frame_reader_eof() {
    let mut reader = FrameReader::new();
    let mut empty = Cursor::new(Vec::<u8>::new());
    match reader.poll(&mut empty) {
        Err(MemdError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected EOF, got {:?}", other),
    }
}
