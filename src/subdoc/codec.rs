//! Multi-path wire format
//!
//! Lookup request layout, repeated per op:
//! ```text
//! opcode(1) flags(1) path_len(2) path
//! ```
//! Mutation request layout, repeated per op:
//! ```text
//! opcode(1) flags(1) path_len(2) value_len(4) path value
//! ```
//! Lookup response: `status(2) value_len(4) value` per op, in order.
//! Mutation response: `index(1) status(2) value_len(4) value` for ops that
//! produced a value, or a single `index(1) status(2)` when the packet status
//! says one path failed and nothing was applied.
//!
//! Extras: lookups carry an optional doc-flags byte; mutations carry an
//! optional expiry (4) followed by an optional doc-flags byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{KvError, MemdError, Result};
use crate::protocol::Opcode;
use crate::status::StatusCode;

use super::{DocFlags, SubDocFlags, SubDocOp, SubDocOpKind, SubDocResult};

/// Most ops a single multi-path packet may carry
pub const MAX_SUBDOC_OPS: usize = 16;

fn check_ops(ops: &[SubDocOp], lookup: bool) -> Result<()> {
    if ops.is_empty() {
        return Err(MemdError::InvalidArgument(
            "at least one sub-document op is required".to_string(),
        ));
    }
    if ops.len() > MAX_SUBDOC_OPS {
        return Err(MemdError::InvalidArgument(format!(
            "{} sub-document ops exceeds the limit of {}",
            ops.len(),
            MAX_SUBDOC_OPS
        )));
    }
    for (index, op) in ops.iter().enumerate() {
        if op.kind.is_lookup() != lookup {
            return Err(MemdError::InvalidArgument(format!(
                "op {} ({:?}) is not a {} op",
                index,
                op.kind,
                if lookup { "lookup" } else { "mutation" }
            )));
        }
        if op.path.len() > u16::MAX as usize {
            return Err(MemdError::InvalidArgument(format!(
                "path of op {} is too long",
                index
            )));
        }
    }
    Ok(())
}

fn doc_flags_extras(buf: &mut BytesMut, doc_flags: DocFlags) {
    if !doc_flags.is_empty() {
        buf.put_u8(doc_flags.bits());
    }
}

/// Encode a multi-lookup; returns `(extras, value)`
pub fn encode_lookup(ops: &[SubDocOp], doc_flags: DocFlags) -> Result<(Bytes, Bytes)> {
    check_ops(ops, true)?;

    let mut extras = BytesMut::new();
    doc_flags_extras(&mut extras, doc_flags);

    let size = ops.iter().map(|op| 4 + op.path.len()).sum();
    let mut value = BytesMut::with_capacity(size);
    for op in ops {
        value.put_u8(op.kind.opcode().code());
        value.put_u8(op.flags.bits());
        value.put_u16(op.path.len() as u16);
        value.put_slice(op.path.as_bytes());
    }

    Ok((extras.freeze(), value.freeze()))
}

/// Encode a multi-mutation; returns `(extras, value)`
pub fn encode_mutation(
    ops: &[SubDocOp],
    doc_flags: DocFlags,
    expiry: u32,
) -> Result<(Bytes, Bytes)> {
    check_ops(ops, false)?;

    let mut extras = BytesMut::new();
    if expiry != 0 {
        extras.put_u32(expiry);
    }
    doc_flags_extras(&mut extras, doc_flags);

    let size = ops
        .iter()
        .map(|op| 8 + op.path.len() + op.value.len())
        .sum();
    let mut value = BytesMut::with_capacity(size);
    for op in ops {
        value.put_u8(op.kind.opcode().code());
        value.put_u8(op.flags.bits());
        value.put_u16(op.path.len() as u16);
        value.put_u32(op.value.len() as u32);
        value.put_slice(op.path.as_bytes());
        value.put_slice(&op.value);
    }

    Ok((extras.freeze(), value.freeze()))
}

fn truncated(what: &str) -> MemdError {
    MemdError::Protocol(format!("truncated sub-document {}", what))
}

/// Decode a multi-lookup response value into one result per op
pub fn decode_lookup(value: &[u8], num_ops: usize) -> Result<Vec<SubDocResult>> {
    let mut buf = value;
    let mut results = Vec::with_capacity(num_ops);

    while buf.has_remaining() {
        if buf.remaining() < 6 {
            return Err(truncated("lookup response"));
        }
        let status = StatusCode::from(buf.get_u16());
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(truncated("lookup response"));
        }
        let value = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        results.push(SubDocResult::new(status, value));
    }

    if results.len() != num_ops {
        return Err(MemdError::Protocol(format!(
            "expected {} lookup results, got {}",
            num_ops,
            results.len()
        )));
    }
    Ok(results)
}

/// Decode a multi-mutation response value onto the op list
///
/// `status` is the packet status: [`StatusCode::SubDocBadMulti`] means the
/// whole mutation was rejected because of one path.
pub fn decode_mutation(
    status: StatusCode,
    value: &[u8],
    num_ops: usize,
) -> Result<Vec<SubDocResult>> {
    let mut buf = value;

    if status == StatusCode::SubDocBadMulti {
        if buf.remaining() < 3 {
            return Err(truncated("mutation failure"));
        }
        let index = buf.get_u8() as usize;
        let path_status = StatusCode::from(buf.get_u16());
        return Err(MemdError::SubDocPathFailure {
            index,
            error: KvError::new(path_status),
        });
    }

    let mut results: Vec<SubDocResult> = (0..num_ops)
        .map(|_| SubDocResult::new(StatusCode::Success, Bytes::new()))
        .collect();

    while buf.has_remaining() {
        if buf.remaining() < 7 {
            return Err(truncated("mutation response"));
        }
        let index = buf.get_u8() as usize;
        let op_status = StatusCode::from(buf.get_u16());
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(truncated("mutation response"));
        }
        let value = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);

        let slot = results.get_mut(index).ok_or_else(|| {
            MemdError::Protocol(format!(
                "mutation result index {} out of range ({} ops)",
                index, num_ops
            ))
        })?;
        *slot = SubDocResult::new(op_status, value);
    }

    Ok(results)
}

// =============================================================================
// Server side (used by the mock cluster)
// =============================================================================

fn parse_kind(code: u8) -> Result<SubDocOpKind> {
    SubDocOpKind::from_opcode(Opcode::from(code)).ok_or_else(|| {
        MemdError::Protocol(format!("unknown sub-document opcode 0x{:02x}", code))
    })
}

fn take_string(buf: &mut &[u8], len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(truncated("request"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| MemdError::Protocol("sub-document path is not UTF-8".to_string()))?;
    buf.advance(len);
    Ok(s)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parse a multi-lookup request body
pub fn parse_lookup_request(extras: &[u8], value: &[u8]) -> Result<(DocFlags, Vec<SubDocOp>)> {
    let doc_flags = DocFlags::from_bits_truncate(extras.first().copied().unwrap_or(0));
    let mut buf = value;
    let mut ops = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(truncated("lookup request"));
        }
        let kind = parse_kind(buf.get_u8())?;
        let flags = SubDocFlags::from_bits_truncate(buf.get_u8());
        let path_len = buf.get_u16() as usize;
        let path = take_string(&mut buf, path_len)?;
        ops.push(SubDocOp::new(kind, path).with_flags(flags));
    }

    Ok((doc_flags, ops))
}

/// Parse a multi-mutation request body; returns `(expiry, doc_flags, ops)`
pub fn parse_mutation_request(
    extras: &[u8],
    value: &[u8],
) -> Result<(u32, DocFlags, Vec<SubDocOp>)> {
    let (expiry, doc_flags) = match extras.len() {
        0 => (0, DocFlags::empty()),
        1 => (0, DocFlags::from_bits_truncate(extras[0])),
        4 => (be_u32(extras), DocFlags::empty()),
        5 => (be_u32(extras), DocFlags::from_bits_truncate(extras[4])),
        n => {
            return Err(MemdError::Protocol(format!(
                "invalid mutation extras length {}",
                n
            )))
        }
    };

    let mut buf = value;
    let mut ops = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(truncated("mutation request"));
        }
        let kind = parse_kind(buf.get_u8())?;
        let flags = SubDocFlags::from_bits_truncate(buf.get_u8());
        let path_len = buf.get_u16() as usize;
        let value_len = buf.get_u32() as usize;
        let path = take_string(&mut buf, path_len)?;
        if buf.remaining() < value_len {
            return Err(truncated("mutation request"));
        }
        let op_value = Bytes::copy_from_slice(&buf[..value_len]);
        buf.advance(value_len);
        ops.push(SubDocOp::new(kind, path).with_flags(flags).with_value(op_value));
    }

    Ok((expiry, doc_flags, ops))
}

/// Encode per-op lookup results
pub fn encode_lookup_response(results: &[(StatusCode, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (status, value) in results {
        buf.put_u16(status.code());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.freeze()
}

/// Encode the value-bearing entries of a successful mutation
pub fn encode_mutation_response(entries: &[(u8, StatusCode, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (index, status, value) in entries {
        buf.put_u8(*index);
        buf.put_u16(status.code());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.freeze()
}

/// Encode the single failing path of a rejected mutation
pub fn encode_mutation_failure(index: u8, status: StatusCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(index);
    buf.put_u16(status.code());
    buf.freeze()
}
