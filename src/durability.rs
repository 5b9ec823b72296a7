//! Durability introspection
//!
//! Wire formats and result types for Observe (per-key state on one node) and
//! ObserveSeqNo (per-vbucket sequence numbers), plus mutation tokens and the
//! comparisons used to poll a write until it is replicated or persisted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MemdError, Result};
use crate::protocol::Packet;

code_table! {
    /// Per-key state reported by Observe
    pub enum KeyState: u8 {
        /// In memory, not yet on disk
        NotPersisted = 0x00,
        Persisted = 0x01,
        NotFound = 0x80,
        /// Tombstone: deleted but not yet purged
        Deleted = 0x81,
    }
}

/// A point in a vbucket's mutation history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationToken {
    pub vbucket: u16,
    pub vbuuid: u64,
    pub seqno: u64,
}

impl MutationToken {
    /// Parse the 16-byte token a mutation response carries when seqnos were
    /// negotiated; `None` otherwise
    pub fn from_response(packet: &Packet, vbucket: u16) -> Option<Self> {
        if packet.extras.len() < 16 {
            return None;
        }
        let mut extras = packet.extras.clone();
        Some(Self {
            vbucket,
            vbuuid: extras.get_u64(),
            seqno: extras.get_u64(),
        })
    }

    /// Whether the node that produced `result` has the mutation in memory
    pub fn is_observed_by(&self, result: &ObserveSeqNoResult) -> bool {
        self.reached(result, result.current)
    }

    /// Whether the node that produced `result` has the mutation on disk
    pub fn is_persisted_by(&self, result: &ObserveSeqNoResult) -> bool {
        self.reached(result, result.persisted)
    }

    fn reached(&self, result: &ObserveSeqNoResult, seqno: u64) -> bool {
        if result.vbucket != self.vbucket {
            return false;
        }
        if result.vbuuid == self.vbuuid {
            return seqno >= self.seqno;
        }
        // After a failover only history up to the old branch's last seqno
        // survived
        match result.failover {
            Some(failover) if failover.old_vbuuid == self.vbuuid => {
                failover.last_seqno >= self.seqno
            }
            _ => false,
        }
    }
}

/// Result of an Observe on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveResult {
    pub key_state: KeyState,
    pub cas: u64,
}

/// Failover section of an ObserveSeqNo response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverInfo {
    pub old_vbuuid: u64,
    pub last_seqno: u64,
}

/// Result of an ObserveSeqNo on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSeqNoResult {
    pub vbucket: u16,
    /// vbucket uuid currently on the node
    pub vbuuid: u64,
    pub persisted: u64,
    pub current: u64,
    /// Present when the queried uuid is no longer the current branch
    pub failover: Option<FailoverInfo>,
}

// =============================================================================
// Observe
// =============================================================================

/// Encode an Observe request value (`vbucket(2) key_len(2) key`)
pub fn encode_observe(vbucket: u16, key: &[u8]) -> Result<Bytes> {
    if key.len() > u16::MAX as usize {
        return Err(MemdError::InvalidArgument("key too long".to_string()));
    }
    let mut buf = BytesMut::with_capacity(4 + key.len());
    buf.put_u16(vbucket);
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    Ok(buf.freeze())
}

/// Parse an Observe request value into `(vbucket, key)` pairs
pub fn parse_observe_request(value: &[u8]) -> Result<Vec<(u16, Bytes)>> {
    let mut buf = value;
    let mut keys = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(MemdError::Protocol("truncated observe request".to_string()));
        }
        let vbucket = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(MemdError::Protocol("truncated observe request".to_string()));
        }
        keys.push((vbucket, Bytes::copy_from_slice(&buf[..len])));
        buf.advance(len);
    }
    Ok(keys)
}

/// Encode one Observe response entry
pub fn encode_observe_entry(buf: &mut BytesMut, vbucket: u16, key: &[u8], result: ObserveResult) {
    buf.put_u16(vbucket);
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    buf.put_u8(result.key_state.code());
    buf.put_u64(result.cas);
}

/// Parse an Observe response, returning the entry for `key`
pub fn parse_observe_response(value: &[u8], key: &[u8]) -> Result<ObserveResult> {
    let mut buf = value;
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(MemdError::Protocol("truncated observe response".to_string()));
        }
        let _vbucket = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len + 9 {
            return Err(MemdError::Protocol("truncated observe response".to_string()));
        }
        let entry_key = &buf[..len];
        let matches = entry_key == key;
        buf.advance(len);
        let key_state = KeyState::from(buf.get_u8());
        let cas = buf.get_u64();
        if matches {
            return Ok(ObserveResult { key_state, cas });
        }
    }
    Err(MemdError::Protocol(
        "observe response does not mention the key".to_string(),
    ))
}

// =============================================================================
// ObserveSeqNo
// =============================================================================

/// Encode an ObserveSeqNo request value (the vbucket uuid)
pub fn encode_observe_seqno(vbuuid: u64) -> Bytes {
    Bytes::copy_from_slice(&vbuuid.to_be_bytes())
}

/// Encode an ObserveSeqNo response value
pub fn encode_observe_seqno_response(result: &ObserveSeqNoResult) -> Bytes {
    let mut buf = BytesMut::with_capacity(43);
    buf.put_u8(u8::from(result.failover.is_some()));
    buf.put_u16(result.vbucket);
    buf.put_u64(result.vbuuid);
    buf.put_u64(result.persisted);
    buf.put_u64(result.current);
    if let Some(failover) = result.failover {
        buf.put_u64(failover.old_vbuuid);
        buf.put_u64(failover.last_seqno);
    }
    buf.freeze()
}

/// Parse an ObserveSeqNo response value
///
/// Format 0: `format(1) vbucket(2) vbuuid(8) persisted(8) current(8)`.
/// Format 1 appends `old_vbuuid(8) last_seqno(8)`.
pub fn parse_observe_seqno_response(value: &[u8]) -> Result<ObserveSeqNoResult> {
    let mut buf = value;
    if buf.remaining() < 27 {
        return Err(MemdError::Protocol(format!(
            "observe-seqno response too short ({} bytes)",
            value.len()
        )));
    }

    let format = buf.get_u8();
    let vbucket = buf.get_u16();
    let vbuuid = buf.get_u64();
    let persisted = buf.get_u64();
    let current = buf.get_u64();

    let failover = match format {
        0 => None,
        1 => {
            if buf.remaining() < 16 {
                return Err(MemdError::Protocol(
                    "observe-seqno failover section truncated".to_string(),
                ));
            }
            Some(FailoverInfo {
                old_vbuuid: buf.get_u64(),
                last_seqno: buf.get_u64(),
            })
        }
        other => {
            return Err(MemdError::Protocol(format!(
                "unknown observe-seqno format {}",
                other
            )))
        }
    };

    Ok(ObserveSeqNoResult {
        vbucket,
        vbuuid,
        persisted,
        current,
        failover,
    })
}
