//! Durability polling primitives
//!
//! One Observe or ObserveSeqNo round trip against a single copy of a key's
//! vbucket. Polling loops are built on top by the caller.

use bytes::Bytes;

use crate::completion::PendingOp;
use crate::durability::{
    encode_observe, encode_observe_seqno, parse_observe_response, parse_observe_seqno_response,
    ObserveResult, ObserveSeqNoResult,
};
use crate::error::{MemdError, Result};
use crate::protocol::{Opcode, Packet};
use crate::routing::ReplicaTarget;

use super::{Agent, OpSpec, Target};

/// 0 addresses the active copy, n the n-th replica
fn copy_target(replica: u32) -> ReplicaTarget {
    match replica {
        0 => ReplicaTarget::Primary,
        n => ReplicaTarget::Replica(n),
    }
}

impl Agent {
    fn require_vbuckets(&self, what: &str) -> Result<()> {
        if !self.topology().has_vbuckets() {
            return Err(MemdError::NotSupported(format!(
                "{} requires a vbucket-mapped bucket",
                what
            )));
        }
        Ok(())
    }

    /// Ask one copy of the key's vbucket for the key's state and CAS
    pub fn observe(
        &self,
        key: &[u8],
        replica: u32,
        callback: impl FnOnce(Result<ObserveResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.require_vbuckets("observe")?;

        let key = Bytes::copy_from_slice(key);
        let encode_key = key.clone();
        let decode_key = key.clone();
        let spec = OpSpec::new(
            key,
            Target::Key(copy_target(replica)),
            // The vbucket travels in the body; the header vbucket stays 0
            move |route| {
                let value = encode_observe(route.vbucket, &encode_key)?;
                Ok(Packet::request(Opcode::Observe).with_value(value))
            },
            move |_, packet| parse_observe_response(&packet.value, &decode_key),
        );
        self.inner.dispatch(spec, callback)
    }

    /// Ask one copy of the key's vbucket for its sequence numbers
    ///
    /// `vbuuid` is the uuid from the mutation token being tracked; a failover
    /// since then is reported in [`ObserveSeqNoResult::failover`].
    pub fn observe_seqno(
        &self,
        key: &[u8],
        vbuuid: u64,
        replica: u32,
        callback: impl FnOnce(Result<ObserveSeqNoResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.require_vbuckets("observe_seqno")?;

        let spec = OpSpec::new(
            Bytes::copy_from_slice(key),
            Target::Key(copy_target(replica)),
            move |route| {
                Ok(Packet::request(Opcode::ObserveSeqNo)
                    .with_vbucket(route.vbucket)
                    .with_value(encode_observe_seqno(vbuuid)))
            },
            |route, packet| {
                let result = parse_observe_seqno_response(&packet.value)?;
                if result.vbucket != route.vbucket {
                    return Err(MemdError::Protocol(format!(
                        "observe-seqno answered for vb {}, asked for vb {}",
                        result.vbucket, route.vbucket
                    )));
                }
                Ok(result)
            },
        );
        self.inner.dispatch(spec, callback)
    }
}
