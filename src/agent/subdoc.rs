//! Sub-document multi-lookup and multi-mutation

use bytes::Bytes;

use crate::completion::PendingOp;
use crate::durability::MutationToken;
use crate::error::{MemdError, Result};
use crate::protocol::{Opcode, Packet};
use crate::routing::ReplicaTarget;
use crate::status::StatusCode;
use crate::subdoc::{
    decode_lookup, decode_mutation, encode_lookup, encode_mutation, DocFlags, LookupInResult,
    MutateInResult, SubDocFlags, SubDocOp,
};

use super::{Agent, OpSpec, Target};

fn lookup_accepts(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::Success
            | StatusCode::SubDocBadMulti
            | StatusCode::SubDocSuccessDeleted
            | StatusCode::SubDocMultiPathFailureDeleted
    )
}

fn mutation_accepts(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::Success | StatusCode::SubDocSuccessDeleted | StatusCode::SubDocBadMulti
    )
}

impl Agent {
    fn check_subdoc(&self, ops: &[SubDocOp]) -> Result<()> {
        if !self.topology().has_vbuckets() {
            return Err(MemdError::NotSupported(
                "sub-document operations require a vbucket-mapped bucket".to_string(),
            ));
        }
        let wants_xattr = ops.iter().any(|op| op.flags.contains(SubDocFlags::XATTR_PATH));
        if wants_xattr {
            if let Some(capabilities) = self.capabilities() {
                if !capabilities.xattr() {
                    return Err(MemdError::NotSupported(
                        "extended attributes were not negotiated".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Read several paths of one document in a single round trip
    ///
    /// Per-path failures are reported in the matching
    /// [`SubDocResult`](crate::subdoc::SubDocResult); only document-level
    /// failures (missing document, locked, ...) fail the call.
    pub fn lookup_in(
        &self,
        key: &[u8],
        ops: Vec<SubDocOp>,
        doc_flags: DocFlags,
        callback: impl FnOnce(Result<LookupInResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.check_subdoc(&ops)?;
        let (extras, value) = encode_lookup(&ops, doc_flags)?;
        let num_ops = ops.len();

        let key = Bytes::copy_from_slice(key);
        let encode_key = key.clone();
        let spec = OpSpec::new(
            key,
            Target::Key(ReplicaTarget::Primary),
            move |route| {
                Ok(Packet::request(Opcode::SubDocMultiLookup)
                    .with_key(encode_key.clone())
                    .with_vbucket(route.vbucket)
                    .with_extras(extras.clone())
                    .with_value(value.clone()))
            },
            move |_, packet| {
                Ok(LookupInResult {
                    results: decode_lookup(&packet.value, num_ops)?,
                    cas: packet.cas,
                    deleted: matches!(
                        packet.status,
                        StatusCode::SubDocSuccessDeleted | StatusCode::SubDocMultiPathFailureDeleted
                    ),
                })
            },
        )
        .accept(lookup_accepts);
        self.inner.dispatch(spec, callback)
    }

    /// Apply several path mutations to one document atomically
    ///
    /// If any path fails nothing is applied and the call fails with
    /// [`MemdError::SubDocPathFailure`] naming the first failing op.
    #[allow(clippy::too_many_arguments)]
    pub fn mutate_in(
        &self,
        key: &[u8],
        ops: Vec<SubDocOp>,
        doc_flags: DocFlags,
        cas: u64,
        expiry: u32,
        callback: impl FnOnce(Result<MutateInResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.check_subdoc(&ops)?;
        let (extras, value) = encode_mutation(&ops, doc_flags, expiry)?;
        let num_ops = ops.len();

        let key = Bytes::copy_from_slice(key);
        let encode_key = key.clone();
        let spec = OpSpec::new(
            key,
            Target::Key(ReplicaTarget::Primary),
            move |route| {
                Ok(Packet::request(Opcode::SubDocMultiMutation)
                    .with_key(encode_key.clone())
                    .with_vbucket(route.vbucket)
                    .with_cas(cas)
                    .with_extras(extras.clone())
                    .with_value(value.clone()))
            },
            move |route, packet| {
                let results = decode_mutation(packet.status, &packet.value, num_ops)?;
                Ok(MutateInResult {
                    results,
                    cas: packet.cas,
                    mutation_token: MutationToken::from_response(&packet, route.vbucket),
                })
            },
        )
        .accept(mutation_accepts)
        .cas_checked(cas);
        self.inner.dispatch(spec, callback)
    }
}
