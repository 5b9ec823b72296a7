//! Basic key-value operations

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::completion::PendingOp;
use crate::durability::MutationToken;
use crate::error::{MemdError, Result};
use crate::protocol::{Opcode, Packet};
use crate::routing::{ReplicaTarget, Route};

use super::{Agent, OpSpec, Target};

/// Expiry sent with a counter op that must not create the document
const NO_CREATE_EXPIRY: u32 = 0xffff_ffff;

// =============================================================================
// Result Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreResult {
    pub cas: u64,
    /// Present when mutation tokens were negotiated
    pub mutation_token: Option<MutationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomResult {
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn store_extras(flags: u32, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(flags);
    extras.put_u32(expiry);
    extras.freeze()
}

fn expiry_extras(expiry: u32) -> Bytes {
    Bytes::copy_from_slice(&expiry.to_be_bytes())
}

fn counter_extras(delta: u64, initial: Option<u64>, expiry: u32) -> Bytes {
    let mut extras = BytesMut::with_capacity(20);
    extras.put_u64(delta);
    match initial {
        Some(initial) => {
            extras.put_u64(initial);
            extras.put_u32(expiry);
        }
        None => {
            extras.put_u64(0);
            extras.put_u32(NO_CREATE_EXPIRY);
        }
    }
    extras.freeze()
}

fn keyed(opcode: Opcode, key: &Bytes, route: &Route) -> Packet {
    Packet::request(opcode)
        .with_key(key.clone())
        .with_vbucket(route.vbucket)
}

fn decode_get(_: &Route, packet: Packet) -> Result<GetResult> {
    Ok(GetResult {
        flags: packet.flags(),
        cas: packet.cas,
        value: packet.value,
    })
}

fn decode_store(route: &Route, packet: Packet) -> Result<StoreResult> {
    Ok(StoreResult {
        cas: packet.cas,
        mutation_token: MutationToken::from_response(&packet, route.vbucket),
    })
}

fn decode_counter(route: &Route, packet: Packet) -> Result<CounterResult> {
    if packet.value.len() != 8 {
        return Err(MemdError::Protocol(format!(
            "counter response value is {} bytes, expected 8",
            packet.value.len()
        )));
    }
    let mut value = packet.value.clone();
    Ok(CounterResult {
        value: value.get_u64(),
        cas: packet.cas,
        mutation_token: MutationToken::from_response(&packet, route.vbucket),
    })
}

// =============================================================================
// Operations
// =============================================================================

impl Agent {
    /// Fetch a document
    pub fn get(
        &self,
        key: &[u8],
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(Opcode::Get, &key, route)),
            decode_get,
        );
        self.inner.dispatch(spec, callback)
    }

    /// Fetch and update the expiry in one step
    pub fn get_and_touch(
        &self,
        key: &[u8],
        expiry: u32,
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(Opcode::GetAndTouch, &key, route).with_extras(expiry_extras(expiry))),
            decode_get,
        );
        self.inner.dispatch(spec, callback)
    }

    /// Fetch a document from a replica; `replica` 0 means any replica
    pub fn get_replica(
        &self,
        key: &[u8],
        replica: u32,
        callback: impl FnOnce(Result<GetResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::from_replica_index(replica)),
            move |route| Ok(keyed(Opcode::GetReplica, &key, route)),
            decode_get,
        );
        self.inner.dispatch(spec, callback)
    }

    /// Fetch a random document from a random node
    pub fn get_random(
        &self,
        callback: impl FnOnce(Result<RandomResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let num_nodes = self.topology().num_nodes();
        let node = rand::thread_rng().gen_range(0..num_nodes);
        let spec = OpSpec::new(
            Bytes::new(),
            Target::Node(node),
            |_| Ok(Packet::request(Opcode::GetRandom)),
            |_, packet| {
                Ok(RandomResult {
                    flags: packet.flags(),
                    cas: packet.cas,
                    key: packet.key,
                    value: packet.value,
                })
            },
        );
        self.inner.dispatch(spec, callback)
    }

    /// Store unconditionally (or only if `cas` matches, when non-zero)
    pub fn set(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
        cas: u64,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.store(Opcode::Set, key, value.into(), flags, expiry, cas, callback)
    }

    /// Store only if the key does not exist
    pub fn add(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.store(Opcode::Add, key, value.into(), flags, expiry, 0, callback)
    }

    /// Store only if the key exists (and `cas` matches, when non-zero)
    pub fn replace(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
        cas: u64,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.store(Opcode::Replace, key, value.into(), flags, expiry, cas, callback)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        opcode: Opcode,
        key: &[u8],
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let extras = store_extras(flags, expiry);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| {
                Ok(keyed(opcode, &key, route)
                    .with_extras(extras.clone())
                    .with_value(value.clone())
                    .with_cas(cas))
            },
            decode_store,
        )
        .cas_checked(cas);
        self.inner.dispatch(spec, callback)
    }

    /// Delete a document (only if `cas` matches, when non-zero)
    pub fn remove(
        &self,
        key: &[u8],
        cas: u64,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(Opcode::Delete, &key, route).with_cas(cas)),
            decode_store,
        )
        .cas_checked(cas);
        self.inner.dispatch(spec, callback)
    }

    /// Update the expiry of a document
    pub fn touch(
        &self,
        key: &[u8],
        expiry: u32,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(Opcode::Touch, &key, route).with_extras(expiry_extras(expiry))),
            decode_store,
        );
        self.inner.dispatch(spec, callback)
    }

    /// Add `delta` to a counter
    ///
    /// A missing key is created with `initial` (and `delta` is not applied);
    /// with `initial` set to `None` a missing key fails with not-found.
    pub fn increment(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        callback: impl FnOnce(Result<CounterResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.counter(Opcode::Increment, key, delta, initial, expiry, callback)
    }

    /// Subtract `delta` from a counter, stopping at zero
    pub fn decrement(
        &self,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        callback: impl FnOnce(Result<CounterResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.counter(Opcode::Decrement, key, delta, initial, expiry, callback)
    }

    fn counter(
        &self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        callback: impl FnOnce(Result<CounterResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let extras = counter_extras(delta, initial, expiry);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(opcode, &key, route).with_extras(extras.clone())),
            decode_counter,
        );
        self.inner.dispatch(spec, callback)
    }

    /// Append raw bytes to an existing value
    pub fn append(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.adjoin(Opcode::Append, key, value.into(), callback)
    }

    /// Prepend raw bytes to an existing value
    pub fn prepend(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.adjoin(Opcode::Prepend, key, value.into(), callback)
    }

    fn adjoin(
        &self,
        opcode: Opcode,
        key: &[u8],
        value: Bytes,
        callback: impl FnOnce(Result<StoreResult>) + Send + 'static,
    ) -> Result<PendingOp> {
        let key = Bytes::copy_from_slice(key);
        let spec = OpSpec::new(
            key.clone(),
            Target::Key(ReplicaTarget::Primary),
            move |route| Ok(keyed(opcode, &key, route).with_value(value.clone())),
            decode_store,
        );
        self.inner.dispatch(spec, callback)
    }
}
