//! Sub-Document Module
//!
//! Path-level operations on JSON documents and their extended attributes,
//! batched into one multi-lookup or multi-mutation packet.
//!
//! ## Guarantees
//! - Results come back in op order, one per op
//! - Lookups fail per path; a missing document fails the whole packet
//! - Multi-mutations are atomic: one failing path rejects all of them

mod codec;
mod ops;

pub use codec::{
    decode_lookup, decode_mutation, encode_lookup, encode_lookup_response, encode_mutation,
    encode_mutation_failure, encode_mutation_response, parse_lookup_request,
    parse_mutation_request, MAX_SUBDOC_OPS,
};
pub use ops::{
    DocFlags, LookupInResult, MutateInResult, SubDocFlags, SubDocOp, SubDocOpKind, SubDocResult,
};
