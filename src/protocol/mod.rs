//! Protocol Module
//!
//! Defines the binary wire protocol spoken between the client and each node.
//!
//! ## Frame Format
//! ```text
//! ┌────────────────────────────┬────────┬──────┬─────────┐
//! │        Header (24)         │ Extras │ Key  │  Value  │
//! └────────────────────────────┴────────┴──────┴─────────┘
//! ```
//!
//! Requests carry magic `0x80` and a target vbucket; responses carry magic
//! `0x81` and a status code in the same header slot. The opaque field echoes
//! the client's correlation token so responses can be matched out of order.

mod codec;
mod opcode;
mod packet;

pub use codec::{
    decode_frame, decode_packet, encode_into, encode_packet, read_packet, write_packet,
    FrameReader, HEADER_SIZE, MAX_BODY_SIZE,
};
pub use opcode::{
    HelloFeature, Magic, Opcode, VbucketState, DATATYPE_COMPRESSED, DATATYPE_JSON,
    DATATYPE_XATTR,
};
pub use packet::Packet;
