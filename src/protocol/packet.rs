//! Packet definitions
//!
//! A packet is one binary-protocol frame, either a request or a response.

use bytes::{Buf, Bytes};

use crate::status::StatusCode;

use super::{Magic, Opcode, DATATYPE_JSON};

/// A single request or response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Request or response
    pub magic: Magic,

    /// Command opcode
    pub opcode: Opcode,

    /// Datatype flags (JSON / compressed / xattr)
    pub datatype: u8,

    /// Target vbucket (requests only)
    pub vbucket: u16,

    /// Status code (responses only)
    pub status: StatusCode,

    /// Client-assigned correlation token
    pub opaque: u32,

    /// Compare-and-swap version tag
    pub cas: u64,

    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Create an empty request packet for the given opcode
    pub fn request(opcode: Opcode) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            datatype: 0,
            vbucket: 0,
            status: StatusCode::Success,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Create a response to the given request, echoing its opcode and opaque
    pub fn response_to(request: &Packet, status: StatusCode) -> Self {
        Self {
            magic: Magic::Response,
            opcode: request.opcode,
            datatype: 0,
            vbucket: 0,
            status,
            opaque: request.opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Total body length (extras + key + value)
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }

    pub fn is_json(&self) -> bool {
        self.datatype & DATATYPE_JSON != 0
    }

    /// Read the 4-byte flags field found in the extras of get-style responses
    pub fn flags(&self) -> u32 {
        if self.extras.len() >= 4 {
            let mut extras = self.extras.clone();
            extras.get_u32()
        } else {
            0
        }
    }
}
