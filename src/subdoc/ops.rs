//! Sub-document operation and result types

use bytes::Bytes;

use crate::error::KvError;
use crate::protocol::Opcode;
use crate::status::StatusCode;

bitflags::bitflags! {
    /// Per-path flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubDocFlags: u8 {
        /// Create missing intermediate path segments
        const MKDIR_P = 0x01;
        /// The path addresses an extended attribute, not the body
        const XATTR_PATH = 0x04;
        /// Expand `${Mutation.*}` macros in the value server-side
        const EXPAND_MACROS = 0x10;
    }
}

bitflags::bitflags! {
    /// Document-level flags, sent as one extras byte when non-empty
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DocFlags: u8 {
        /// Create the document if it does not exist
        const MKDOC = 0x01;
        /// Fail unless the document exists (replace rather than upsert)
        const REPLACE_DOC = 0x02;
        /// Operate on soft-deleted documents too
        const ACCESS_DELETED = 0x04;
    }
}

/// Kind of a single path operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubDocOpKind {
    Get,
    Exists,
    GetCount,
    DictAdd,
    DictSet,
    Delete,
    Replace,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Counter,
    /// Whole-document get, alongside xattr lookups
    GetDoc,
    /// Whole-document set, alongside xattr mutations
    SetDoc,
    AddDoc,
    DeleteDoc,
}

impl SubDocOpKind {
    /// Opcode carried in the per-op header
    pub fn opcode(self) -> Opcode {
        match self {
            SubDocOpKind::Get => Opcode::SubDocGet,
            SubDocOpKind::Exists => Opcode::SubDocExists,
            SubDocOpKind::GetCount => Opcode::SubDocGetCount,
            SubDocOpKind::DictAdd => Opcode::SubDocDictAdd,
            SubDocOpKind::DictSet => Opcode::SubDocDictSet,
            SubDocOpKind::Delete => Opcode::SubDocDelete,
            SubDocOpKind::Replace => Opcode::SubDocReplace,
            SubDocOpKind::ArrayPushLast => Opcode::SubDocArrayPushLast,
            SubDocOpKind::ArrayPushFirst => Opcode::SubDocArrayPushFirst,
            SubDocOpKind::ArrayInsert => Opcode::SubDocArrayInsert,
            SubDocOpKind::ArrayAddUnique => Opcode::SubDocArrayAddUnique,
            SubDocOpKind::Counter => Opcode::SubDocCounter,
            SubDocOpKind::GetDoc => Opcode::Get,
            SubDocOpKind::SetDoc => Opcode::Set,
            SubDocOpKind::AddDoc => Opcode::Add,
            SubDocOpKind::DeleteDoc => Opcode::Delete,
        }
    }

    pub fn from_opcode(opcode: Opcode) -> Option<Self> {
        Some(match opcode {
            Opcode::SubDocGet => SubDocOpKind::Get,
            Opcode::SubDocExists => SubDocOpKind::Exists,
            Opcode::SubDocGetCount => SubDocOpKind::GetCount,
            Opcode::SubDocDictAdd => SubDocOpKind::DictAdd,
            Opcode::SubDocDictSet => SubDocOpKind::DictSet,
            Opcode::SubDocDelete => SubDocOpKind::Delete,
            Opcode::SubDocReplace => SubDocOpKind::Replace,
            Opcode::SubDocArrayPushLast => SubDocOpKind::ArrayPushLast,
            Opcode::SubDocArrayPushFirst => SubDocOpKind::ArrayPushFirst,
            Opcode::SubDocArrayInsert => SubDocOpKind::ArrayInsert,
            Opcode::SubDocArrayAddUnique => SubDocOpKind::ArrayAddUnique,
            Opcode::SubDocCounter => SubDocOpKind::Counter,
            Opcode::Get => SubDocOpKind::GetDoc,
            Opcode::Set => SubDocOpKind::SetDoc,
            Opcode::Add => SubDocOpKind::AddDoc,
            Opcode::Delete => SubDocOpKind::DeleteDoc,
            _ => return None,
        })
    }

    /// Whether the op may appear in a multi-lookup
    pub fn is_lookup(self) -> bool {
        matches!(
            self,
            SubDocOpKind::Get | SubDocOpKind::Exists | SubDocOpKind::GetCount | SubDocOpKind::GetDoc
        )
    }
}

/// One path operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocOp {
    pub kind: SubDocOpKind,
    pub flags: SubDocFlags,
    pub path: String,
    pub value: Bytes,
}

impl SubDocOp {
    pub fn new(kind: SubDocOpKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            flags: SubDocFlags::empty(),
            path: path.into(),
            value: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(SubDocOpKind::Get, path)
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::new(SubDocOpKind::Exists, path)
    }

    pub fn get_count(path: impl Into<String>) -> Self {
        Self::new(SubDocOpKind::GetCount, path)
    }

    pub fn dict_set(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::DictSet, path).with_value(value)
    }

    pub fn dict_add(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::DictAdd, path).with_value(value)
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::Replace, path).with_value(value)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(SubDocOpKind::Delete, path)
    }

    pub fn array_push_last(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::ArrayPushLast, path).with_value(value)
    }

    pub fn array_push_first(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::ArrayPushFirst, path).with_value(value)
    }

    pub fn array_insert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::ArrayInsert, path).with_value(value)
    }

    pub fn array_add_unique(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubDocOpKind::ArrayAddUnique, path).with_value(value)
    }

    /// Add `delta` to a numeric path
    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self::new(SubDocOpKind::Counter, path).with_value(delta.to_string().into_bytes())
    }

    pub fn with_flags(mut self, flags: SubDocFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }
}

/// Outcome of one path operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocResult {
    pub status: StatusCode,

    /// Set when `status` is not success
    pub error: Option<KvError>,

    pub value: Bytes,
}

impl SubDocResult {
    pub fn new(status: StatusCode, value: Bytes) -> Self {
        let error = match status {
            StatusCode::Success => None,
            status => Some(KvError::new(status)),
        };
        Self {
            status,
            error,
            value,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a multi-lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInResult {
    /// One entry per requested op, in request order
    pub results: Vec<SubDocResult>,
    pub cas: u64,
    /// The document is a tombstone (access-deleted lookups)
    pub deleted: bool,
}

/// Result of a multi-mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInResult {
    /// One entry per requested op, in request order
    pub results: Vec<SubDocResult>,
    pub cas: u64,
    pub mutation_token: Option<crate::durability::MutationToken>,
}
