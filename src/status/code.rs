//! Status code table and semantic classification

code_table! {
    /// Response status codes
    pub enum StatusCode: u16 {
        Success = 0x00,
        KeyNotFound = 0x01,
        KeyExists = 0x02,
        TooBig = 0x03,
        InvalidArgs = 0x04,
        NotStored = 0x05,
        BadDelta = 0x06,
        NotMyVbucket = 0x07,
        NoBucket = 0x08,
        Locked = 0x09,
        AuthStale = 0x1f,
        AuthError = 0x20,
        AuthContinue = 0x21,
        RangeError = 0x22,
        Rollback = 0x23,
        AccessError = 0x24,
        NotInitialized = 0x25,
        UnknownCommand = 0x81,
        OutOfMemory = 0x82,
        NotSupported = 0x83,
        InternalError = 0x84,
        Busy = 0x85,
        TmpFail = 0x86,
        SubDocPathNotFound = 0xc0,
        SubDocPathMismatch = 0xc1,
        SubDocPathInvalid = 0xc2,
        SubDocPathTooBig = 0xc3,
        SubDocDocTooDeep = 0xc4,
        SubDocCantInsert = 0xc5,
        SubDocNotJson = 0xc6,
        SubDocBadRange = 0xc7,
        SubDocBadDelta = 0xc8,
        SubDocPathExists = 0xc9,
        SubDocValueTooDeep = 0xca,
        SubDocBadCombo = 0xcb,
        SubDocBadMulti = 0xcc,
        SubDocSuccessDeleted = 0xcd,
        SubDocXattrInvalidFlagCombo = 0xce,
        SubDocXattrInvalidKeyCombo = 0xcf,
        SubDocXattrUnknownMacro = 0xd0,
        SubDocXattrUnknownVAttr = 0xd1,
        SubDocXattrCannotModifyVAttr = 0xd2,
        SubDocMultiPathFailureDeleted = 0xd3,
    }
}

/// Semantic error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Success,
    KeyNotFound,
    KeyExists,
    /// A CAS precondition did not match the stored CAS
    CasMismatch,
    TooBig,
    InvalidArguments,
    NotStored,
    BadDelta,
    /// The node does not own the addressed vbucket
    WrongPartitionOwner,
    NoBucketSelected,
    Locked,
    StaleAuth,
    AuthFailed,
    AuthContinue,
    RangeError,
    RollbackRequired,
    AccessDenied,
    NotYetInitialized,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    SubDocPathNotFound,
    SubDocPathMismatch,
    SubDocPathInvalid,
    SubDocPathTooBig,
    SubDocDocTooDeep,
    SubDocCantInsert,
    SubDocNotJson,
    SubDocBadRange,
    SubDocBadDelta,
    SubDocPathExists,
    SubDocValueTooDeep,
    SubDocBadCombo,
    SubDocMultiPathFailure,
    SubDocSuccessDeleted,
    SubDocXattrInvalidFlagCombo,
    SubDocXattrInvalidKeyCombo,
    SubDocXattrUnknownMacro,
    SubDocXattrUnknownVAttr,
    SubDocXattrCannotModifyVAttr,
    SubDocMultiPathFailureDeleted,
    /// A status outside the known table
    Unknown,
}

/// How a failed attempt may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Surface to the caller unchanged
    Terminal,
    /// Safe to resend to the same node after a delay
    AfterDelay,
    /// Resend only after re-routing against a fresher topology
    AfterTopologyRefresh,
}

impl RetryClass {
    pub fn is_retryable(self) -> bool {
        self != RetryClass::Terminal
    }
}

/// Map a status code onto its semantic kind
pub fn translate(status: StatusCode) -> ErrorKind {
    use StatusCode as S;

    match status {
        S::Success => ErrorKind::Success,
        S::KeyNotFound => ErrorKind::KeyNotFound,
        S::KeyExists => ErrorKind::KeyExists,
        S::TooBig => ErrorKind::TooBig,
        S::InvalidArgs => ErrorKind::InvalidArguments,
        S::NotStored => ErrorKind::NotStored,
        S::BadDelta => ErrorKind::BadDelta,
        S::NotMyVbucket => ErrorKind::WrongPartitionOwner,
        S::NoBucket => ErrorKind::NoBucketSelected,
        S::Locked => ErrorKind::Locked,
        S::AuthStale => ErrorKind::StaleAuth,
        S::AuthError => ErrorKind::AuthFailed,
        S::AuthContinue => ErrorKind::AuthContinue,
        S::RangeError => ErrorKind::RangeError,
        S::Rollback => ErrorKind::RollbackRequired,
        S::AccessError => ErrorKind::AccessDenied,
        S::NotInitialized => ErrorKind::NotYetInitialized,
        S::UnknownCommand => ErrorKind::UnknownCommand,
        S::OutOfMemory => ErrorKind::OutOfMemory,
        S::NotSupported => ErrorKind::NotSupported,
        S::InternalError => ErrorKind::InternalError,
        S::Busy => ErrorKind::Busy,
        S::TmpFail => ErrorKind::TemporaryFailure,
        S::SubDocPathNotFound => ErrorKind::SubDocPathNotFound,
        S::SubDocPathMismatch => ErrorKind::SubDocPathMismatch,
        S::SubDocPathInvalid => ErrorKind::SubDocPathInvalid,
        S::SubDocPathTooBig => ErrorKind::SubDocPathTooBig,
        S::SubDocDocTooDeep => ErrorKind::SubDocDocTooDeep,
        S::SubDocCantInsert => ErrorKind::SubDocCantInsert,
        S::SubDocNotJson => ErrorKind::SubDocNotJson,
        S::SubDocBadRange => ErrorKind::SubDocBadRange,
        S::SubDocBadDelta => ErrorKind::SubDocBadDelta,
        S::SubDocPathExists => ErrorKind::SubDocPathExists,
        S::SubDocValueTooDeep => ErrorKind::SubDocValueTooDeep,
        S::SubDocBadCombo => ErrorKind::SubDocBadCombo,
        S::SubDocBadMulti => ErrorKind::SubDocMultiPathFailure,
        S::SubDocSuccessDeleted => ErrorKind::SubDocSuccessDeleted,
        S::SubDocXattrInvalidFlagCombo => ErrorKind::SubDocXattrInvalidFlagCombo,
        S::SubDocXattrInvalidKeyCombo => ErrorKind::SubDocXattrInvalidKeyCombo,
        S::SubDocXattrUnknownMacro => ErrorKind::SubDocXattrUnknownMacro,
        S::SubDocXattrUnknownVAttr => ErrorKind::SubDocXattrUnknownVAttr,
        S::SubDocXattrCannotModifyVAttr => ErrorKind::SubDocXattrCannotModifyVAttr,
        S::SubDocMultiPathFailureDeleted => ErrorKind::SubDocMultiPathFailureDeleted,
        S::Other(_) => ErrorKind::Unknown,
    }
}

impl ErrorKind {
    /// Default retry classification, used when no error map hint applies
    pub fn retry_class(self) -> RetryClass {
        match self {
            ErrorKind::Busy | ErrorKind::TemporaryFailure => RetryClass::AfterDelay,
            ErrorKind::WrongPartitionOwner
            | ErrorKind::NotYetInitialized
            | ErrorKind::RollbackRequired => RetryClass::AfterTopologyRefresh,
            _ => RetryClass::Terminal,
        }
    }

    /// Whether this kind is a per-path sub-document failure
    pub fn is_subdoc_path_error(self) -> bool {
        matches!(
            self,
            ErrorKind::SubDocPathNotFound
                | ErrorKind::SubDocPathMismatch
                | ErrorKind::SubDocPathInvalid
                | ErrorKind::SubDocPathTooBig
                | ErrorKind::SubDocDocTooDeep
                | ErrorKind::SubDocCantInsert
                | ErrorKind::SubDocNotJson
                | ErrorKind::SubDocBadRange
                | ErrorKind::SubDocBadDelta
                | ErrorKind::SubDocPathExists
                | ErrorKind::SubDocValueTooDeep
        )
    }
}
