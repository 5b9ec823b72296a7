//! Error types for memdcore
//!
//! Provides a unified error type for all client operations. Server status
//! codes are carried by [`KvError`]; everything else (transport, framing,
//! routing, client-side validation) has its own variant.

use std::fmt;

use thiserror::Error;

use crate::status::{ErrorKind, StatusCode};

/// Result type alias using MemdError
pub type Result<T> = std::result::Result<T, MemdError>;

/// Unified error type for memdcore operations
#[derive(Debug, Error)]
pub enum MemdError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Server Status Errors
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A CAS-conditioned mutation found a different stored CAS
    #[error("CAS mismatch")]
    CasMismatch(Option<KvError>),

    /// One path of an atomic multi-mutation failed; nothing was applied
    #[error("Sub-document path {index} failed: {error}")]
    SubDocPathFailure { index: usize, error: KvError },

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Operation timed out")]
    Timeout,

    #[error("Connection lost to {0}")]
    ConnectionLost(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client is shut down")]
    Shutdown,

    // -------------------------------------------------------------------------
    // Routing Errors
    // -------------------------------------------------------------------------
    #[error("Replica {0} is not available")]
    ReplicaUnavailable(u32),

    #[error("Routing error: {0}")]
    Routing(String),

    // -------------------------------------------------------------------------
    // Client-side Errors
    // -------------------------------------------------------------------------
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MemdError {
    /// The semantic kind of this error, if it maps onto the status taxonomy
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            MemdError::Kv(e) => Some(e.kind),
            MemdError::CasMismatch(_) => Some(ErrorKind::CasMismatch),
            MemdError::SubDocPathFailure { error, .. } => Some(error.kind),
            MemdError::NotSupported(_) => Some(ErrorKind::NotSupported),
            _ => None,
        }
    }

    /// Whether the key (or document) did not exist
    pub fn is_key_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::KeyNotFound)
    }

    /// Whether the key already existed (add on an existing key)
    pub fn is_key_exists(&self) -> bool {
        self.kind() == Some(ErrorKind::KeyExists)
    }

    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, MemdError::CasMismatch(_))
    }

    /// Whether this error was produced by the given server status
    pub fn is_status(&self, status: StatusCode) -> bool {
        match self {
            MemdError::Kv(e) => e.status == status,
            MemdError::CasMismatch(Some(e)) => e.status == status,
            MemdError::SubDocPathFailure { error, .. } => error.status == status,
            _ => false,
        }
    }

    /// Whether the operation can be safely retried by the caller
    pub fn is_retryable(&self) -> bool {
        match self {
            MemdError::Kv(e) => e.kind.retry_class().is_retryable(),
            MemdError::Timeout | MemdError::ConnectionLost(_) => true,
            _ => false,
        }
    }
}

/// A server status error, optionally decorated with enhanced error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvError {
    /// Raw status returned by the server
    pub status: StatusCode,

    /// Semantic classification of the status
    pub kind: ErrorKind,

    /// Enhanced error context (`error.context` in the response body)
    pub context: Option<String>,

    /// Enhanced error reference (`error.ref` in the response body)
    pub reference: Option<String>,

    /// Name from the negotiated error map
    pub name: Option<String>,

    /// Description from the negotiated error map
    pub description: Option<String>,
}

impl KvError {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            kind: crate::status::translate(status),
            context: None,
            reference: None,
            name: None,
            description: None,
        }
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{} (0x{:02x})", desc, self.status.code())?,
            None => write!(f, "{:?} (0x{:02x})", self.kind, self.status.code())?,
        }
        if let Some(context) = &self.context {
            write!(f, ", context: {}", context)?;
        }
        if let Some(reference) = &self.reference {
            write!(f, ", ref: {}", reference)?;
        }
        Ok(())
    }
}

impl std::error::Error for KvError {}
