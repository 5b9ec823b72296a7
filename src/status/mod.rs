//! Status Module
//!
//! Maps numeric response status codes onto a semantic error taxonomy and a
//! retry classification.
//!
//! ## Retry Classes
//! - Busy, TmpFail → retry after a delay
//! - NotMyVbucket, NotInitialized, Rollback → retry after re-routing
//! - everything else → terminal for the attempt
//!
//! A negotiated error map may override the delay or the class per status.

mod code;
mod error_map;
mod translator;

pub use code::{translate, ErrorKind, RetryClass, StatusCode};
pub use error_map::{ErrorMap, ErrorMapEntry, RetrySpec, RetryStrategy, ERROR_MAP_VERSION};
pub use translator::{parse_enhanced_error, RetryDecision, Translator};
