//! KV error map
//!
//! A node may publish a JSON error map (GET_ERROR_MAP, version 1) that names
//! each status, lists behavioural attributes and optionally prescribes a retry
//! strategy. When present it takes precedence over the built-in table.
//!
//! ```json
//! {
//!   "version": 1,
//!   "revision": 1,
//!   "errors": {
//!     "86": {
//!       "name": "ETMPFAIL",
//!       "desc": "Temporary failure",
//!       "attrs": ["temp", "retry-later"],
//!       "retry": { "strategy": "exponential", "interval": 10, "after": 100,
//!                  "ceil": 1000, "max-duration": 5000 }
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MemdError, Result};

use super::StatusCode;

/// Error map format version requested from the server
pub const ERROR_MAP_VERSION: u16 = 1;

/// Backoff curve of a retry spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Constant,
    Linear,
    Exponential,
}

/// Retry prescription attached to an error map entry (milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetrySpec {
    pub strategy: RetryStrategy,

    /// Base interval between attempts
    #[serde(default)]
    pub interval: u64,

    /// Delay before the first retry
    #[serde(default)]
    pub after: u64,

    /// Upper bound of a single delay (0 = unbounded)
    #[serde(default)]
    pub ceil: u64,

    /// Total time after which retrying stops (0 = until the op deadline)
    #[serde(default, rename = "max-duration")]
    pub max_duration: u64,
}

impl RetrySpec {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = if attempt == 1 && self.after > 0 {
            self.after
        } else {
            match self.strategy {
                RetryStrategy::Constant => self.interval,
                RetryStrategy::Linear => self.interval.saturating_mul(attempt as u64),
                RetryStrategy::Exponential => {
                    let shift = (attempt - 1).min(32);
                    self.interval.saturating_mul(1u64 << shift)
                }
            }
        };

        let ms = if self.ceil > 0 { ms.min(self.ceil) } else { ms };
        Duration::from_millis(ms)
    }

    /// Whether retrying is still allowed after `elapsed` since the first attempt
    pub fn allows(&self, elapsed: Duration) -> bool {
        self.max_duration == 0 || elapsed < Duration::from_millis(self.max_duration)
    }
}

/// One error map entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMapEntry {
    pub name: String,

    #[serde(default, rename = "desc")]
    pub description: String,

    #[serde(default)]
    pub attrs: Vec<String>,

    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl ErrorMapEntry {
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorMap {
    version: u16,
    revision: u32,
    errors: HashMap<String, ErrorMapEntry>,
}

/// Parsed error map, keyed by status code
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    pub version: u16,
    pub revision: u32,
    entries: HashMap<u16, ErrorMapEntry>,
}

impl ErrorMap {
    /// Parse the JSON document returned by GET_ERROR_MAP
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawErrorMap = serde_json::from_slice(bytes)
            .map_err(|e| MemdError::Protocol(format!("Invalid error map: {}", e)))?;

        let mut entries = HashMap::with_capacity(raw.errors.len());
        for (code, entry) in raw.errors {
            let code = u16::from_str_radix(&code, 16).map_err(|_| {
                MemdError::Protocol(format!("Invalid error map status code: {:?}", code))
            })?;
            entries.insert(code, entry);
        }

        Ok(Self {
            version: raw.version,
            revision: raw.revision,
            entries,
        })
    }

    pub fn get(&self, status: StatusCode) -> Option<&ErrorMapEntry> {
        self.entries.get(&status.code())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
