//! # memdcore
//!
//! Binary-protocol client core for a vbucket-partitioned key-value store:
//! - Key → vbucket → node routing over hot-swappable topology snapshots
//! - One multiplexed pipeline per node, responses correlated by opaque
//! - Status translation with error-map driven retries
//! - Sub-document lookups and mutations, including extended attributes
//! - Observe / observe-seqno durability polling
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Agent                                 │
//! │        (dispatcher: encode, route, retry, complete)          │
//! └──────────┬──────────────────────────────┬───────────────────┘
//!            │                              │
//!            ▼                              ▼
//!   ┌─────────────────┐            ┌─────────────────┐
//!   │     Router      │            │   Translator    │
//!   │   (ArcSwap)     │            │ (status, errmap)│
//!   └────────┬────────┘            └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │    Pipeline     │  one per node: supervisor + reader thread
//!   │ (pending table) │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │   Wire Codec    │  24-byte header + extras/key/value
//!   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

#[macro_use]
mod macros;

pub mod config;
pub mod error;

pub mod agent;
pub mod completion;
pub mod durability;
pub mod mock;
pub mod pipeline;
pub mod protocol;
pub mod routing;
pub mod status;
pub mod subdoc;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use agent::{Agent, CounterResult, GetResult, RandomResult, SingleServerStats, StoreResult};
pub use completion::{PendingOp, Waiter};
pub use config::{AuthHandler, Config, ConfigBuilder, Credentials};
pub use durability::{KeyState, MutationToken, ObserveResult, ObserveSeqNoResult};
pub use error::{KvError, MemdError, Result};
pub use routing::{make_dist_keys, BucketType, ReplicaTarget, TopologySnapshot};
pub use status::{ErrorKind, StatusCode};
pub use subdoc::{DocFlags, LookupInResult, MutateInResult, SubDocFlags, SubDocOp};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of memdcore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
