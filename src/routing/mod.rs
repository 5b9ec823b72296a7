//! Routing Module
//!
//! Maps keys to vbuckets and vbuckets to nodes.
//!
//! ## Responsibilities
//! - Hold the current topology snapshot behind an atomic pointer
//! - Hash keys to vbuckets exactly like the server does
//! - Resolve primary, specific-replica and any-replica targets
//! - Generate per-node coverage keys for tests and tools

mod dist_keys;
mod router;
mod topology;

pub use dist_keys::make_dist_keys;
pub use router::{ReplicaTarget, Route, Router};
pub use topology::{BucketType, TopologySnapshot};
