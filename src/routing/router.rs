//! Vbucket router
//!
//! Resolves a key to its vbucket and to the node serving a given copy of that
//! vbucket. Lookups never block: the current snapshot is loaded through an
//! atomic pointer and a concurrent [`Router::install`] is never half-visible.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;

use crate::error::{MemdError, Result};

use super::TopologySnapshot;

/// Which copy of a vbucket a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaTarget {
    Primary,
    /// The n-th replica (1-based)
    Replica(u32),
    /// Any replica currently believed alive
    AnyReplica,
}

impl ReplicaTarget {
    /// Interpret a replica index the way the public API does: 0 = any
    pub fn from_replica_index(index: u32) -> Self {
        match index {
            0 => ReplicaTarget::AnyReplica,
            n => ReplicaTarget::Replica(n),
        }
    }
}

/// A resolved routing decision, pinned to the snapshot it was made against
#[derive(Debug, Clone)]
pub struct Route {
    pub vbucket: u16,
    pub node: usize,
    pub snapshot: Arc<TopologySnapshot>,
}

impl Route {
    /// Address of the chosen node
    pub fn address(&self) -> &str {
        &self.snapshot.nodes()[self.node]
    }
}

/// Key → node router over the latest installed snapshot
pub struct Router {
    snapshot: ArcSwap<TopologySnapshot>,
}

impl Router {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replace the snapshot
    ///
    /// A snapshot carrying an older non-zero revision than the installed one
    /// is ignored; returns whether the new snapshot was installed.
    pub fn install(&self, snapshot: TopologySnapshot) -> bool {
        let current = self.snapshot.load();
        if snapshot.revision() != 0 && snapshot.revision() < current.revision() {
            tracing::debug!(
                "Ignoring topology rev {} (have rev {})",
                snapshot.revision(),
                current.revision()
            );
            return false;
        }
        self.snapshot.store(Arc::new(snapshot));
        true
    }

    /// Route a key to the node serving the requested copy
    ///
    /// `alive` reports whether a node index is currently usable; it only
    /// narrows the choice for [`ReplicaTarget::AnyReplica`].
    pub fn route(
        &self,
        key: &[u8],
        target: ReplicaTarget,
        alive: impl Fn(usize) -> bool,
    ) -> Result<Route> {
        let snapshot = self.snapshot.load_full();

        if !snapshot.has_vbuckets() {
            if target != ReplicaTarget::Primary {
                return Err(MemdError::NotSupported(
                    "replicas are not available on cache-only buckets".to_string(),
                ));
            }
            let node = snapshot.node_by_key_hash(key);
            return Ok(Route {
                vbucket: 0,
                node,
                snapshot,
            });
        }

        let vbucket = snapshot.vbucket_by_key(key);
        let node = match target {
            ReplicaTarget::Primary => snapshot.node_by_vbucket(vbucket, 0)?,
            ReplicaTarget::Replica(n) => snapshot.node_by_vbucket(vbucket, n)?,
            ReplicaTarget::AnyReplica => {
                let candidates: Vec<usize> = (1..=snapshot.num_replicas() as u32)
                    .filter_map(|r| snapshot.node_by_vbucket(vbucket, r).ok())
                    .filter(|&ix| alive(ix))
                    .collect();
                *candidates
                    .choose(&mut rand::thread_rng())
                    .ok_or(MemdError::ReplicaUnavailable(0))?
            }
        };

        Ok(Route {
            vbucket,
            node,
            snapshot,
        })
    }

    /// Route to the node serving `vbucket` directly
    pub fn route_vbucket(&self, vbucket: u16, replica: u32) -> Result<Route> {
        let snapshot = self.snapshot.load_full();
        let node = snapshot.node_by_vbucket(vbucket, replica)?;
        Ok(Route {
            vbucket,
            node,
            snapshot,
        })
    }
}
