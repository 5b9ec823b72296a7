//! Distributed-coverage key generation
//!
//! Produces one key per node such that each node is the primary owner of
//! exactly one of the keys. Used to exercise per-node behaviour (random gets,
//! stats) from tests and tools.

use crate::error::{MemdError, Result};

use super::TopologySnapshot;

/// Upper bound on candidates tried before giving up
const MAX_CANDIDATES: usize = 1_000_000;

/// Generate `DistKey_{i}` keys, one owned by each node, indexed by node
pub fn make_dist_keys(snapshot: &TopologySnapshot) -> Result<Vec<String>> {
    let num_nodes = snapshot.num_nodes();

    if snapshot.has_vbuckets() {
        let mut owns_vbucket = vec![false; num_nodes];
        for row in snapshot.vbucket_map() {
            if let Some(&primary) = row.first() {
                if primary >= 0 {
                    owns_vbucket[primary as usize] = true;
                }
            }
        }
        if let Some(idle) = owns_vbucket.iter().position(|owned| !owned) {
            return Err(MemdError::Routing(format!(
                "node {} owns no active vbucket",
                idle
            )));
        }
    }

    let mut keys: Vec<Option<String>> = vec![None; num_nodes];
    let mut remaining = num_nodes;

    for i in 0..MAX_CANDIDATES {
        if remaining == 0 {
            break;
        }

        let candidate = format!("DistKey_{}", i);
        let node = if snapshot.has_vbuckets() {
            let vbucket = snapshot.vbucket_by_key(candidate.as_bytes());
            match snapshot.node_by_vbucket(vbucket, 0) {
                Ok(node) => node,
                Err(_) => continue,
            }
        } else {
            snapshot.node_by_key_hash(candidate.as_bytes())
        };

        if keys[node].is_none() {
            keys[node] = Some(candidate);
            remaining -= 1;
        }
    }

    keys.into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| MemdError::Routing("could not cover every node".to_string()))
}
